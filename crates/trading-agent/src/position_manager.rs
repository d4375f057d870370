use std::sync::Arc;
use std::time::Instant;

use analysis_core::PriceDataProvider;
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use market_regime_detector::{MarketRegime, MarketRegimeClassifier};
use notification_service::{NotificationService, PositionEvent};
use portfolio_manager::{
    profit_rate, PartialSaleRecord, PartialSaleTracker, PerformanceMetrics, PortfolioSummary,
    Position, PositionStatus, PositionStore, TradeRecord, WatchlistEntry,
};
use risk_manager::RiskParameterCalculator;
use rust_decimal::prelude::ToPrimitive;
use technical_analysis::{TrendAnalyzer, VolatilityEstimator};

use crate::config::AgentConfig;
use crate::entry_gate::{EntryContext, EntryRules};
use crate::exit_rules::{ExitAction, ExitContext, ExitDecision, ExitRules};
use crate::metrics::CycleMetrics;
use crate::portfolio_guard::SlotCapacityManager;
use crate::session::Clock;
use crate::trade_executor::{ExecutionOutcome, OrderExecutor, OrderResult};
use crate::types::{RawScenario, RiskAdjustmentProposal, Scenario, Urgency};

/// Runs one evaluation cycle at a time: stamp the regime, walk every open
/// position through the exit rules, then gate and execute new entries.
///
/// The regime is classified once per cycle and passed down by value; nothing
/// here keeps market state between cycles apart from the volatility cache
/// and buys whose outcome the broker never confirmed.
pub struct PositionDecisionEngine {
    store: Arc<dyn PositionStore>,
    executor: Arc<OrderExecutor>,
    notifier: NotificationService,
    classifier: MarketRegimeClassifier,
    trend: TrendAnalyzer,
    risk: RiskParameterCalculator,
    slots: SlotCapacityManager,
    entry_rules: EntryRules,
    exit_rules: ExitRules,
    tracker: PartialSaleTracker,
    exit_trend_days: i64,
    /// Timed-out buys, checked against holdings at the start of the next cycle.
    unconfirmed_buys: DashMap<String, Scenario>,
}

impl PositionDecisionEngine {
    pub fn from_config(
        config: &AgentConfig,
        prices: Arc<dyn PriceDataProvider>,
        store: Arc<dyn PositionStore>,
        executor: Arc<OrderExecutor>,
        notifier: NotificationService,
    ) -> Result<Self> {
        let [broad, growth] = match config.benchmark_indices.as_slice() {
            [a, b] => [a.clone(), b.clone()],
            other => return Err(anyhow!("expected 2 benchmark indices, got {}", other.len())),
        };

        let volatility = Arc::new(
            VolatilityEstimator::new(prices.clone()).with_window_days(config.volatility_window_days),
        );
        let tracker = PartialSaleTracker::new(config.partial_sell_ratio)?;

        Ok(Self {
            store,
            executor,
            notifier,
            classifier: MarketRegimeClassifier::new(prices.clone())
                .with_benchmarks(broad, growth)
                .with_window_days(config.regime_window_days),
            trend: TrendAnalyzer::new(prices).with_window_days(config.trend_window_days),
            risk: RiskParameterCalculator::new(volatility),
            slots: config.slot_manager(),
            entry_rules: config.entry_rules(),
            exit_rules: config.exit_rules(),
            tracker,
            exit_trend_days: config.exit_trend_window_days,
            unconfirmed_buys: DashMap::new(),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.executor.clock().now()
    }

    pub fn slots(&self) -> &SlotCapacityManager {
        &self.slots
    }

    pub async fn run_cycle(&self, scenarios: Vec<RawScenario>) -> Result<CycleMetrics> {
        let started = Instant::now();
        let mut metrics = CycleMetrics::default();
        let today = self.executor.router().local_date(self.now());

        let estimate = self.classifier.classify(today).await;
        metrics.regime_fallback = estimate.is_fallback();
        let regime = estimate.into_value();
        metrics.regime = Some(regime.classification);
        if let Err(e) = self.store.record_regime(&regime).await {
            tracing::warn!("Could not persist regime for {}: {}", today, e);
        }

        self.reconcile_unconfirmed_buys(&regime, today, &mut metrics)
            .await?;

        for position in self.store.active_positions().await? {
            metrics.positions_reviewed += 1;
            self.review_position(position, &regime, today, &mut metrics)
                .await?;
        }

        for raw in scenarios {
            self.consider_entry(raw, &regime, today, &mut metrics).await?;
        }

        metrics.finish(started);
        metrics.log();
        Ok(metrics)
    }

    async fn review_position(
        &self,
        mut position: Position,
        regime: &MarketRegime,
        today: NaiveDate,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let ticker = position.ticker.clone();

        match self.executor.quote(&ticker).await {
            Ok(quote) => position.refresh_price(quote.price_f64(), self.now()),
            Err(e) => tracing::warn!(
                "{}: quote unavailable, evaluating at last price {:.0}: {}",
                ticker,
                position.current_price,
                e
            ),
        }

        if position.target_price <= 0.0 || position.stop_loss <= 0.0 {
            match self
                .risk
                .levels_for(&ticker, position.entry_price, regime.classification, today)
                .await
            {
                Ok(levels) => {
                    let levels = levels.into_value();
                    if position.backfill_risk_levels(levels.target_price, levels.stop_loss) {
                        tracing::info!(
                            "{}: filled missing levels, target {:.0}, stop {:.0}",
                            ticker,
                            position.target_price,
                            position.stop_loss
                        );
                    }
                }
                Err(e) => tracing::warn!("{}: could not derive risk levels: {}", ticker, e),
            }
        }
        self.store.save_position(&position).await?;

        let partial = match self.store.get_partial_sale(&ticker).await? {
            Some(record) => record,
            None => {
                let record = PartialSaleRecord::new(&ticker, position.entry_price);
                self.store.save_partial_sale(&record).await?;
                record
            }
        };

        let trend = self
            .trend
            .analyze_window(&ticker, today, self.exit_trend_days)
            .await;
        let decision = self.exit_rules.evaluate(&ExitContext {
            position: &position,
            partial: &partial,
            trend,
            regime: regime.classification,
            now: self.now(),
        });

        match decision.action {
            ExitAction::Hold => {
                metrics.holds += 1;
                tracing::info!(
                    "{} hold @ {:.0} ({:+.2}%): {}",
                    ticker,
                    position.current_price,
                    position.profit_rate(),
                    decision.reason
                );
                Ok(())
            }
            ExitAction::PartialSell { fraction } => {
                self.execute_partial(position, partial, fraction, decision, metrics)
                    .await
            }
            ExitAction::Close => self.execute_close(position, partial, decision, metrics).await,
        }
    }

    async fn execute_partial(
        &self,
        mut position: Position,
        mut partial: PartialSaleRecord,
        fraction: f64,
        decision: ExitDecision,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let result = self.executor.sell_partial(&position.ticker, fraction).await;
        if !result.success {
            if result.outcome == ExecutionOutcome::NothingToSell {
                return self
                    .reconcile_missing_holding(position, partial, decision, metrics)
                    .await;
            }
            self.report_unfilled(&result, metrics).await;
            return Ok(());
        }

        let price = result.fill_price.unwrap_or(position.current_price);
        if result.held_quantity > 0 && result.filled_quantity >= result.held_quantity {
            tracing::info!(
                "{}: partial sell took all {} remaining shares, closing",
                position.ticker,
                result.held_quantity
            );
            return self
                .book_close(position, partial, price, decision.reason, metrics)
                .await;
        }

        // Book what the broker actually sold, not the configured ratio.
        let sold = if result.held_quantity > 0 {
            result.filled_quantity as f64 / result.held_quantity as f64
        } else {
            fraction
        };
        let now = self.now();
        self.tracker.record_sale(&mut partial, sold, price, now)?;
        self.store.save_partial_sale(&partial).await?;

        if position.status == PositionStatus::Open {
            position.transition(PositionStatus::PartiallyClosed)?;
        }
        position.refresh_price(price, now);
        self.store.save_position(&position).await?;
        metrics.partial_sells += 1;

        self.notifier
            .notify(PositionEvent::PartialSell {
                ticker: position.ticker.clone(),
                company_name: position.company_name.clone(),
                quantity: result.filled_quantity,
                price,
                profit_rate: profit_rate(position.entry_price, price),
                remaining_ratio: partial.remaining_quantity / partial.initial_quantity,
                reason: decision.reason,
            })
            .await;
        Ok(())
    }

    async fn execute_close(
        &self,
        position: Position,
        partial: PartialSaleRecord,
        decision: ExitDecision,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let result = self.executor.sell_all(&position.ticker).await;
        if !result.success {
            if result.outcome == ExecutionOutcome::NothingToSell {
                return self
                    .reconcile_missing_holding(position, partial, decision, metrics)
                    .await;
            }
            self.report_unfilled(&result, metrics).await;
            return Ok(());
        }

        let price = result.fill_price.unwrap_or(position.current_price);
        self.book_close(position, partial, price, decision.reason, metrics)
            .await
    }

    async fn book_close(
        &self,
        mut position: Position,
        mut partial: PartialSaleRecord,
        price: f64,
        reason: String,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let now = self.now();
        if let Err(e) = self.tracker.record_full_exit(&mut partial, price, now) {
            tracing::debug!("{}: {}", position.ticker, e);
        }

        position.refresh_price(price, now);
        position.transition(PositionStatus::Closed)?;
        let trade = TradeRecord::from_position(&position, price, now, reason.clone());
        self.store.close_position(&position.ticker, &trade).await?;
        metrics.closes += 1;
        metrics.realized_returns.push(trade.profit_rate);

        self.notifier
            .notify(PositionEvent::Closed {
                ticker: trade.ticker,
                company_name: trade.company_name,
                exit_price: price,
                profit_rate: trade.profit_rate,
                holding_days: trade.holding_days,
                reason,
            })
            .await;
        Ok(())
    }

    /// The executor found nothing to sell. If a fresh holdings read agrees,
    /// the stored position is closed at the last known price so it stops
    /// occupying a slot.
    async fn reconcile_missing_holding(
        &self,
        position: Position,
        partial: PartialSaleRecord,
        decision: ExitDecision,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let ticker = position.ticker.clone();
        match self.executor.holding(&ticker).await {
            Ok(Some(h)) if h.quantity > 0 => {
                tracing::warn!(
                    "{}: executor found nothing to sell but the broker holds {}; retrying next cycle",
                    ticker,
                    h.quantity
                );
                Ok(())
            }
            Ok(_) => {
                tracing::warn!(
                    "{}: no shares held at the broker, closing the stored position @ {:.0}",
                    ticker,
                    position.current_price
                );
                metrics.reconciled += 1;
                let price = position.current_price;
                let reason = format!("{} (reconciled: no shares held at broker)", decision.reason);
                self.book_close(position, partial, price, reason, metrics)
                    .await
            }
            Err(e) => {
                tracing::warn!("{}: holdings unavailable, cannot reconcile: {}", ticker, e);
                Ok(())
            }
        }
    }

    /// Adopt shares from buys that timed out but were filled anyway. A buy
    /// with no matching holding is dropped; a failed read is retried next cycle.
    async fn reconcile_unconfirmed_buys(
        &self,
        regime: &MarketRegime,
        today: NaiveDate,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let tickers: Vec<String> = self
            .unconfirmed_buys
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for ticker in tickers {
            let holding = match self.executor.holding(&ticker).await {
                Ok(h) => h.filter(|h| h.quantity > 0),
                Err(e) => {
                    tracing::warn!("{}: holdings unavailable, buy stays unconfirmed: {}", ticker, e);
                    continue;
                }
            };
            let Some((_, scenario)) = self.unconfirmed_buys.remove(&ticker) else {
                continue;
            };
            let Some(holding) = holding else {
                tracing::info!("{}: timed-out buy was never filled", ticker);
                continue;
            };
            if let Some(existing) = self.store.get_position(&ticker).await? {
                if existing.is_active() {
                    continue;
                }
            }

            let entry_price = holding
                .avg_price
                .to_f64()
                .filter(|p| *p > 0.0)
                .unwrap_or(scenario.current_price);
            tracing::warn!(
                "{}: timed-out buy was filled x{} @ {:.0}, adopting it",
                ticker,
                holding.quantity,
                entry_price
            );
            metrics.reconciled += 1;
            self.record_entry(&scenario, entry_price, holding.quantity, regime, today, metrics)
                .await?;
        }
        Ok(())
    }

    async fn consider_entry(
        &self,
        raw: RawScenario,
        regime: &MarketRegime,
        today: NaiveDate,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let scenario = match raw.validate() {
            Ok(s) => s,
            Err(e) => {
                metrics.invalid_scenarios += 1;
                tracing::warn!("Dropped scenario: {}", e);
                return Ok(());
            }
        };

        let active = self.store.active_positions().await?;
        // A caller's "not diverse" verdict stands; otherwise check the book ourselves.
        let sector_diverse = scenario.sector_diversity.unwrap_or(true)
            && self.slots.sector_diversity(&scenario.sector, &active);

        let verdict = self.entry_rules.evaluate(&EntryContext {
            scenario: &scenario,
            regime: regime.classification,
            sector_diverse,
            already_held: active.iter().any(|p| p.ticker == scenario.ticker),
            open_positions: active.len(),
            capacity: self.slots.effective_capacity(scenario.max_portfolio_size),
        });
        if let Some(rejection) = verdict.rejection {
            return self
                .skip(&scenario, verdict.min_score, rejection.to_string(), metrics)
                .await;
        }

        let result = self.executor.buy(&scenario.ticker, None).await;
        if !result.success {
            if result.outcome == ExecutionOutcome::Timeout {
                self.unconfirmed_buys
                    .insert(scenario.ticker.clone(), scenario.clone());
            }
            if result.outcome.is_failure() {
                self.report_unfilled(&result, metrics).await;
                return Ok(());
            }
            return self
                .skip(&scenario, verdict.min_score, result.message, metrics)
                .await;
        }

        let entry_price = result.fill_price.unwrap_or(scenario.current_price);
        self.record_entry(
            &scenario,
            entry_price,
            result.filled_quantity,
            regime,
            today,
            metrics,
        )
        .await
    }

    async fn record_entry(
        &self,
        scenario: &Scenario,
        entry_price: f64,
        quantity: u64,
        regime: &MarketRegime,
        today: NaiveDate,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let (target_price, stop_loss) = self.entry_levels(scenario, entry_price, regime, today).await;
        let position = Position::open(
            &scenario.ticker,
            &scenario.company_name,
            entry_price,
            self.now(),
            target_price,
            stop_loss,
            scenario.snapshot(),
        );
        let record = PartialSaleRecord::new(&scenario.ticker, entry_price);
        if let Err(e) = self.store.open_position(&position, &record).await {
            tracing::error!(
                "{} bought x{} but the position was not recorded; reconcile holdings: {}",
                scenario.ticker,
                quantity,
                e
            );
            return Err(e.into());
        }
        metrics.entries_accepted += 1;

        let trend = self.trend.analyze(&scenario.ticker, today).await;
        tracing::info!(
            "Opened {} x{} @ {:.0}, target {:.0}, stop {:.0}, trend {}",
            scenario.ticker,
            quantity,
            entry_price,
            target_price,
            stop_loss,
            trend
        );

        self.notifier
            .notify(PositionEvent::Opened {
                ticker: position.ticker,
                company_name: position.company_name,
                entry_price,
                quantity,
                target_price,
                stop_loss,
                sector: scenario.sector.clone(),
            })
            .await;
        Ok(())
    }

    /// Caller-supplied nonzero levels win; the calculator fills the rest.
    async fn entry_levels(
        &self,
        scenario: &Scenario,
        entry_price: f64,
        regime: &MarketRegime,
        today: NaiveDate,
    ) -> (f64, f64) {
        let mut target = scenario.target_price;
        let mut stop = scenario.stop_loss;
        if target > 0.0 && stop > 0.0 {
            return (target, stop);
        }

        match self
            .risk
            .levels_for(&scenario.ticker, entry_price, regime.classification, today)
            .await
        {
            Ok(levels) => {
                let levels = levels.into_value();
                if target <= 0.0 {
                    target = levels.target_price;
                }
                if stop <= 0.0 {
                    stop = levels.stop_loss;
                }
            }
            Err(e) => tracing::warn!(
                "{}: no risk levels at entry, retrying next cycle: {}",
                scenario.ticker,
                e
            ),
        }
        (target, stop)
    }

    async fn skip(
        &self,
        scenario: &Scenario,
        min_score: f64,
        reason: String,
        metrics: &mut CycleMetrics,
    ) -> Result<()> {
        let entry = WatchlistEntry {
            ticker: scenario.ticker.clone(),
            company_name: scenario.company_name.clone(),
            current_price: scenario.current_price,
            analyzed_at: self.now(),
            buy_score: scenario.effective_score(),
            min_score,
            decision: scenario.decision.to_string(),
            skip_reason: reason.clone(),
            target_price: scenario.target_price,
            stop_loss: scenario.stop_loss,
            scenario: scenario.snapshot(),
        };
        if let Err(e) = self.store.record_watchlist(&entry).await {
            tracing::warn!("{}: watchlist not recorded: {}", scenario.ticker, e);
        }
        metrics.entries_skipped += 1;

        self.notifier
            .notify(PositionEvent::Skipped {
                ticker: entry.ticker,
                company_name: entry.company_name,
                buy_score: entry.buy_score,
                min_score,
                reason,
            })
            .await;
        Ok(())
    }

    async fn report_unfilled(&self, result: &OrderResult, metrics: &mut CycleMetrics) {
        match result.outcome {
            outcome if outcome.is_failure() => {
                metrics.order_failures += 1;
                self.notifier
                    .notify(PositionEvent::OrderFailed {
                        ticker: result.ticker.clone(),
                        side: format!("{:?}", result.side),
                        message: result.message.clone(),
                    })
                    .await;
            }
            ExecutionOutcome::NothingToSell | ExecutionOutcome::AutoTradingDisabled => {
                tracing::info!("{}: state unchanged ({})", result.ticker, result.message)
            }
            _ => tracing::warn!("{}: order not placed ({})", result.ticker, result.message),
        }
    }

    /// Apply an externally proposed stop/target. Low urgency is logged only.
    /// Returns whether the position changed.
    pub async fn apply_risk_adjustment(&self, proposal: &RiskAdjustmentProposal) -> Result<bool> {
        if proposal.urgency == Urgency::Low {
            tracing::info!(
                "{}: low-urgency risk proposal noted, not applied ({})",
                proposal.ticker,
                proposal.reason
            );
            return Ok(false);
        }

        let Some(mut position) = self
            .store
            .get_position(&proposal.ticker)
            .await?
            .filter(|p| p.is_active())
        else {
            tracing::warn!("{}: risk proposal for a ticker not held", proposal.ticker);
            return Ok(false);
        };

        let mut changed = false;
        if proposal.new_target_price > 0.0 {
            position.target_price = proposal.new_target_price;
            changed = true;
        }
        if proposal.new_stop_loss > 0.0 {
            position.stop_loss = proposal.new_stop_loss;
            changed = true;
        }
        if !changed {
            return Ok(false);
        }

        self.store.save_position(&position).await?;
        self.notifier
            .notify(PositionEvent::RiskLevelsAdjusted {
                ticker: position.ticker,
                target_price: position.target_price,
                stop_loss: position.stop_loss,
                urgency: proposal.urgency.to_string(),
                reason: proposal.reason.clone(),
            })
            .await;
        Ok(true)
    }

    pub async fn summary(&self) -> Result<PortfolioSummary> {
        let active = self.store.active_positions().await?;
        Ok(PortfolioSummary::from_positions(
            &active,
            self.slots.capacity(),
            self.now(),
        ))
    }

    pub async fn performance(&self, limit: usize) -> Result<PerformanceMetrics> {
        let trades = self.store.trade_history(limit).await?;
        Ok(PerformanceMetrics::from_trades(&trades))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FixedClock, SessionRouter};
    use analysis_core::{Bar, InMemoryPriceData};
    use broker_trait::{BrokerClient, PaperBroker, PaperConfig};
    use chrono::{Duration, TimeZone};
    use notification_service::QueueSink;
    use portfolio_manager::{InMemoryPositionStore, InvestmentHorizon, ScenarioSnapshot};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: PositionDecisionEngine,
        store: Arc<InMemoryPositionStore>,
        broker: Arc<PaperBroker>,
        prices: Arc<InMemoryPriceData>,
        queue: Arc<QueueSink>,
    }

    fn market_hours() -> DateTime<Utc> {
        chrono_tz::Asia::Seoul
            .with_ymd_and_hms(2024, 11, 6, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn harness(capacity: usize, auto_trading: bool) -> Harness {
        harness_with(capacity, auto_trading, PaperConfig::default(), None)
    }

    fn harness_with(
        capacity: usize,
        auto_trading: bool,
        paper: PaperConfig,
        order_timeout: Option<std::time::Duration>,
    ) -> Harness {
        let config = AgentConfig {
            auto_trading_enabled: auto_trading,
            order_pacing_ms: 0,
            max_slots: capacity,
            ..AgentConfig::default()
        };
        let store = Arc::new(InMemoryPositionStore::new());
        let broker = Arc::new(PaperBroker::new(paper.with_cash(dec!(100_000_000))));
        let prices = Arc::new(InMemoryPriceData::new());
        let queue = Arc::new(QueueSink::new());
        let mut execution = config.execution_config();
        if let Some(timeout) = order_timeout {
            execution.timeout = timeout;
        }
        let executor = Arc::new(OrderExecutor::new(
            broker.clone(),
            Arc::new(FixedClock::new(market_hours())),
            SessionRouter::default(),
            execution,
        ));
        let engine = PositionDecisionEngine::from_config(
            &config,
            prices.clone(),
            store.clone(),
            executor,
            NotificationService::new(vec![Box::new(queue.clone())]),
        )
        .unwrap();

        Harness {
            engine,
            store,
            broker,
            prices,
            queue,
        }
    }

    fn scenario(ticker: &str, score: f64) -> RawScenario {
        RawScenario {
            ticker: ticker.to_string(),
            company_name: format!("{ticker} Co"),
            current_price: Some(10_000.0),
            decision: Some("Enter".to_string()),
            buy_score: Some(score),
            ..RawScenario::default()
        }
    }

    fn with_levels(mut raw: RawScenario, target: f64, stop: f64) -> RawScenario {
        raw.target_price = Some(target);
        raw.stop_loss = Some(stop);
        raw
    }

    fn rising_series(days: i64) -> Vec<Bar> {
        let end = Utc.with_ymd_and_hms(2024, 11, 6, 0, 0, 0).unwrap();
        (0..days)
            .map(|i| Bar::daily_close(end - Duration::days(days - 1 - i), 10_000.0 + 100.0 * i as f64))
            .collect()
    }

    async fn seed_position(store: &InMemoryPositionStore, ticker: &str) {
        let position = Position::open(
            ticker,
            ticker,
            10_000.0,
            market_hours() - Duration::days(1),
            11_000.0,
            9_000.0,
            ScenarioSnapshot {
                investment_horizon: InvestmentHorizon::Medium,
                sector: "Unknown".to_string(),
                rationale: String::new(),
                buy_score: 9.0,
            },
        );
        store
            .open_position(&position, &PartialSaleRecord::new(ticker, 10_000.0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn entries_stop_at_capacity() {
        let h = harness(10, true);
        let batch: Vec<RawScenario> = (0..12)
            .map(|i| {
                let ticker = format!("T{i:02}");
                h.broker.set_quote(&ticker, dec!(10000));
                scenario(&ticker, 10.0)
            })
            .collect();

        let metrics = h.engine.run_cycle(batch).await.unwrap();
        assert_eq!(metrics.entries_accepted, 10);
        assert_eq!(metrics.entries_skipped, 2);
        assert_eq!(h.store.active_positions().await.unwrap().len(), 10);

        let reasons: Vec<String> = h
            .queue
            .drain()
            .await
            .into_iter()
            .filter_map(|n| match n.event {
                PositionEvent::Skipped { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec!["slots full (10/10)"; 2]);
    }

    #[tokio::test]
    async fn crowded_book_skips_eight_point_score() {
        let h = harness(10, true);
        for i in 0..8 {
            seed_position(&h.store, &format!("H{i}")).await;
        }

        let metrics = h.engine.run_cycle(vec![scenario("NEW", 8.0)]).await.unwrap();
        assert_eq!(metrics.positions_reviewed, 8);
        assert_eq!(metrics.holds, 8);
        assert_eq!(metrics.entries_skipped, 1);

        let events = h.queue.drain().await;
        assert_eq!(events.len(), 1);
        match &events[0].event {
            PositionEvent::Skipped {
                reason, min_score, ..
            } => {
                assert_eq!(reason, "score shortfall (8<9)");
                assert_eq!(*min_score, 9.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let watchlist = h.store.watchlist_history(10).await.unwrap();
        assert_eq!(watchlist[0].skip_reason, "score shortfall (8<9)");
        assert!(h.broker.orders().await.is_empty());
    }

    #[tokio::test]
    async fn calculator_fills_missing_levels_at_entry() {
        let h = harness(10, true);
        h.broker.set_quote("005930", dec!(10000));
        let mut raw = scenario("005930", 9.0);
        raw.stop_loss = Some(9_300.0);

        h.engine.run_cycle(vec![raw]).await.unwrap();
        let position = h.store.get_position("005930").await.unwrap().unwrap();
        assert_eq!(position.entry_price, 10_000.0);
        assert_eq!(position.stop_loss, 9_300.0);
        // no history: 15% volatility fallback, neutral regime, +10%
        assert!((position.target_price - 11_000.0).abs() < 1e-6);
        assert_eq!(position.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn strong_trend_after_partial_sell_keeps_holding() {
        let h = harness(10, true);
        h.prices.insert("000660", rising_series(60));
        h.broker.set_quote("000660", dec!(10000));
        h.engine
            .run_cycle(vec![with_levels(scenario("000660", 9.0), 11_000.0, 9_000.0)])
            .await
            .unwrap();
        assert_eq!(
            h.broker.get_holding("000660").await.unwrap().unwrap().quantity,
            100
        );

        h.broker.set_quote("000660", dec!(11500));
        let second = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(second.partial_sells, 1);
        let position = h.store.get_position("000660").await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::PartiallyClosed);
        let partial = h.store.get_partial_sale("000660").await.unwrap().unwrap();
        assert!((partial.remaining_quantity - 0.5).abs() < 1e-12);
        assert_eq!(partial.avg_sell_price, 11_500.0);

        let third = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(third.partial_sells, 0);
        assert_eq!(third.closes, 0);
        assert_eq!(third.holds, 1);
        assert_eq!(h.broker.orders().await.len(), 2);
        assert_eq!(
            h.broker.get_holding("000660").await.unwrap().unwrap().quantity,
            50
        );
    }

    #[tokio::test]
    async fn stop_loss_closes_and_records_trade() {
        let h = harness(10, true);
        h.broker.set_quote("035720", dec!(10000));
        h.engine
            .run_cycle(vec![with_levels(scenario("035720", 9.0), 11_000.0, 9_000.0)])
            .await
            .unwrap();
        h.queue.drain().await;

        h.broker.set_quote("035720", dec!(8500));
        let metrics = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(metrics.closes, 1);
        assert_eq!(metrics.realized_returns.len(), 1);
        assert!((metrics.realized_returns[0] + 15.0).abs() < 1e-9);
        assert!(h.store.active_positions().await.unwrap().is_empty());
        assert!(h.broker.get_holding("035720").await.unwrap().is_none());

        let trades = h.store.trade_history(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!(trades[0].exit_reason.starts_with("stop-loss hit"));

        let events = h.queue.drain().await;
        assert!(matches!(
            &events[0].event,
            PositionEvent::Closed { profit_rate, .. } if (*profit_rate + 15.0).abs() < 1e-9
        ));

        let perf = h.engine.performance(10).await.unwrap();
        assert_eq!(perf.total_trades, 1);
        assert_eq!(perf.losing_trades, 1);
    }

    #[tokio::test]
    async fn disabled_trading_opens_nothing() {
        let h = harness(10, false);
        h.broker.set_quote("005930", dec!(10000));
        let metrics = h.engine.run_cycle(vec![scenario("005930", 9.0)]).await.unwrap();

        assert_eq!(metrics.entries_accepted, 0);
        assert_eq!(metrics.entries_skipped, 1);
        assert_eq!(metrics.order_failures, 0);
        assert!(h.store.active_positions().await.unwrap().is_empty());
        let watchlist = h.store.watchlist_history(1).await.unwrap();
        assert!(watchlist[0].skip_reason.contains("auto-trading is disabled"));
    }

    #[tokio::test]
    async fn unaffordable_entry_is_skipped_not_failed() {
        let h = harness(10, true);
        h.broker.set_quote("EXPENSIVE", Decimal::from(2_000_000));
        let metrics = h
            .engine
            .run_cycle(vec![scenario("EXPENSIVE", 9.0)])
            .await
            .unwrap();
        assert_eq!(metrics.entries_skipped, 1);
        assert_eq!(metrics.order_failures, 0);
        assert!(h.store.get_position("EXPENSIVE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broker_rejection_is_reported() {
        let h = harness(10, true);
        h.broker.set_quote("005930", dec!(10000));
        h.broker.set_rejecting(true);
        let metrics = h.engine.run_cycle(vec![scenario("005930", 9.0)]).await.unwrap();
        assert_eq!(metrics.order_failures, 1);
        let events = h.queue.drain().await;
        assert!(matches!(&events[0].event, PositionEvent::OrderFailed { side, .. } if side == "Buy"));
    }

    #[tokio::test]
    async fn invalid_scenarios_are_counted() {
        let h = harness(10, true);
        let mut bad = scenario("BAD", 9.0);
        bad.buy_score = Some(42.0);
        let metrics = h
            .engine
            .run_cycle(vec![bad, RawScenario::default()])
            .await
            .unwrap();
        assert_eq!(metrics.invalid_scenarios, 2);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn risk_proposals_respect_urgency() {
        let h = harness(10, true);
        seed_position(&h.store, "005930").await;

        let low = RiskAdjustmentProposal {
            ticker: "005930".to_string(),
            new_target_price: 12_000.0,
            new_stop_loss: 0.0,
            urgency: Urgency::Low,
            reason: "earnings".to_string(),
        };
        assert!(!h.engine.apply_risk_adjustment(&low).await.unwrap());

        let high = RiskAdjustmentProposal {
            urgency: Urgency::High,
            new_target_price: 0.0,
            new_stop_loss: 9_500.0,
            ..low
        };
        assert!(h.engine.apply_risk_adjustment(&high).await.unwrap());
        let position = h.store.get_position("005930").await.unwrap().unwrap();
        assert_eq!(position.stop_loss, 9_500.0);
        assert_eq!(position.target_price, 11_000.0);

        let summary = h.engine.summary().await.unwrap();
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.free_slots(), 9);
    }

    #[tokio::test]
    async fn position_missing_at_broker_is_closed() {
        let h = harness(10, true);
        seed_position(&h.store, "GONE").await;
        h.broker.set_quote("GONE", dec!(8500));

        let metrics = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(metrics.closes, 1);
        assert_eq!(metrics.reconciled, 1);
        assert_eq!(metrics.order_failures, 0);
        assert!(h.store.active_positions().await.unwrap().is_empty());

        let trades = h.store.trade_history(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_price, 8_500.0);
        assert!(trades[0].exit_reason.contains("reconciled"));
        assert!(h.broker.orders().await.is_empty());

        let next = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(next.positions_reviewed, 0);
    }

    #[tokio::test]
    async fn stop_with_shares_held_sells_instead_of_reconciling() {
        let h = harness(10, true);
        seed_position(&h.store, "KEEP").await;
        h.broker.seed_holding("KEEP", 10, dec!(10000)).await;
        h.broker.set_quote("KEEP", dec!(8500));

        let metrics = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(metrics.closes, 1);
        assert_eq!(metrics.reconciled, 0);
        assert_eq!(h.broker.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn timed_out_buy_that_filled_is_adopted() {
        let h = harness_with(
            10,
            true,
            PaperConfig::default().with_latency(std::time::Duration::from_millis(500)),
            Some(std::time::Duration::from_millis(50)),
        );
        h.broker.set_quote("LATE", dec!(10000));
        h.broker.set_quote("LOST", dec!(10000));

        let first = h
            .engine
            .run_cycle(vec![
                with_levels(scenario("LATE", 9.0), 11_000.0, 9_000.0),
                with_levels(scenario("LOST", 9.0), 11_000.0, 9_000.0),
            ])
            .await
            .unwrap();
        assert_eq!(first.order_failures, 2);
        assert_eq!(first.entries_accepted, 0);
        assert!(h.store.active_positions().await.unwrap().is_empty());

        // The broker filled LATE after the executor gave up.
        h.broker.seed_holding("LATE", 100, dec!(9950)).await;

        let second = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(second.reconciled, 1);
        assert_eq!(second.entries_accepted, 1);
        assert_eq!(second.positions_reviewed, 1);
        assert_eq!(second.holds, 1);
        let position = h.store.get_position("LATE").await.unwrap().unwrap();
        assert_eq!(position.entry_price, 9_950.0);
        assert_eq!(position.target_price, 11_000.0);
        assert_eq!(position.stop_loss, 9_000.0);
        assert!(h.store.get_position("LOST").await.unwrap().is_none());

        let third = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(third.reconciled, 0);
        assert_eq!(third.positions_reviewed, 1);
    }

    #[tokio::test]
    async fn single_share_at_target_is_sold_and_closed() {
        let h = harness(10, true);
        h.broker.set_quote("SOLO", dec!(600000));
        h.engine
            .run_cycle(vec![with_levels(scenario("SOLO", 9.0), 660_000.0, 540_000.0)])
            .await
            .unwrap();
        assert_eq!(
            h.broker.get_holding("SOLO").await.unwrap().unwrap().quantity,
            1
        );

        h.broker.set_quote("SOLO", dec!(680000));
        let metrics = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(metrics.closes, 1);
        assert_eq!(metrics.partial_sells, 0);
        assert!(h.store.active_positions().await.unwrap().is_empty());
        assert!(h.broker.get_holding("SOLO").await.unwrap().is_none());

        let trades = h.store.trade_history(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_price, 680_000.0);
    }

    #[tokio::test]
    async fn uneven_partial_books_shares_actually_sold() {
        let h = harness(10, true);
        h.broker.set_quote("ODD", dec!(300000));
        h.engine
            .run_cycle(vec![with_levels(scenario("ODD", 9.0), 330_000.0, 270_000.0)])
            .await
            .unwrap();
        assert_eq!(
            h.broker.get_holding("ODD").await.unwrap().unwrap().quantity,
            3
        );
        h.queue.drain().await;

        h.broker.set_quote("ODD", dec!(340000));
        let metrics = h.engine.run_cycle(vec![]).await.unwrap();
        assert_eq!(metrics.partial_sells, 1);
        assert_eq!(
            h.broker.get_holding("ODD").await.unwrap().unwrap().quantity,
            2
        );

        let partial = h.store.get_partial_sale("ODD").await.unwrap().unwrap();
        assert!((partial.remaining_quantity - 2.0 / 3.0).abs() < 1e-9);
        assert!((partial.sold_quantity() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(partial.avg_sell_price, 340_000.0);

        let events = h.queue.drain().await;
        assert!(matches!(
            &events[0].event,
            PositionEvent::PartialSell { quantity: 1, remaining_ratio, .. }
                if (*remaining_ratio - 2.0 / 3.0).abs() < 1e-9
        ));
    }
}
