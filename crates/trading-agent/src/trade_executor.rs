use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use broker_trait::{BrokerClient, Holding, OrderRequest, OrderSide, PriceMode, Quote};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use crate::session::{Clock, SessionRouter};

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub auto_trading_enabled: bool,
    /// Capital allocated to each buy.
    pub buy_amount: f64,
    pub max_concurrent_orders: usize,
    /// Covers lock acquisition and every brokerage call.
    pub timeout: Duration,
    /// Pause between the quote and the submission.
    pub pacing: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            auto_trading_enabled: false,
            buy_amount: 1_000_000.0,
            max_concurrent_orders: 3,
            timeout: Duration::from_secs(30),
            pacing: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Filled,
    /// Allocated capital does not buy a single share.
    ZeroQuantity,
    /// Nothing (or too little) held to sell.
    NothingToSell,
    AutoTradingDisabled,
    DataUnavailable,
    BrokerRejection,
    Timeout,
    /// Refused inside the executor (shut down); nothing reached the broker.
    ExecutorClosed,
}

impl ExecutionOutcome {
    /// Only these need an operator's attention.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExecutionOutcome::BrokerRejection
                | ExecutionOutcome::Timeout
                | ExecutionOutcome::ExecutorClosed
        )
    }
}

/// Result of one buy or sell call. Always well-formed, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub ticker: String,
    pub side: OrderSide,
    pub success: bool,
    pub outcome: ExecutionOutcome,
    pub order_id: Option<String>,
    pub requested_quantity: u64,
    pub filled_quantity: u64,
    /// Shares held just before a sell was sized. Zero for buys.
    pub held_quantity: u64,
    pub fill_price: Option<f64>,
    pub price_mode: Option<PriceMode>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    fn unfilled(
        ticker: &str,
        side: OrderSide,
        outcome: ExecutionOutcome,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            ticker: ticker.to_string(),
            side,
            success: false,
            outcome,
            order_id: None,
            requested_quantity: 0,
            filled_quantity: 0,
            held_quantity: 0,
            fill_price: None,
            price_mode: None,
            message: message.into(),
            timestamp,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("quote unavailable for {ticker}: {message}")]
    QuoteUnavailable { ticker: String, message: String },

    #[error("holdings unavailable: {0}")]
    HoldingsUnavailable(String),

    #[error("order submission failed for {ticker}: {message}")]
    Submission { ticker: String, message: String },

    #[error("order executor is shut down")]
    GateClosed,
}

impl ExecutionError {
    fn outcome(&self) -> ExecutionOutcome {
        match self {
            ExecutionError::QuoteUnavailable { .. } | ExecutionError::HoldingsUnavailable(_) => {
                ExecutionOutcome::DataUnavailable
            }
            ExecutionError::Submission { .. } => ExecutionOutcome::BrokerRejection,
            ExecutionError::GateClosed => ExecutionOutcome::ExecutorClosed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SellSize {
    All,
    Fraction(f64),
}

/// Routes buy/sell instructions to the brokerage.
///
/// Every order takes three guards in a fixed order: the ticker's lock, a
/// permit from the concurrency gate, then the account lock. The whole call,
/// waiting included, runs under the configured timeout. Nothing is retried.
pub struct OrderExecutor {
    broker: Arc<dyn BrokerClient>,
    clock: Arc<dyn Clock>,
    router: SessionRouter,
    config: ExecutionConfig,
    ticker_locks: DashMap<String, Arc<Mutex<()>>>,
    gate: Semaphore,
    account: Mutex<()>,
}

impl OrderExecutor {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        clock: Arc<dyn Clock>,
        router: SessionRouter,
        config: ExecutionConfig,
    ) -> Self {
        tracing::info!(
            "Order executor on {} ({}), auto-trading {}, {} concurrent, timeout {:?}",
            broker.broker_name(),
            if broker.is_paper() { "paper" } else { "live" },
            if config.auto_trading_enabled { "on" } else { "off" },
            config.max_concurrent_orders,
            config.timeout
        );
        Self {
            broker,
            clock,
            router,
            gate: Semaphore::new(config.max_concurrent_orders.max(1)),
            config,
            ticker_locks: DashMap::new(),
            account: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current holdings, for display. Takes no locks.
    pub async fn portfolio(&self) -> Result<Vec<Holding>> {
        self.broker.get_holdings().await
    }

    /// One holding, for reconciliation after an unconfirmed order. Takes no locks.
    pub async fn holding(&self, ticker: &str) -> Result<Option<Holding>> {
        self.broker.get_holding(ticker).await
    }

    /// Stop accepting orders. Orders already holding a permit finish normally.
    pub fn shutdown(&self) {
        self.gate.close();
        tracing::info!("Order executor closed to new orders");
    }

    /// Latest quote, for display. Takes no locks.
    pub async fn quote(&self, ticker: &str) -> Result<Quote> {
        self.broker.get_quote(ticker).await
    }

    /// Buy `amount` worth (default: the configured buy amount) of `ticker`.
    pub async fn buy(&self, ticker: &str, amount: Option<f64>) -> OrderResult {
        let amount = amount.unwrap_or(self.config.buy_amount);
        self.guarded(ticker, OrderSide::Buy, self.buy_locked(ticker, amount))
            .await
    }

    /// Sell everything held in `ticker`.
    pub async fn sell_all(&self, ticker: &str) -> OrderResult {
        self.guarded(ticker, OrderSide::Sell, self.sell_locked(ticker, SellSize::All))
            .await
    }

    /// Sell `ratio` of the current holding, rounded down to whole shares.
    /// When that rounds to zero the whole remaining holding is sold.
    pub async fn sell_partial(&self, ticker: &str, ratio: f64) -> OrderResult {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return OrderResult::unfilled(
                ticker,
                OrderSide::Sell,
                ExecutionOutcome::NothingToSell,
                format!("sell ratio {} outside (0, 1]", ratio),
                self.clock.now(),
            );
        }
        self.guarded(
            ticker,
            OrderSide::Sell,
            self.sell_locked(ticker, SellSize::Fraction(ratio)),
        )
        .await
    }

    async fn guarded(
        &self,
        ticker: &str,
        side: OrderSide,
        work: impl std::future::Future<Output = OrderResult>,
    ) -> OrderResult {
        if !self.config.auto_trading_enabled {
            tracing::info!("Auto-trading disabled, {:?} {} not sent", side, ticker);
            return OrderResult::unfilled(
                ticker,
                side,
                ExecutionOutcome::AutoTradingDisabled,
                "auto-trading is disabled (AUTO_TRADING_ENABLED=false)",
                self.clock.now(),
            );
        }

        match tokio::time::timeout(self.config.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    "{:?} {} timed out after {:?}; reconcile with the broker before retrying",
                    side,
                    ticker,
                    self.config.timeout
                );
                OrderResult::unfilled(
                    ticker,
                    side,
                    ExecutionOutcome::Timeout,
                    format!("timed out after {}s", self.config.timeout.as_secs_f64()),
                    self.clock.now(),
                )
            }
        }
    }

    fn ticker_lock(&self, ticker: &str) -> Arc<Mutex<()>> {
        self.ticker_locks
            .entry(ticker.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    async fn buy_locked(&self, ticker: &str, amount: f64) -> OrderResult {
        let lock = self.ticker_lock(ticker);
        let _ticker_guard = lock.lock().await;
        let _permit = match self.gate.acquire().await {
            Ok(p) => p,
            Err(_) => return self.failed(ticker, OrderSide::Buy, ExecutionError::GateClosed),
        };
        let _account_guard = self.account.lock().await;

        let mode = self.router.price_mode_at(self.clock.now());
        let quote = match self.broker.get_quote(ticker).await {
            Ok(q) => q,
            Err(e) => {
                return self.failed(
                    ticker,
                    OrderSide::Buy,
                    ExecutionError::QuoteUnavailable {
                        ticker: ticker.to_string(),
                        message: e.to_string(),
                    },
                )
            }
        };
        self.pace().await;

        let price = quote.price_f64();
        let quantity = if price > 0.0 {
            (amount / price).floor() as u64
        } else {
            0
        };
        if quantity == 0 {
            tracing::info!(
                "{}: {:.0} does not buy one share @ {:.0}",
                ticker,
                amount,
                price
            );
            let mut result = OrderResult::unfilled(
                ticker,
                OrderSide::Buy,
                ExecutionOutcome::ZeroQuantity,
                format!("cannot afford one share: {:.0} @ {:.0}", amount, price),
                self.clock.now(),
            );
            result.price_mode = Some(mode);
            return result;
        }

        self.submit(OrderRequest::buy(ticker, quantity, mode), 0).await
    }

    async fn sell_locked(&self, ticker: &str, size: SellSize) -> OrderResult {
        let lock = self.ticker_lock(ticker);
        let _ticker_guard = lock.lock().await;
        let _permit = match self.gate.acquire().await {
            Ok(p) => p,
            Err(_) => return self.failed(ticker, OrderSide::Sell, ExecutionError::GateClosed),
        };
        let _account_guard = self.account.lock().await;

        let held = match self.held_quantity(ticker).await {
            Ok(q) => q,
            Err(e) => return self.failed(ticker, OrderSide::Sell, e),
        };
        if held == 0 {
            return self.nothing_to_sell(ticker, format!("no {} shares held", ticker));
        }

        let mode = self.router.price_mode_at(self.clock.now());
        if let Err(e) = self.broker.get_quote(ticker).await {
            return self.failed(
                ticker,
                OrderSide::Sell,
                ExecutionError::QuoteUnavailable {
                    ticker: ticker.to_string(),
                    message: e.to_string(),
                },
            );
        }
        self.pace().await;

        // Holdings may have moved while we waited.
        let held = match self.held_quantity(ticker).await {
            Ok(q) => q,
            Err(e) => return self.failed(ticker, OrderSide::Sell, e),
        };
        if held == 0 {
            return self.nothing_to_sell(ticker, format!("no {} shares held", ticker));
        }
        let quantity = match size {
            SellSize::All => held,
            SellSize::Fraction(ratio) => match (held as f64 * ratio).floor() as u64 {
                0 => {
                    tracing::info!(
                        "{}: {:.0}% of {} rounds to zero shares, selling all",
                        ticker,
                        ratio * 100.0,
                        held
                    );
                    held
                }
                q => q.min(held),
            },
        };

        self.submit(OrderRequest::sell(ticker, quantity, mode), held)
            .await
    }

    async fn held_quantity(&self, ticker: &str) -> Result<u64, ExecutionError> {
        self.broker
            .get_holding(ticker)
            .await
            .map(|h| h.map(|h| h.quantity).unwrap_or(0))
            .map_err(|e| ExecutionError::HoldingsUnavailable(e.to_string()))
    }

    async fn pace(&self) {
        if !self.config.pacing.is_zero() {
            tokio::time::sleep(self.config.pacing).await;
        }
    }

    async fn submit(&self, order: OrderRequest, held: u64) -> OrderResult {
        let ticker = order.ticker.clone();
        let side = order.side;
        let requested = order.quantity;
        let mode = order.price_mode;

        let ack = match self.broker.submit_order(order).await {
            Ok(ack) => ack,
            Err(e) => {
                return self.failed(
                    &ticker,
                    side,
                    ExecutionError::Submission {
                        ticker: ticker.clone(),
                        message: e.to_string(),
                    },
                )
            }
        };

        if ack.accepted {
            tracing::info!(
                "{:?} {} x{} ({}) accepted: order {}",
                side,
                ticker,
                ack.filled_quantity,
                mode,
                ack.order_id.as_deref().unwrap_or("-")
            );
        } else {
            tracing::error!("{:?} {} rejected by broker: {}", side, ticker, ack.message);
        }

        OrderResult {
            success: ack.accepted,
            outcome: if ack.accepted {
                ExecutionOutcome::Filled
            } else {
                ExecutionOutcome::BrokerRejection
            },
            order_id: ack.order_id.clone(),
            requested_quantity: requested,
            filled_quantity: ack.filled_quantity,
            held_quantity: held,
            fill_price: ack.fill_price_f64(),
            price_mode: Some(mode),
            message: ack.message,
            timestamp: self.clock.now(),
            ticker,
            side,
        }
    }

    fn failed(&self, ticker: &str, side: OrderSide, error: ExecutionError) -> OrderResult {
        let outcome = error.outcome();
        if outcome.is_failure() {
            tracing::error!("{:?} {} failed: {}", side, ticker, error);
        } else {
            tracing::warn!("{:?} {} not sent: {}", side, ticker, error);
        }
        OrderResult::unfilled(ticker, side, outcome, error.to_string(), self.clock.now())
    }

    fn nothing_to_sell(&self, ticker: &str, message: String) -> OrderResult {
        tracing::info!("{}", message);
        OrderResult::unfilled(
            ticker,
            OrderSide::Sell,
            ExecutionOutcome::NothingToSell,
            message,
            self.clock.now(),
        )
    }
}
