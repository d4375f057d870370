use std::collections::VecDeque;
use std::time::Instant;

use market_regime_detector::RegimeClass;
use serde::{Deserialize, Serialize};

/// What one evaluation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub regime: Option<RegimeClass>,
    pub regime_fallback: bool,
    pub positions_reviewed: u64,
    pub holds: u64,
    pub partial_sells: u64,
    pub closes: u64,
    pub entries_accepted: u64,
    pub entries_skipped: u64,
    pub invalid_scenarios: u64,
    /// Broker rejections and timeouts only.
    pub order_failures: u64,
    /// Stored positions brought back in line with broker holdings.
    pub reconciled: u64,
    /// Realized percent returns of positions closed this cycle.
    pub realized_returns: Vec<f64>,
    pub duration_ms: u64,
}

impl CycleMetrics {
    pub fn finish(&mut self, started: Instant) {
        self.duration_ms = started.elapsed().as_millis() as u64;
    }

    pub fn log(&self) {
        tracing::info!(
            regime = %self.regime.map(|r| r.name()).unwrap_or("-"),
            regime_fallback = self.regime_fallback,
            reviewed = self.positions_reviewed,
            holds = self.holds,
            partial_sells = self.partial_sells,
            closes = self.closes,
            entries = self.entries_accepted,
            skipped = self.entries_skipped,
            invalid = self.invalid_scenarios,
            order_failures = self.order_failures,
            reconciled = self.reconciled,
            duration_ms = self.duration_ms,
            "Cycle complete"
        );
    }
}

/// Running totals across cycles, with a rolling window over recent exits.
pub struct AgentMetrics {
    pub cycles_run: u64,
    pub entries_accepted: u64,
    pub entries_skipped: u64,
    pub partial_sells: u64,
    pub closes: u64,
    pub order_failures: u64,
    pub reconciled: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub last_cycle_ms: u64,

    recent_returns: VecDeque<f64>,
    log_interval_cycles: u64,
}

const RECENT_WINDOW: usize = 20;

impl AgentMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_run: 0,
            entries_accepted: 0,
            entries_skipped: 0,
            partial_sells: 0,
            closes: 0,
            order_failures: 0,
            reconciled: 0,
            winning_trades: 0,
            losing_trades: 0,
            last_cycle_ms: 0,
            recent_returns: VecDeque::with_capacity(RECENT_WINDOW),
            log_interval_cycles,
        }
    }

    pub fn record_cycle(&mut self, cycle: &CycleMetrics) {
        self.cycles_run += 1;
        self.entries_accepted += cycle.entries_accepted;
        self.entries_skipped += cycle.entries_skipped;
        self.partial_sells += cycle.partial_sells;
        self.closes += cycle.closes;
        self.order_failures += cycle.order_failures;
        self.reconciled += cycle.reconciled;
        self.last_cycle_ms = cycle.duration_ms;

        for &r in &cycle.realized_returns {
            if r > 0.0 {
                self.winning_trades += 1;
            } else {
                self.losing_trades += 1;
            }
            self.recent_returns.push_back(r);
            if self.recent_returns.len() > RECENT_WINDOW {
                self.recent_returns.pop_front();
            }
        }

        if self.log_interval_cycles > 0 && self.cycles_run % self.log_interval_cycles == 0 {
            self.log_metrics();
        }
    }

    /// Win rate over the last 20 exits (0-100%)
    pub fn recent_win_rate(&self) -> f64 {
        if self.recent_returns.is_empty() {
            return 0.0;
        }
        let wins = self.recent_returns.iter().filter(|r| **r > 0.0).count() as f64;
        wins / self.recent_returns.len() as f64 * 100.0
    }

    pub fn recent_avg_return(&self) -> f64 {
        if self.recent_returns.is_empty() {
            return 0.0;
        }
        self.recent_returns.iter().sum::<f64>() / self.recent_returns.len() as f64
    }

    pub fn overall_win_rate(&self) -> f64 {
        let total = self.winning_trades + self.losing_trades;
        if total == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / total as f64 * 100.0
    }

    pub fn log_metrics(&self) {
        tracing::info!(
            cycles = self.cycles_run,
            entries = self.entries_accepted,
            skipped = self.entries_skipped,
            partial_sells = self.partial_sells,
            closes = self.closes,
            order_failures = self.order_failures,
            reconciled = self.reconciled,
            overall_win_rate = format!("{:.1}%", self.overall_win_rate()),
            recent_win_rate = format!("{:.1}%", self.recent_win_rate()),
            recent_avg_return = format!("{:+.2}%", self.recent_avg_return()),
            last_cycle_ms = self.last_cycle_ms,
            "Agent metrics summary"
        );
    }
}
