use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Position, PositionStatus, TradeRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub ticker: String,
    pub company_name: String,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub current_price: f64,
    pub target_price: f64,
    pub stop_loss: f64,
    pub profit_rate: f64,
    pub days_held: i64,
    pub sector: String,
}

/// Read-only view of the book, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub generated_at: DateTime<Utc>,
    pub open_positions: usize,
    pub capacity: usize,
    pub sector_distribution: BTreeMap<String, usize>,
    pub horizon_distribution: BTreeMap<String, usize>,
    pub avg_profit_rate: f64,
    pub positions: Vec<PositionSnapshot>,
}

impl PortfolioSummary {
    pub fn from_positions(positions: &[Position], capacity: usize, now: DateTime<Utc>) -> Self {
        let active: Vec<&Position> = positions.iter().filter(|p| p.is_active()).collect();

        let mut sector_distribution = BTreeMap::new();
        let mut horizon_distribution = BTreeMap::new();
        for p in &active {
            *sector_distribution
                .entry(p.scenario.sector.clone())
                .or_insert(0) += 1;
            *horizon_distribution
                .entry(p.scenario.investment_horizon.to_string())
                .or_insert(0) += 1;
        }

        let avg_profit_rate = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|p| p.profit_rate()).sum::<f64>() / active.len() as f64
        };

        let positions = active
            .iter()
            .map(|p| PositionSnapshot {
                ticker: p.ticker.clone(),
                company_name: p.company_name.clone(),
                status: p.status,
                entry_price: p.entry_price,
                current_price: p.current_price,
                target_price: p.target_price,
                stop_loss: p.stop_loss,
                profit_rate: p.profit_rate(),
                days_held: p.days_held(now),
                sector: p.scenario.sector.clone(),
            })
            .collect();

        Self {
            generated_at: now,
            open_positions: active.len(),
            capacity,
            sector_distribution,
            horizon_distribution,
            avg_profit_rate,
            positions,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.open_positions)
    }
}

/// Realized results over closed trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_profit_rate: f64,
    pub avg_holding_days: f64,
    pub best_trade: Option<f64>,
    pub worst_trade: Option<f64>,
}

impl PerformanceMetrics {
    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        let total_trades = trades.len();
        let winning_trades = trades.iter().filter(|t| t.profit_rate > 0.0).count();
        let losing_trades = trades.iter().filter(|t| t.profit_rate < 0.0).count();

        let (win_rate, avg_profit_rate, avg_holding_days) = if total_trades == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let n = total_trades as f64;
            (
                winning_trades as f64 / n * 100.0,
                trades.iter().map(|t| t.profit_rate).sum::<f64>() / n,
                trades.iter().map(|t| t.holding_days as f64).sum::<f64>() / n,
            )
        };

        Self {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            avg_profit_rate,
            avg_holding_days,
            best_trade: trades.iter().map(|t| t.profit_rate).reduce(f64::max),
            worst_trade: trades.iter().map(|t| t.profit_rate).reduce(f64::min),
        }
    }
}
