use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::PartiallyClosed => "partially_closed",
            PositionStatus::Closed => "closed",
        }
    }

    /// Forward-only: Open -> PartiallyClosed -> Closed, or Open -> Closed.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        matches!(
            (self, next),
            (PositionStatus::Open, PositionStatus::PartiallyClosed)
                | (PositionStatus::Open, PositionStatus::Closed)
                | (PositionStatus::PartiallyClosed, PositionStatus::Closed)
        )
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, PositionStatus::Closed)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "partially_closed" => Ok(PositionStatus::PartiallyClosed),
            "closed" => Ok(PositionStatus::Closed),
            other => Err(PositionError::UnknownValue(format!("status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvestmentHorizon {
    Short,
    Swing,
    #[default]
    Medium,
    Long,
}

impl InvestmentHorizon {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentHorizon::Short => "short",
            InvestmentHorizon::Swing => "swing",
            InvestmentHorizon::Medium => "medium",
            InvestmentHorizon::Long => "long",
        }
    }
}

impl fmt::Display for InvestmentHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvestmentHorizon {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" | "short-term" | "short_term" => Ok(InvestmentHorizon::Short),
            "swing" => Ok(InvestmentHorizon::Swing),
            "medium" | "mid" | "medium-term" | "medium_term" => Ok(InvestmentHorizon::Medium),
            "long" | "long-term" | "long_term" => Ok(InvestmentHorizon::Long),
            other => Err(PositionError::UnknownValue(format!("horizon '{}'", other))),
        }
    }
}

/// The part of the entry scenario kept with a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSnapshot {
    pub investment_horizon: InvestmentHorizon,
    pub sector: String,
    pub rationale: String,
    pub buy_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub company_name: String,
    pub entry_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub current_price: f64,
    pub last_updated: DateTime<Utc>,
    pub target_price: f64,
    pub stop_loss: f64,
    pub scenario: ScenarioSnapshot,
    pub status: PositionStatus,
}

impl Position {
    pub fn open(
        ticker: impl Into<String>,
        company_name: impl Into<String>,
        entry_price: f64,
        entry_timestamp: DateTime<Utc>,
        target_price: f64,
        stop_loss: f64,
        scenario: ScenarioSnapshot,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            company_name: company_name.into(),
            entry_price,
            entry_timestamp,
            current_price: entry_price,
            last_updated: entry_timestamp,
            target_price,
            stop_loss,
            scenario,
            status: PositionStatus::Open,
        }
    }

    /// Signed percent gain of the current price over entry.
    pub fn profit_rate(&self) -> f64 {
        profit_rate(self.entry_price, self.current_price)
    }

    /// Whole days since entry.
    pub fn days_held(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_timestamp).num_days()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn refresh_price(&mut self, price: f64, at: DateTime<Utc>) {
        self.current_price = price;
        self.last_updated = at;
    }

    /// Fill target/stop only where they are unset (zero). Returns true if anything changed.
    pub fn backfill_risk_levels(&mut self, target_price: f64, stop_loss: f64) -> bool {
        let mut changed = false;
        if self.target_price <= 0.0 && target_price > 0.0 {
            self.target_price = target_price;
            changed = true;
        }
        if self.stop_loss <= 0.0 && stop_loss > 0.0 {
            self.stop_loss = stop_loss;
            changed = true;
        }
        changed
    }

    pub fn transition(&mut self, next: PositionStatus) -> Result<(), PositionError> {
        if !self.status.can_transition_to(next) {
            return Err(PositionError::InvalidTransition {
                ticker: self.ticker.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

pub fn profit_rate(entry_price: f64, price: f64) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    (price - entry_price) / entry_price * 100.0
}

/// Fractional bookkeeping of partial exits. Quantities are units of the
/// original position (1.0 = everything bought).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSaleRecord {
    pub ticker: String,
    pub initial_quantity: f64,
    pub remaining_quantity: f64,
    pub initial_buy_price: f64,
    pub avg_sell_price: f64,
    pub last_sell_date: Option<DateTime<Utc>>,
}

impl PartialSaleRecord {
    pub fn new(ticker: impl Into<String>, initial_buy_price: f64) -> Self {
        Self {
            ticker: ticker.into(),
            initial_quantity: 1.0,
            remaining_quantity: 1.0,
            initial_buy_price,
            avg_sell_price: 0.0,
            last_sell_date: None,
        }
    }

    pub fn sold_quantity(&self) -> f64 {
        self.initial_quantity - self.remaining_quantity
    }

    /// Nothing sold yet.
    pub fn is_untouched(&self) -> bool {
        self.remaining_quantity >= self.initial_quantity
    }
}

/// A closed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ticker: String,
    pub company_name: String,
    pub entry_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_timestamp: DateTime<Utc>,
    pub profit_rate: f64,
    pub holding_days: i64,
    pub scenario: ScenarioSnapshot,
    pub exit_reason: String,
}

impl TradeRecord {
    pub fn from_position(
        position: &Position,
        exit_price: f64,
        exit_timestamp: DateTime<Utc>,
        exit_reason: impl Into<String>,
    ) -> Self {
        Self {
            ticker: position.ticker.clone(),
            company_name: position.company_name.clone(),
            entry_price: position.entry_price,
            entry_timestamp: position.entry_timestamp,
            exit_price,
            exit_timestamp,
            profit_rate: profit_rate(position.entry_price, exit_price),
            holding_days: position.days_held(exit_timestamp),
            scenario: position.scenario.clone(),
            exit_reason: exit_reason.into(),
        }
    }
}

/// A candidate that was analyzed but not entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub ticker: String,
    pub company_name: String,
    pub current_price: f64,
    pub analyzed_at: DateTime<Utc>,
    pub buy_score: f64,
    pub min_score: f64,
    pub decision: String,
    pub skip_reason: String,
    pub target_price: f64,
    pub stop_loss: f64,
    pub scenario: ScenarioSnapshot,
}

/// Date key used for regime history.
pub fn regime_date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("{ticker}: cannot move from {from} to {to}")]
    InvalidTransition {
        ticker: String,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("Invalid sale: {0}")]
    InvalidSale(String),

    #[error("Unknown value: {0}")]
    UnknownValue(String),
}
