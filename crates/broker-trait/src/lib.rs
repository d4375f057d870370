use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod paper;

pub use paper::{PaperBroker, PaperConfig};

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// How the order is priced. The session router picks one from the time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    Market,
    Limit,
    ClosingPrice,
    AfterHoursSingle,
    /// Queued for the next regular session.
    Reserved,
}

impl PriceMode {
    pub fn name(&self) -> &'static str {
        match self {
            PriceMode::Market => "market",
            PriceMode::Limit => "limit",
            PriceMode::ClosingPrice => "closing_price",
            PriceMode::AfterHoursSingle => "after_hours_single",
            PriceMode::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for PriceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub price_mode: PriceMode,
    pub limit_price: Option<Decimal>,
}

impl OrderRequest {
    pub fn buy(ticker: impl Into<String>, quantity: u64, price_mode: PriceMode) -> Self {
        Self {
            ticker: ticker.into(),
            side: OrderSide::Buy,
            quantity,
            price_mode,
            limit_price: None,
        }
    }

    pub fn sell(ticker: impl Into<String>, quantity: u64, price_mode: PriceMode) -> Self {
        Self {
            ticker: ticker.into(),
            side: OrderSide::Sell,
            quantity,
            price_mode,
            limit_price: None,
        }
    }

    pub fn with_limit(mut self, price: Decimal) -> Self {
        self.price_mode = PriceMode::Limit;
        self.limit_price = Some(price);
        self
    }
}

/// What the broker answered. A declined order is `accepted == false` with the
/// broker's own message, not an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderAck {
    pub order_id: Option<String>,
    pub accepted: bool,
    pub message: String,
    pub filled_quantity: u64,
    pub fill_price: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
}

impl BrokerOrderAck {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            order_id: None,
            accepted: false,
            message: message.into(),
            filled_quantity: 0,
            fill_price: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn fill_price_f64(&self) -> Option<f64> {
        self.fill_price.and_then(|p| p.to_f64())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: String,
    pub quantity: u64,
    pub avg_price: Decimal,
    pub current_price: Decimal,
}

impl Holding {
    /// Signed percent gain over the average price.
    pub fn profit_rate(&self) -> f64 {
        if self.avg_price <= Decimal::ZERO {
            return 0.0;
        }
        ((self.current_price - self.avg_price) / self.avg_price * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0)
    }

    pub fn market_value(&self) -> Decimal {
        self.current_price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub ticker: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn price_f64(&self) -> f64 {
        self.price.to_f64().unwrap_or(0.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("No quote for {0}")]
    QuoteUnavailable(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit an order. Declines come back as an ack with `accepted == false`.
    async fn submit_order(&self, order: OrderRequest) -> Result<BrokerOrderAck>;

    /// All current holdings
    async fn get_holdings(&self) -> Result<Vec<Holding>>;

    /// A specific holding by ticker (None if not held)
    async fn get_holding(&self, ticker: &str) -> Result<Option<Holding>> {
        Ok(self
            .get_holdings()
            .await?
            .into_iter()
            .find(|h| h.ticker == ticker))
    }

    /// Latest quote
    async fn get_quote(&self, ticker: &str) -> Result<Quote>;

    /// Available cash
    async fn cash_balance(&self) -> Result<Decimal>;

    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}
