//! In-process brokerage simulation.
//!
//! Fills every accepted order immediately at the quoted price (or the limit
//! price for limit orders), regardless of price mode. Cash and holdings are
//! kept under a single lock so a fill is all-or-nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{BrokerClient, BrokerError, BrokerOrderAck, Holding, OrderRequest, OrderSide, Quote};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    pub initial_cash: Decimal,
    /// Artificial delay applied to every order submission.
    pub latency: Option<Duration>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_cash: dec!(10_000_000),
            latency: None,
        }
    }
}

impl PaperConfig {
    pub fn with_cash(mut self, cash: Decimal) -> Self {
        self.initial_cash = cash;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[derive(Debug, Clone)]
struct PaperHolding {
    quantity: u64,
    avg_price: Decimal,
}

#[derive(Debug)]
struct PaperAccount {
    cash: Decimal,
    holdings: HashMap<String, PaperHolding>,
    orders: Vec<(OrderRequest, BrokerOrderAck)>,
}

pub struct PaperBroker {
    config: PaperConfig,
    account: Mutex<PaperAccount>,
    quotes: DashMap<String, Decimal>,
    rejecting: AtomicBool,
}

impl PaperBroker {
    pub fn new(config: PaperConfig) -> Self {
        info!("Paper broker started with {} cash", config.initial_cash);
        Self {
            account: Mutex::new(PaperAccount {
                cash: config.initial_cash,
                holdings: HashMap::new(),
                orders: Vec::new(),
            }),
            config,
            quotes: DashMap::new(),
            rejecting: AtomicBool::new(false),
        }
    }

    pub fn set_quote(&self, ticker: impl Into<String>, price: Decimal) {
        self.quotes.insert(ticker.into(), price);
    }

    pub fn remove_quote(&self, ticker: &str) {
        self.quotes.remove(ticker);
    }

    /// Seed a holding without going through an order (e.g. positions carried over).
    pub async fn seed_holding(&self, ticker: impl Into<String>, quantity: u64, avg_price: Decimal) {
        self.account
            .lock()
            .await
            .holdings
            .insert(ticker.into(), PaperHolding { quantity, avg_price });
    }

    /// While set, every submission is declined.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Every submission so far with the answer it got.
    pub async fn orders(&self) -> Vec<(OrderRequest, BrokerOrderAck)> {
        self.account.lock().await.orders.clone()
    }

    fn quote_price(&self, ticker: &str) -> Result<Decimal, BrokerError> {
        self.quotes
            .get(ticker)
            .map(|p| *p)
            .ok_or_else(|| BrokerError::QuoteUnavailable(ticker.to_string()))
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(PaperConfig::default())
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn submit_order(&self, order: OrderRequest) -> Result<BrokerOrderAck> {
        if let Some(latency) = self.config.latency {
            tokio::time::sleep(latency).await;
        }
        if order.quantity == 0 {
            return Err(BrokerError::InvalidOrder(format!("{}: zero quantity", order.ticker)).into());
        }

        let price = match order.limit_price {
            Some(limit) => limit,
            None => self.quote_price(&order.ticker)?,
        };
        let qty = Decimal::from(order.quantity);
        let notional = price * qty;

        let mut account = self.account.lock().await;

        let decline = if self.rejecting.load(Ordering::SeqCst) {
            Some("order rejected by broker".to_string())
        } else {
            match order.side {
                OrderSide::Buy if notional > account.cash => Some(format!(
                    "insufficient cash: need {}, have {}",
                    notional, account.cash
                )),
                OrderSide::Sell => {
                    let held = account
                        .holdings
                        .get(&order.ticker)
                        .map(|h| h.quantity)
                        .unwrap_or(0);
                    (order.quantity > held).then(|| {
                        format!(
                            "insufficient holdings: sell {} of {}, hold {}",
                            order.quantity, order.ticker, held
                        )
                    })
                }
                _ => None,
            }
        };

        let ack = match decline {
            Some(message) => {
                debug!("Paper order declined: {}", message);
                BrokerOrderAck::rejected(message)
            }
            None => {
                match order.side {
                    OrderSide::Buy => {
                        account.cash -= notional;
                        let h = account
                            .holdings
                            .entry(order.ticker.clone())
                            .or_insert(PaperHolding {
                                quantity: 0,
                                avg_price: Decimal::ZERO,
                            });
                        let held = Decimal::from(h.quantity);
                        h.avg_price = (h.avg_price * held + notional) / (held + qty);
                        h.quantity += order.quantity;
                    }
                    OrderSide::Sell => {
                        account.cash += notional;
                        let emptied = match account.holdings.get_mut(&order.ticker) {
                            Some(h) => {
                                h.quantity -= order.quantity;
                                h.quantity == 0
                            }
                            None => false,
                        };
                        if emptied {
                            account.holdings.remove(&order.ticker);
                        }
                    }
                }

                info!(
                    "Paper fill: {:?} {} x{} @ {} ({})",
                    order.side, order.ticker, order.quantity, price, order.price_mode
                );
                BrokerOrderAck {
                    order_id: Some(Uuid::new_v4().to_string()),
                    accepted: true,
                    message: format!("filled ({})", order.price_mode),
                    filled_quantity: order.quantity,
                    fill_price: Some(price),
                    submitted_at: Utc::now(),
                }
            }
        };

        account.orders.push((order, ack.clone()));
        Ok(ack)
    }

    async fn get_holdings(&self) -> Result<Vec<Holding>> {
        let account = self.account.lock().await;
        let mut holdings: Vec<Holding> = account
            .holdings
            .iter()
            .map(|(ticker, h)| Holding {
                ticker: ticker.clone(),
                quantity: h.quantity,
                avg_price: h.avg_price,
                current_price: self.quote_price(ticker).unwrap_or(h.avg_price),
            })
            .collect();
        holdings.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(holdings)
    }

    async fn get_quote(&self, ticker: &str) -> Result<Quote> {
        Ok(Quote {
            ticker: ticker.to_string(),
            price: self.quote_price(ticker)?,
            timestamp: Utc::now(),
        })
    }

    async fn cash_balance(&self) -> Result<Decimal> {
        Ok(self.account.lock().await.cash)
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PriceMode;

    fn broker() -> PaperBroker {
        let b = PaperBroker::new(PaperConfig::default().with_cash(dec!(1_000_000)));
        b.set_quote("005930", dec!(70000));
        b
    }

    #[tokio::test]
    async fn buy_then_sell_round_trip() {
        let b = broker();
        let ack = b
            .submit_order(OrderRequest::buy("005930", 10, PriceMode::Market))
            .await
            .unwrap();
        assert!(ack.accepted);
        assert!(ack.order_id.is_some());
        assert_eq!(b.cash_balance().await.unwrap(), dec!(300000));

        b.set_quote("005930", dec!(77000));
        let holding = b.get_holding("005930").await.unwrap().unwrap();
        assert_eq!(holding.quantity, 10);
        assert!((holding.profit_rate() - 10.0).abs() < 1e-9);

        let ack = b
            .submit_order(OrderRequest::sell("005930", 10, PriceMode::ClosingPrice))
            .await
            .unwrap();
        assert!(ack.accepted);
        assert!(b.get_holding("005930").await.unwrap().is_none());
        assert_eq!(b.cash_balance().await.unwrap(), dec!(1070000));
    }

    #[tokio::test]
    async fn oversell_is_declined_not_an_error() {
        let b = broker();
        b.seed_holding("005930", 3, dec!(65000)).await;
        let ack = b
            .submit_order(OrderRequest::sell("005930", 4, PriceMode::Market))
            .await
            .unwrap();
        assert!(!ack.accepted);
        assert!(ack.message.contains("insufficient holdings"));
        assert_eq!(b.get_holding("005930").await.unwrap().unwrap().quantity, 3);
    }

    #[tokio::test]
    async fn insufficient_cash_is_declined() {
        let b = broker();
        let ack = b
            .submit_order(OrderRequest::buy("005930", 100, PriceMode::Market))
            .await
            .unwrap();
        assert!(!ack.accepted);
        assert_eq!(b.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_quote_is_an_error() {
        let b = broker();
        assert!(b.get_quote("000000").await.is_err());
        assert!(b
            .submit_order(OrderRequest::buy("000000", 1, PriceMode::Market))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rejecting_switch_declines_everything() {
        let b = broker();
        b.set_rejecting(true);
        let ack = b
            .submit_order(OrderRequest::buy("005930", 1, PriceMode::Market))
            .await
            .unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.message, "order rejected by broker");
    }
}
