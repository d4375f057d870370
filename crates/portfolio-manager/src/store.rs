use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use market_regime_detector::MarketRegime;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::*;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<PositionError> for StoreError {
    fn from(e: PositionError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Persistence boundary for positions and their history, keyed by ticker.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Open and partially closed positions.
    async fn active_positions(&self) -> Result<Vec<Position>, StoreError>;

    async fn get_position(&self, ticker: &str) -> Result<Option<Position>, StoreError>;

    /// Insert or update.
    async fn save_position(&self, position: &Position) -> Result<(), StoreError>;

    /// Create a position together with its partial-sale record. Fails with
    /// `Conflict` if the ticker is already held.
    async fn open_position(
        &self,
        position: &Position,
        record: &PartialSaleRecord,
    ) -> Result<(), StoreError>;

    /// Remove the active position and its partial-sale record, appending the
    /// round trip to trade history.
    async fn close_position(&self, ticker: &str, trade: &TradeRecord) -> Result<(), StoreError>;

    async fn get_partial_sale(&self, ticker: &str) -> Result<Option<PartialSaleRecord>, StoreError>;

    async fn save_partial_sale(&self, record: &PartialSaleRecord) -> Result<(), StoreError>;

    /// Most recent first.
    async fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;

    async fn record_watchlist(&self, entry: &WatchlistEntry) -> Result<(), StoreError>;

    /// Most recent first.
    async fn watchlist_history(&self, limit: usize) -> Result<Vec<WatchlistEntry>, StoreError>;

    /// Insert or replace the regime stamped for its date.
    async fn record_regime(&self, regime: &MarketRegime) -> Result<(), StoreError>;

    async fn regime_for(&self, date: NaiveDate) -> Result<Option<MarketRegime>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    positions: HashMap<String, Position>,
    partial_sales: HashMap<String, PartialSaleRecord>,
    trades: Vec<TradeRecord>,
    watchlist: Vec<WatchlistEntry>,
    regimes: BTreeMap<NaiveDate, MarketRegime>,
}

/// Process-local store, used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryPositionStore {
    state: RwLock<MemoryState>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn active_positions(&self) -> Result<Vec<Position>, StoreError> {
        let state = self.state.read().await;
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(positions)
    }

    async fn get_position(&self, ticker: &str) -> Result<Option<Position>, StoreError> {
        Ok(self.state.read().await.positions.get(ticker).cloned())
    }

    async fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .positions
            .insert(position.ticker.clone(), position.clone());
        Ok(())
    }

    async fn open_position(
        &self,
        position: &Position,
        record: &PartialSaleRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.positions.contains_key(&position.ticker) {
            return Err(StoreError::Conflict(format!(
                "{} is already held",
                position.ticker
            )));
        }
        state
            .positions
            .insert(position.ticker.clone(), position.clone());
        state
            .partial_sales
            .insert(record.ticker.clone(), record.clone());
        Ok(())
    }

    async fn close_position(&self, ticker: &str, trade: &TradeRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.positions.remove(ticker);
        state.partial_sales.remove(ticker);
        state.trades.push(trade.clone());
        Ok(())
    }

    async fn get_partial_sale(&self, ticker: &str) -> Result<Option<PartialSaleRecord>, StoreError> {
        Ok(self.state.read().await.partial_sales.get(ticker).cloned())
    }

    async fn save_partial_sale(&self, record: &PartialSaleRecord) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .partial_sales
            .insert(record.ticker.clone(), record.clone());
        Ok(())
    }

    async fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.trades.iter().rev().take(limit).cloned().collect())
    }

    async fn record_watchlist(&self, entry: &WatchlistEntry) -> Result<(), StoreError> {
        self.state.write().await.watchlist.push(entry.clone());
        Ok(())
    }

    async fn watchlist_history(&self, limit: usize) -> Result<Vec<WatchlistEntry>, StoreError> {
        let state = self.state.read().await;
        Ok(state.watchlist.iter().rev().take(limit).cloned().collect())
    }

    async fn record_regime(&self, regime: &MarketRegime) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .regimes
            .insert(regime.as_of_date, regime.clone());
        Ok(())
    }

    async fn regime_for(&self, date: NaiveDate) -> Result<Option<MarketRegime>, StoreError> {
        Ok(self.state.read().await.regimes.get(&date).cloned())
    }
}
