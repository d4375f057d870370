pub mod db;
pub mod models;
pub mod partial_sale;
pub mod store;
pub mod summary;

pub use db::SqlitePositionStore;
pub use models::*;
pub use partial_sale::{PartialSaleTracker, DEFAULT_PARTIAL_SELL_RATIO};
pub use store::{InMemoryPositionStore, PositionStore, StoreError};
pub use summary::{PerformanceMetrics, PortfolioSummary, PositionSnapshot};
