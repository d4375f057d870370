use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use market_regime_detector::{MarketRegime, RegimeClass};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::models::*;
use crate::store::{PositionStore, StoreError};

/// SQLite-backed [`PositionStore`].
#[derive(Clone)]
pub struct SqlitePositionStore {
    pool: SqlitePool,
}

impl SqlitePositionStore {
    /// Create a new database connection and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // An in-memory database lives and dies with its single connection.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Get the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS positions (
                ticker TEXT PRIMARY KEY,
                company_name TEXT NOT NULL,
                entry_price REAL NOT NULL,
                entry_timestamp TEXT NOT NULL,
                current_price REAL NOT NULL,
                last_updated TEXT NOT NULL,
                target_price REAL NOT NULL DEFAULT 0,
                stop_loss REAL NOT NULL DEFAULT 0,
                investment_horizon TEXT NOT NULL,
                sector TEXT NOT NULL,
                rationale TEXT NOT NULL DEFAULT '',
                buy_score REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'open'
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS partial_sales (
                ticker TEXT PRIMARY KEY,
                initial_quantity REAL NOT NULL,
                remaining_quantity REAL NOT NULL,
                initial_buy_price REAL NOT NULL,
                avg_sell_price REAL NOT NULL DEFAULT 0,
                last_sell_date TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trade_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                company_name TEXT NOT NULL,
                entry_price REAL NOT NULL,
                entry_timestamp TEXT NOT NULL,
                exit_price REAL NOT NULL,
                exit_timestamp TEXT NOT NULL,
                profit_rate REAL NOT NULL,
                holding_days INTEGER NOT NULL,
                investment_horizon TEXT NOT NULL,
                sector TEXT NOT NULL,
                rationale TEXT NOT NULL DEFAULT '',
                buy_score REAL NOT NULL,
                exit_reason TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS watchlist_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                company_name TEXT NOT NULL,
                current_price REAL NOT NULL,
                analyzed_at TEXT NOT NULL,
                buy_score REAL NOT NULL,
                min_score REAL NOT NULL,
                decision TEXT NOT NULL,
                skip_reason TEXT NOT NULL,
                target_price REAL NOT NULL DEFAULT 0,
                stop_loss REAL NOT NULL DEFAULT 0,
                investment_horizon TEXT NOT NULL,
                sector TEXT NOT NULL,
                rationale TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS market_regimes (
                as_of_date TEXT PRIMARY KEY,
                broad_index_value REAL NOT NULL,
                growth_index_value REAL NOT NULL,
                broad_trend_sign INTEGER NOT NULL,
                growth_trend_sign INTEGER NOT NULL,
                aggregate_volatility_pct REAL NOT NULL,
                classification TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trade_history_ticker ON trade_history(ticker)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_watchlist_ticker ON watchlist_history(ticker)")
            .execute(&self.pool)
            .await
            .ok();

        Ok(())
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn scenario_from_row(row: &SqliteRow) -> Result<ScenarioSnapshot, StoreError> {
    let horizon: String = row.try_get("investment_horizon")?;
    Ok(ScenarioSnapshot {
        investment_horizon: horizon.parse()?,
        sector: row.try_get("sector")?,
        rationale: row.try_get("rationale")?,
        buy_score: row.try_get("buy_score")?,
    })
}

fn position_from_row(row: &SqliteRow) -> Result<Position, StoreError> {
    let entry_timestamp: String = row.try_get("entry_timestamp")?;
    let last_updated: String = row.try_get("last_updated")?;
    let status: String = row.try_get("status")?;
    Ok(Position {
        ticker: row.try_get("ticker")?,
        company_name: row.try_get("company_name")?,
        entry_price: row.try_get("entry_price")?,
        entry_timestamp: parse_ts(&entry_timestamp)?,
        current_price: row.try_get("current_price")?,
        last_updated: parse_ts(&last_updated)?,
        target_price: row.try_get("target_price")?,
        stop_loss: row.try_get("stop_loss")?,
        scenario: scenario_from_row(row)?,
        status: status.parse()?,
    })
}

fn partial_sale_from_row(row: &SqliteRow) -> Result<PartialSaleRecord, StoreError> {
    let last_sell_date: Option<String> = row.try_get("last_sell_date")?;
    Ok(PartialSaleRecord {
        ticker: row.try_get("ticker")?,
        initial_quantity: row.try_get("initial_quantity")?,
        remaining_quantity: row.try_get("remaining_quantity")?,
        initial_buy_price: row.try_get("initial_buy_price")?,
        avg_sell_price: row.try_get("avg_sell_price")?,
        last_sell_date: last_sell_date.as_deref().map(parse_ts).transpose()?,
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRecord, StoreError> {
    let entry_timestamp: String = row.try_get("entry_timestamp")?;
    let exit_timestamp: String = row.try_get("exit_timestamp")?;
    Ok(TradeRecord {
        ticker: row.try_get("ticker")?,
        company_name: row.try_get("company_name")?,
        entry_price: row.try_get("entry_price")?,
        entry_timestamp: parse_ts(&entry_timestamp)?,
        exit_price: row.try_get("exit_price")?,
        exit_timestamp: parse_ts(&exit_timestamp)?,
        profit_rate: row.try_get("profit_rate")?,
        holding_days: row.try_get("holding_days")?,
        scenario: scenario_from_row(row)?,
        exit_reason: row.try_get("exit_reason")?,
    })
}

fn watchlist_from_row(row: &SqliteRow) -> Result<WatchlistEntry, StoreError> {
    let analyzed_at: String = row.try_get("analyzed_at")?;
    Ok(WatchlistEntry {
        ticker: row.try_get("ticker")?,
        company_name: row.try_get("company_name")?,
        current_price: row.try_get("current_price")?,
        analyzed_at: parse_ts(&analyzed_at)?,
        buy_score: row.try_get("buy_score")?,
        min_score: row.try_get("min_score")?,
        decision: row.try_get("decision")?,
        skip_reason: row.try_get("skip_reason")?,
        target_price: row.try_get("target_price")?,
        stop_loss: row.try_get("stop_loss")?,
        scenario: scenario_from_row(row)?,
    })
}

fn regime_from_row(row: &SqliteRow) -> Result<MarketRegime, StoreError> {
    let date: String = row.try_get("as_of_date")?;
    let classification: String = row.try_get("classification")?;
    let broad_sign: i64 = row.try_get("broad_trend_sign")?;
    let growth_sign: i64 = row.try_get("growth_trend_sign")?;
    Ok(MarketRegime {
        as_of_date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| StoreError::Corrupt(format!("regime date '{}': {}", date, e)))?,
        benchmark_index_values: [
            row.try_get("broad_index_value")?,
            row.try_get("growth_index_value")?,
        ],
        benchmark_trend_signs: [broad_sign.signum() as i8, growth_sign.signum() as i8],
        aggregate_volatility_pct: row.try_get("aggregate_volatility_pct")?,
        classification: RegimeClass::from_str(&classification)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
    })
}

const UPSERT_POSITION: &str = "INSERT INTO positions (
        ticker, company_name, entry_price, entry_timestamp, current_price, last_updated,
        target_price, stop_loss, investment_horizon, sector, rationale, buy_score, status
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(ticker) DO UPDATE SET
        company_name = excluded.company_name,
        entry_price = excluded.entry_price,
        entry_timestamp = excluded.entry_timestamp,
        current_price = excluded.current_price,
        last_updated = excluded.last_updated,
        target_price = excluded.target_price,
        stop_loss = excluded.stop_loss,
        investment_horizon = excluded.investment_horizon,
        sector = excluded.sector,
        rationale = excluded.rationale,
        buy_score = excluded.buy_score,
        status = excluded.status";

const UPSERT_PARTIAL_SALE: &str = "INSERT INTO partial_sales (
        ticker, initial_quantity, remaining_quantity, initial_buy_price, avg_sell_price, last_sell_date
    ) VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT(ticker) DO UPDATE SET
        initial_quantity = excluded.initial_quantity,
        remaining_quantity = excluded.remaining_quantity,
        initial_buy_price = excluded.initial_buy_price,
        avg_sell_price = excluded.avg_sell_price,
        last_sell_date = excluded.last_sell_date";

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn active_positions(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query("SELECT * FROM positions WHERE status != 'closed' ORDER BY ticker")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn get_position(&self, ticker: &str) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query("SELECT * FROM positions WHERE ticker = ?")
            .bind(ticker)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn save_position(&self, p: &Position) -> Result<(), StoreError> {
        sqlx::query(UPSERT_POSITION)
            .bind(&p.ticker)
            .bind(&p.company_name)
            .bind(p.entry_price)
            .bind(ts(&p.entry_timestamp))
            .bind(p.current_price)
            .bind(ts(&p.last_updated))
            .bind(p.target_price)
            .bind(p.stop_loss)
            .bind(p.scenario.investment_horizon.as_str())
            .bind(&p.scenario.sector)
            .bind(&p.scenario.rationale)
            .bind(p.scenario.buy_score)
            .bind(p.status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn open_position(
        &self,
        p: &Position,
        record: &PartialSaleRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT ticker FROM positions WHERE ticker = ?")
            .bind(&p.ticker)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(StoreError::Conflict(format!("{} is already held", p.ticker)));
        }

        sqlx::query(UPSERT_POSITION)
            .bind(&p.ticker)
            .bind(&p.company_name)
            .bind(p.entry_price)
            .bind(ts(&p.entry_timestamp))
            .bind(p.current_price)
            .bind(ts(&p.last_updated))
            .bind(p.target_price)
            .bind(p.stop_loss)
            .bind(p.scenario.investment_horizon.as_str())
            .bind(&p.scenario.sector)
            .bind(&p.scenario.rationale)
            .bind(p.scenario.buy_score)
            .bind(p.status.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query(UPSERT_PARTIAL_SALE)
            .bind(&record.ticker)
            .bind(record.initial_quantity)
            .bind(record.remaining_quantity)
            .bind(record.initial_buy_price)
            .bind(record.avg_sell_price)
            .bind(record.last_sell_date.as_ref().map(ts))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn close_position(&self, ticker: &str, t: &TradeRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO trade_history (
                ticker, company_name, entry_price, entry_timestamp, exit_price, exit_timestamp,
                profit_rate, holding_days, investment_horizon, sector, rationale, buy_score, exit_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&t.ticker)
        .bind(&t.company_name)
        .bind(t.entry_price)
        .bind(ts(&t.entry_timestamp))
        .bind(t.exit_price)
        .bind(ts(&t.exit_timestamp))
        .bind(t.profit_rate)
        .bind(t.holding_days)
        .bind(t.scenario.investment_horizon.as_str())
        .bind(&t.scenario.sector)
        .bind(&t.scenario.rationale)
        .bind(t.scenario.buy_score)
        .bind(&t.exit_reason)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM positions WHERE ticker = ?")
            .bind(ticker)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM partial_sales WHERE ticker = ?")
            .bind(ticker)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_partial_sale(&self, ticker: &str) -> Result<Option<PartialSaleRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM partial_sales WHERE ticker = ?")
            .bind(ticker)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(partial_sale_from_row).transpose()
    }

    async fn save_partial_sale(&self, record: &PartialSaleRecord) -> Result<(), StoreError> {
        sqlx::query(UPSERT_PARTIAL_SALE)
            .bind(&record.ticker)
            .bind(record.initial_quantity)
            .bind(record.remaining_quantity)
            .bind(record.initial_buy_price)
            .bind(record.avg_sell_price)
            .bind(record.last_sell_date.as_ref().map(ts))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM trade_history ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn record_watchlist(&self, e: &WatchlistEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO watchlist_history (
                ticker, company_name, current_price, analyzed_at, buy_score, min_score, decision,
                skip_reason, target_price, stop_loss, investment_horizon, sector, rationale
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&e.ticker)
        .bind(&e.company_name)
        .bind(e.current_price)
        .bind(ts(&e.analyzed_at))
        .bind(e.buy_score)
        .bind(e.min_score)
        .bind(&e.decision)
        .bind(&e.skip_reason)
        .bind(e.target_price)
        .bind(e.stop_loss)
        .bind(e.scenario.investment_horizon.as_str())
        .bind(&e.scenario.sector)
        .bind(&e.scenario.rationale)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn watchlist_history(&self, limit: usize) -> Result<Vec<WatchlistEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM watchlist_history ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(watchlist_from_row).collect()
    }

    async fn record_regime(&self, r: &MarketRegime) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO market_regimes (
                as_of_date, broad_index_value, growth_index_value, broad_trend_sign,
                growth_trend_sign, aggregate_volatility_pct, classification
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(regime_date_key(r.as_of_date))
        .bind(r.benchmark_index_values[0])
        .bind(r.benchmark_index_values[1])
        .bind(r.benchmark_trend_signs[0] as i64)
        .bind(r.benchmark_trend_signs[1] as i64)
        .bind(r.aggregate_volatility_pct)
        .bind(r.classification.name())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn regime_for(&self, date: NaiveDate) -> Result<Option<MarketRegime>, StoreError> {
        let row = sqlx::query("SELECT * FROM market_regimes WHERE as_of_date = ?")
            .bind(regime_date_key(date))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(regime_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn store() -> SqlitePositionStore {
        SqlitePositionStore::connect("sqlite::memory:").await.unwrap()
    }

    fn scenario() -> ScenarioSnapshot {
        ScenarioSnapshot {
            investment_horizon: InvestmentHorizon::Swing,
            sector: "Internet".to_string(),
            rationale: "ad recovery".to_string(),
            buy_score: 8.5,
        }
    }

    fn position(ticker: &str) -> Position {
        let at = Utc.with_ymd_and_hms(2024, 11, 4, 0, 30, 0).unwrap();
        Position::open(ticker, "Kakao", 40_000.0, at, 46_000.0, 37_000.0, scenario())
    }

    #[tokio::test]
    async fn test_db_creation() {
        let db = store().await;
        assert!(db.pool().acquire().await.is_ok());
    }

    #[tokio::test]
    async fn open_then_read_back() {
        let db = store().await;
        let p = position("035720");
        db.open_position(&p, &PartialSaleRecord::new("035720", 40_000.0))
            .await
            .unwrap();

        assert_eq!(db.get_position("035720").await.unwrap(), Some(p.clone()));
        assert_eq!(db.active_positions().await.unwrap(), vec![p]);
        let record = db.get_partial_sale("035720").await.unwrap().unwrap();
        assert!(record.is_untouched());
    }

    #[tokio::test]
    async fn duplicate_open_conflicts() {
        let db = store().await;
        let p = position("035720");
        let record = PartialSaleRecord::new("035720", 40_000.0);
        db.open_position(&p, &record).await.unwrap();

        let err = db.open_position(&p, &record).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn close_moves_position_to_history() {
        let db = store().await;
        let mut p = position("035720");
        db.open_position(&p, &PartialSaleRecord::new("035720", 40_000.0))
            .await
            .unwrap();

        let exit_at = p.entry_timestamp + Duration::days(9);
        p.transition(PositionStatus::Closed).unwrap();
        let trade = TradeRecord::from_position(&p, 44_000.0, exit_at, "profit ≥10%");
        db.close_position("035720", &trade).await.unwrap();

        assert!(db.get_position("035720").await.unwrap().is_none());
        assert!(db.get_partial_sale("035720").await.unwrap().is_none());
        let history = db.trade_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].holding_days, 9);
        assert!((history[0].profit_rate - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn regime_is_replaced_per_date() {
        let db = store().await;
        let date = NaiveDate::from_ymd_opt(2024, 11, 4).unwrap();
        let mut regime = MarketRegime::neutral(date);
        db.record_regime(&regime).await.unwrap();

        regime.classification = RegimeClass::Bear;
        regime.benchmark_trend_signs = [-1, -1];
        db.record_regime(&regime).await.unwrap();

        assert_eq!(db.regime_for(date).await.unwrap(), Some(regime));
    }

    #[tokio::test]
    async fn watchlist_is_newest_first() {
        let db = store().await;
        for (i, ticker) in ["000270", "005380"].iter().enumerate() {
            db.record_watchlist(&WatchlistEntry {
                ticker: ticker.to_string(),
                company_name: "Hyundai group".to_string(),
                current_price: 100_000.0,
                analyzed_at: Utc.with_ymd_and_hms(2024, 11, 4, 1, i as u32, 0).unwrap(),
                buy_score: 7.0,
                min_score: 8.0,
                decision: "Enter".to_string(),
                skip_reason: "score shortfall (7<8)".to_string(),
                target_price: 0.0,
                stop_loss: 0.0,
                scenario: scenario(),
            })
            .await
            .unwrap();
        }

        let history = db.watchlist_history(1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].ticker, "005380");
    }
}
