use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{AnalysisError, Bar, DateWindow};

/// Source of daily price history for instruments and benchmark indices.
#[async_trait]
pub trait PriceDataProvider: Send + Sync {
    /// Daily bars for `symbol` inside `window`, oldest first.
    async fn daily_bars(&self, symbol: &str, window: DateWindow) -> Result<Vec<Bar>, AnalysisError>;
}

/// Price history held in memory, keyed by symbol.
#[derive(Default)]
pub struct InMemoryPriceData {
    series: DashMap<String, Vec<Bar>>,
}

impl InMemoryPriceData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the series for `symbol`. Bars are kept sorted by timestamp.
    pub fn insert(&self, symbol: impl Into<String>, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.timestamp);
        self.series.insert(symbol.into(), bars);
    }

    pub fn remove(&self, symbol: &str) {
        self.series.remove(symbol);
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Close of the most recent bar.
    pub fn latest_close(&self, symbol: &str) -> Option<f64> {
        self.series.get(symbol).and_then(|s| s.last().map(|b| b.close))
    }

    /// Load a `{ "SYMBOL": [bar, ...] }` JSON snapshot.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        let data = Self::new();
        data.reload_json_file(path)?;
        Ok(data)
    }

    /// Replace every series present in the snapshot at `path`. Symbols the
    /// file does not mention keep their history. Returns the symbols loaded.
    /// A file that fails to read or parse leaves the current data untouched.
    pub fn reload_json_file(&self, path: impl AsRef<Path>) -> Result<usize, AnalysisError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AnalysisError::DataUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let parsed: HashMap<String, Vec<Bar>> = serde_json::from_str(&raw)
            .map_err(|e| AnalysisError::InvalidData(format!("{}: {}", path.display(), e)))?;

        let loaded = parsed.len();
        for (symbol, bars) in parsed {
            self.insert(symbol, bars);
        }
        Ok(loaded)
    }
}

#[async_trait]
impl PriceDataProvider for InMemoryPriceData {
    async fn daily_bars(&self, symbol: &str, window: DateWindow) -> Result<Vec<Bar>, AnalysisError> {
        let series = self
            .series
            .get(symbol)
            .ok_or_else(|| AnalysisError::DataUnavailable(format!("no price history for {symbol}")))?;

        Ok(series
            .iter()
            .filter(|b| window.contains(b.date()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn bar(day: u32, close: f64) -> Bar {
        Bar::daily_close(Utc.with_ymd_and_hms(2024, 3, day, 6, 0, 0).unwrap(), close)
    }

    #[tokio::test]
    async fn filters_by_window() {
        let data = InMemoryPriceData::new();
        data.insert("005930", vec![bar(10, 3.0), bar(1, 1.0), bar(5, 2.0)]);

        let as_of = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let bars = data
            .daily_bars("005930", DateWindow::trailing_days(as_of, 6))
            .await
            .unwrap();

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn unknown_symbol_is_unavailable() {
        let data = InMemoryPriceData::new();
        let as_of = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let err = data
            .daily_bars("000660", DateWindow::trailing_days(as_of, 30))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::DataUnavailable(_)));
    }

    #[test]
    fn latest_close_follows_sorted_order() {
        let data = InMemoryPriceData::new();
        data.insert("035420", vec![bar(4, 210.0), bar(2, 200.0)]);
        data.insert("000660", vec![bar(1, 5.0)]);

        assert_eq!(data.latest_close("035420"), Some(210.0));
        assert_eq!(data.latest_close("999999"), None);
        assert_eq!(data.symbols(), vec!["000660".to_string(), "035420".to_string()]);
    }

    #[test]
    fn reload_replaces_listed_series_only() {
        let path = std::env::temp_dir().join(format!("prices-reload-{}.json", std::process::id()));
        let snapshot: HashMap<String, Vec<Bar>> =
            HashMap::from([("005930".to_string(), vec![bar(1, 70_000.0), bar(2, 71_000.0)])]);
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let data = InMemoryPriceData::new();
        data.insert("005930", vec![bar(1, 1.0)]);
        data.insert("000660", vec![bar(1, 5.0)]);
        assert_eq!(data.reload_json_file(&path).unwrap(), 1);
        assert_eq!(data.latest_close("005930"), Some(71_000.0));
        assert_eq!(data.latest_close("000660"), Some(5.0));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            data.reload_json_file(&path),
            Err(AnalysisError::InvalidData(_))
        ));
        assert_eq!(data.latest_close("005930"), Some(71_000.0));
        std::fs::remove_file(&path).ok();
    }
}
