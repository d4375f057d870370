use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::entry_gate::EntryRules;
use crate::exit_rules::ExitRules;
use crate::portfolio_guard::SlotCapacityManager;
use crate::trade_executor::ExecutionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Order execution
    pub auto_trading_enabled: bool,       // false: every order returns a disabled result
    pub paper_trading: bool,              // true: in-process paper broker
    pub default_buy_amount: f64,          // capital per entry (1,000,000)
    pub max_concurrent_orders: usize,     // 3
    pub order_timeout_seconds: u64,       // 30
    pub order_pacing_ms: u64,             // 500 between quote and submit

    // Slots
    pub max_slots: usize,                 // 10
    pub max_same_sector: usize,           // 3
    pub sector_concentration_ratio: f64,  // 0.3

    // Exits
    pub partial_sell_ratio: f64,          // 0.5
    pub remaining_hold_criteria: f64,     // 1.05

    // Analysis windows (days)
    pub trend_window_days: i64,           // 14
    pub exit_trend_window_days: i64,      // 7
    pub volatility_window_days: i64,      // 60
    pub regime_window_days: i64,          // 30
    pub benchmark_indices: Vec<String>,   // broad, growth

    // Session
    pub market_timezone: String,          // Asia/Seoul
    pub cycle_interval_seconds: u64,      // 300
    pub metrics_log_interval_cycles: u64, // 12, 0 = only at shutdown

    // Inputs / storage
    pub database_url: String,
    pub scenario_file: Option<String>,
    pub price_data_file: Option<String>,
    pub paper_starting_cash: f64,         // 10,000,000
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            auto_trading_enabled: env::var("AUTO_TRADING_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            paper_trading: env::var("PAPER_TRADING")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            default_buy_amount: env::var("DEFAULT_BUY_AMOUNT")
                .unwrap_or_else(|_| "1000000".to_string())
                .parse()?,
            max_concurrent_orders: env::var("MAX_CONCURRENT_ORDERS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            order_timeout_seconds: env::var("ORDER_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            order_pacing_ms: env::var("ORDER_PACING_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()?,

            max_slots: env::var("MAX_SLOTS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            max_same_sector: env::var("MAX_SAME_SECTOR")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            sector_concentration_ratio: env::var("SECTOR_CONCENTRATION_RATIO")
                .unwrap_or_else(|_| "0.3".to_string())
                .parse()?,

            partial_sell_ratio: env::var("PARTIAL_SELL_RATIO")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,
            remaining_hold_criteria: env::var("REMAINING_HOLD_CRITERIA")
                .unwrap_or_else(|_| "1.05".to_string())
                .parse()?,

            trend_window_days: env::var("TREND_WINDOW_DAYS")
                .unwrap_or_else(|_| "14".to_string())
                .parse()?,
            exit_trend_window_days: env::var("EXIT_TREND_WINDOW_DAYS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()?,
            volatility_window_days: env::var("VOLATILITY_WINDOW_DAYS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            regime_window_days: env::var("REGIME_WINDOW_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            benchmark_indices: env::var("BENCHMARK_INDICES")
                .unwrap_or_else(|_| "1001,2001".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            market_timezone: env::var("MARKET_TIMEZONE")
                .unwrap_or_else(|_| "Asia/Seoul".to_string()),
            cycle_interval_seconds: env::var("CYCLE_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            metrics_log_interval_cycles: env::var("METRICS_LOG_INTERVAL_CYCLES")
                .unwrap_or_else(|_| "12".to_string())
                .parse()?,

            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:position_tracking.db".to_string()),
            scenario_file: env::var("SCENARIO_FILE").ok().filter(|s| !s.is_empty()),
            price_data_file: env::var("PRICE_DATA_FILE").ok().filter(|s| !s.is_empty()),
            paper_starting_cash: env::var("PAPER_STARTING_CASH")
                .unwrap_or_else(|_| "10000000".to_string())
                .parse()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.partial_sell_ratio > 0.0 && self.partial_sell_ratio <= 1.0) {
            bail!("PARTIAL_SELL_RATIO must be in (0, 1], got {}", self.partial_sell_ratio);
        }
        if !(self.sector_concentration_ratio > 0.0 && self.sector_concentration_ratio <= 1.0) {
            bail!(
                "SECTOR_CONCENTRATION_RATIO must be in (0, 1], got {}",
                self.sector_concentration_ratio
            );
        }
        if self.remaining_hold_criteria < 1.0 {
            bail!("REMAINING_HOLD_CRITERIA must be >= 1.0, got {}", self.remaining_hold_criteria);
        }
        if self.max_slots == 0 {
            bail!("MAX_SLOTS must be at least 1");
        }
        if self.max_same_sector == 0 {
            bail!("MAX_SAME_SECTOR must be at least 1");
        }
        if self.max_concurrent_orders == 0 {
            bail!("MAX_CONCURRENT_ORDERS must be at least 1");
        }
        if self.order_timeout_seconds == 0 {
            bail!("ORDER_TIMEOUT_SECONDS must be at least 1");
        }
        if !(self.default_buy_amount.is_finite() && self.default_buy_amount > 0.0) {
            bail!("DEFAULT_BUY_AMOUNT must be positive, got {}", self.default_buy_amount);
        }
        for (name, days) in [
            ("TREND_WINDOW_DAYS", self.trend_window_days),
            ("EXIT_TREND_WINDOW_DAYS", self.exit_trend_window_days),
            ("VOLATILITY_WINDOW_DAYS", self.volatility_window_days),
            ("REGIME_WINDOW_DAYS", self.regime_window_days),
        ] {
            if days < 2 {
                bail!("{} must be at least 2, got {}", name, days);
            }
        }
        if self.benchmark_indices.len() != 2 {
            bail!(
                "BENCHMARK_INDICES needs exactly two index ids, got {:?}",
                self.benchmark_indices
            );
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.market_timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("unknown MARKET_TIMEZONE '{}': {}", self.market_timezone, e))
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            auto_trading_enabled: self.auto_trading_enabled,
            buy_amount: self.default_buy_amount,
            max_concurrent_orders: self.max_concurrent_orders,
            timeout: Duration::from_secs(self.order_timeout_seconds),
            pacing: Duration::from_millis(self.order_pacing_ms),
        }
    }

    pub fn slot_manager(&self) -> SlotCapacityManager {
        SlotCapacityManager::new(
            self.max_slots,
            self.max_same_sector,
            self.sector_concentration_ratio,
        )
    }

    pub fn exit_rules(&self) -> ExitRules {
        ExitRules {
            partial_sell_ratio: self.partial_sell_ratio,
            remaining_hold_criteria: self.remaining_hold_criteria,
        }
    }

    pub fn entry_rules(&self) -> EntryRules {
        EntryRules::default()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            auto_trading_enabled: false,
            paper_trading: true,
            default_buy_amount: 1_000_000.0,
            max_concurrent_orders: 3,
            order_timeout_seconds: 30,
            order_pacing_ms: 500,
            max_slots: 10,
            max_same_sector: 3,
            sector_concentration_ratio: 0.3,
            partial_sell_ratio: 0.5,
            remaining_hold_criteria: 1.05,
            trend_window_days: 14,
            exit_trend_window_days: 7,
            volatility_window_days: 60,
            regime_window_days: 30,
            benchmark_indices: vec!["1001".to_string(), "2001".to_string()],
            market_timezone: "Asia/Seoul".to_string(),
            cycle_interval_seconds: 300,
            metrics_log_interval_cycles: 12,
            database_url: "sqlite:position_tracking.db".to_string(),
            scenario_file: None,
            price_data_file: None,
            paper_starting_cash: 10_000_000.0,
        }
    }
}
