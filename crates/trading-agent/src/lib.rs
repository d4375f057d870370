pub mod config;
pub mod entry_gate;
pub mod exit_rules;
pub mod metrics;
pub mod portfolio_guard;
pub mod position_manager;
pub mod session;
pub mod trade_executor;
pub mod types;

pub use config::AgentConfig;
pub use entry_gate::{EntryContext, EntryRejection, EntryRules, EntryVerdict};
pub use exit_rules::{ExitAction, ExitContext, ExitDecision, ExitRule, ExitRules};
pub use metrics::{AgentMetrics, CycleMetrics};
pub use portfolio_guard::SlotCapacityManager;
pub use position_manager::PositionDecisionEngine;
pub use session::{Clock, FixedClock, SessionRouter, SystemClock};
pub use trade_executor::{ExecutionConfig, ExecutionError, ExecutionOutcome, OrderExecutor, OrderResult};
pub use types::*;
