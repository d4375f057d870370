use std::fmt;

use portfolio_manager::{InvestmentHorizon, ScenarioSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const UNKNOWN_SECTOR: &str = "Unknown";

/// Entry scenario as it arrives from the analysis pipeline. Everything is
/// optional here; [`RawScenario::validate`] decides what is usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawScenario {
    #[serde(alias = "stock_code")]
    pub ticker: String,
    #[serde(alias = "stock_name")]
    pub company_name: String,
    pub current_price: Option<f64>,
    pub decision: Option<String>,
    pub buy_score: Option<f64>,
    pub sector: Option<String>,
    #[serde(alias = "sector_diverse")]
    pub sector_diversity: Option<bool>,
    pub momentum_bonus: Option<f64>,
    #[serde(alias = "investment_period")]
    pub investment_horizon: Option<String>,
    pub target_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub max_portfolio_size: Option<usize>,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Enter,
    Hold,
}

impl Decision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "enter" | "entry" | "buy" | "진입" => Some(Decision::Enter),
            "hold" | "wait" | "skip" | "관망" => Some(Decision::Hold),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Enter => f.write_str("Enter"),
            Decision::Hold => f.write_str("Hold"),
        }
    }
}

/// A validated entry scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub ticker: String,
    pub company_name: String,
    pub current_price: f64,
    pub decision: Decision,
    pub buy_score: f64,
    pub momentum_bonus: f64,
    pub sector: String,
    /// None means "compute it from open positions".
    pub sector_diversity: Option<bool>,
    pub investment_horizon: InvestmentHorizon,
    /// 0 = unset
    pub target_price: f64,
    /// 0 = unset
    pub stop_loss: f64,
    pub max_portfolio_size: Option<usize>,
    pub rationale: String,
}

impl Scenario {
    /// Score used against the entry bar.
    pub fn effective_score(&self) -> f64 {
        self.buy_score + self.momentum_bonus
    }

    pub fn snapshot(&self) -> ScenarioSnapshot {
        ScenarioSnapshot {
            investment_horizon: self.investment_horizon,
            sector: self.sector.clone(),
            rationale: self.rationale.clone(),
            buy_score: self.buy_score,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScenarioError {
    #[error("scenario has no ticker")]
    MissingTicker,

    #[error("{ticker}: invalid current price {price:?}")]
    InvalidPrice { ticker: String, price: Option<f64> },

    #[error("{ticker}: buy score {score:?} outside 0..=10")]
    ScoreOutOfRange { ticker: String, score: Option<f64> },

    #[error("{ticker}: unknown decision {decision:?}")]
    UnknownDecision { ticker: String, decision: Option<String> },
}

fn level_or_unset(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

impl RawScenario {
    pub fn validate(self) -> Result<Scenario, ScenarioError> {
        let ticker = self.ticker.trim().to_string();
        if ticker.is_empty() {
            return Err(ScenarioError::MissingTicker);
        }

        let current_price = match self.current_price {
            Some(p) if p.is_finite() && p > 0.0 => p,
            other => return Err(ScenarioError::InvalidPrice { ticker, price: other }),
        };

        let buy_score = match self.buy_score {
            Some(s) if (0.0..=10.0).contains(&s) => s,
            other => return Err(ScenarioError::ScoreOutOfRange { ticker, score: other }),
        };

        let decision = match self.decision.as_deref().and_then(Decision::parse) {
            Some(d) => d,
            None => {
                return Err(ScenarioError::UnknownDecision {
                    ticker,
                    decision: self.decision,
                })
            }
        };

        let investment_horizon = match self.investment_horizon.as_deref() {
            None => InvestmentHorizon::default(),
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!("{}: unknown investment horizon '{}', using medium", ticker, raw);
                InvestmentHorizon::default()
            }),
        };

        let sector = self
            .sector
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN_SECTOR.to_string());

        let company_name = if self.company_name.trim().is_empty() {
            ticker.clone()
        } else {
            self.company_name.trim().to_string()
        };

        Ok(Scenario {
            company_name,
            current_price,
            decision,
            buy_score,
            momentum_bonus: self.momentum_bonus.filter(|b| b.is_finite()).unwrap_or(0.0),
            sector,
            sector_diversity: self.sector_diversity,
            investment_horizon,
            target_price: level_or_unset(self.target_price),
            stop_loss: level_or_unset(self.stop_loss),
            max_portfolio_size: self.max_portfolio_size,
            rationale: self.rationale.unwrap_or_default(),
            ticker,
        })
    }

    /// Parse a JSON array of scenarios.
    pub fn parse_batch(json: &str) -> serde_json::Result<Vec<RawScenario>> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Low => f.write_str("low"),
            Urgency::Medium => f.write_str("medium"),
            Urgency::High => f.write_str("high"),
        }
    }
}

/// New stop/target suggested by an external reviewer. Zero or negative
/// values leave the current level untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAdjustmentProposal {
    pub ticker: String,
    #[serde(default)]
    pub new_target_price: f64,
    #[serde(default)]
    pub new_stop_loss: f64,
    pub urgency: Urgency,
    #[serde(default)]
    pub reason: String,
}
