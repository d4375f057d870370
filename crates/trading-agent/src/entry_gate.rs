use market_regime_detector::RegimeClass;
use thiserror::Error;

use crate::portfolio_guard::SlotCapacityManager;
use crate::types::{Decision, Scenario};

/// Why a scenario was not entered. The display form is the reason carried by
/// skip notifications and the watchlist.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EntryRejection {
    #[error("sector cap ({sector})")]
    SectorCap { sector: String },

    #[error("score shortfall ({score}<{min_score})")]
    ScoreShortfall { score: f64, min_score: f64 },

    #[error("decision not Enter ({decision})")]
    DecisionNotEnter { decision: Decision },

    #[error("already holding {ticker}")]
    AlreadyHeld { ticker: String },

    #[error("slots full ({open}/{capacity})")]
    SlotsFull { open: usize, capacity: usize },
}

/// Minimum score table.
#[derive(Debug, Clone)]
pub struct EntryRules {
    pub base_min_score: f64,
    pub bear_min_score: f64,
    pub bull_min_score: f64,
    /// Occupancy at which the bar goes up.
    pub crowded_occupancy: f64,
    pub crowded_penalty: f64,
}

impl Default for EntryRules {
    fn default() -> Self {
        Self {
            base_min_score: 8.0,
            bear_min_score: 9.0,
            bull_min_score: 7.0,
            crowded_occupancy: 0.7,
            crowded_penalty: 1.0,
        }
    }
}

pub struct EntryContext<'a> {
    pub scenario: &'a Scenario,
    pub regime: RegimeClass,
    pub sector_diverse: bool,
    pub already_held: bool,
    pub open_positions: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryVerdict {
    pub min_score: f64,
    pub rejection: Option<EntryRejection>,
}

impl EntryVerdict {
    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

impl EntryRules {
    pub fn min_score(&self, regime: RegimeClass, open_positions: usize, capacity: usize) -> f64 {
        let base = match regime {
            RegimeClass::Bear => self.bear_min_score,
            RegimeClass::Bull => self.bull_min_score,
            RegimeClass::Neutral => self.base_min_score,
        };
        if SlotCapacityManager::occupancy(open_positions, capacity) >= self.crowded_occupancy {
            base + self.crowded_penalty
        } else {
            base
        }
    }

    /// First blocking reason wins: sector, score, decision, duplicate, slots.
    pub fn evaluate(&self, ctx: &EntryContext<'_>) -> EntryVerdict {
        let min_score = self.min_score(ctx.regime, ctx.open_positions, ctx.capacity);
        let s = ctx.scenario;
        let score = s.effective_score();

        let rejection = if !ctx.sector_diverse {
            Some(EntryRejection::SectorCap {
                sector: s.sector.clone(),
            })
        } else if score < min_score {
            Some(EntryRejection::ScoreShortfall { score, min_score })
        } else if s.decision != Decision::Enter {
            Some(EntryRejection::DecisionNotEnter {
                decision: s.decision,
            })
        } else if ctx.already_held {
            Some(EntryRejection::AlreadyHeld {
                ticker: s.ticker.clone(),
            })
        } else if !SlotCapacityManager::has_free_slot(ctx.open_positions, ctx.capacity) {
            Some(EntryRejection::SlotsFull {
                open: ctx.open_positions,
                capacity: ctx.capacity,
            })
        } else {
            None
        };

        match &rejection {
            Some(reason) => tracing::info!(
                "Entry held for {}: {} (score {:.1}, min {:.1}, regime {})",
                s.ticker,
                reason,
                score,
                min_score,
                ctx.regime
            ),
            None => tracing::info!(
                "Entry accepted for {} (score {:.1} >= {:.1}, regime {}, slots {}/{})",
                s.ticker,
                score,
                min_score,
                ctx.regime,
                ctx.open_positions,
                ctx.capacity
            ),
        }

        EntryVerdict {
            min_score,
            rejection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawScenario;

    fn scenario(score: f64, decision: &str) -> Scenario {
        RawScenario {
            ticker: "000660".to_string(),
            current_price: Some(180_000.0),
            decision: Some(decision.to_string()),
            buy_score: Some(score),
            sector: Some("Semiconductors".to_string()),
            ..RawScenario::default()
        }
        .validate()
        .unwrap()
    }

    fn ctx(s: &Scenario, regime: RegimeClass, open: usize) -> EntryContext<'_> {
        EntryContext {
            scenario: s,
            regime,
            sector_diverse: true,
            already_held: false,
            open_positions: open,
            capacity: 10,
        }
    }

    #[test]
    fn min_score_by_regime_and_crowding() {
        let rules = EntryRules::default();
        assert_eq!(rules.min_score(RegimeClass::Neutral, 0, 10), 8.0);
        assert_eq!(rules.min_score(RegimeClass::Bear, 0, 10), 9.0);
        assert_eq!(rules.min_score(RegimeClass::Bull, 6, 10), 7.0);
        assert_eq!(rules.min_score(RegimeClass::Bull, 7, 10), 8.0);
        assert_eq!(rules.min_score(RegimeClass::Bear, 9, 10), 10.0);
    }

    #[test]
    fn crowded_book_raises_the_bar() {
        let s = scenario(8.0, "Enter");
        let verdict = EntryRules::default().evaluate(&ctx(&s, RegimeClass::Neutral, 8));
        assert_eq!(verdict.min_score, 9.0);
        assert_eq!(
            verdict.rejection.unwrap().to_string(),
            "score shortfall (8<9)"
        );
    }

    #[test]
    fn momentum_bonus_counts_toward_score() {
        let mut s = scenario(8.0, "Enter");
        s.momentum_bonus = 1.0;
        assert!(EntryRules::default()
            .evaluate(&ctx(&s, RegimeClass::Neutral, 8))
            .is_accepted());
    }

    #[test]
    fn blocking_reasons_in_order() {
        let rules = EntryRules::default();
        let s = scenario(5.0, "Hold");

        let mut c = ctx(&s, RegimeClass::Neutral, 10);
        c.sector_diverse = false;
        c.already_held = true;
        assert_eq!(
            rules.evaluate(&c).rejection,
            Some(EntryRejection::SectorCap { sector: "Semiconductors".to_string() })
        );

        c.sector_diverse = true;
        assert!(matches!(
            rules.evaluate(&c).rejection,
            Some(EntryRejection::ScoreShortfall { .. })
        ));

        let strong_hold = scenario(10.0, "Hold");
        let mut c = ctx(&strong_hold, RegimeClass::Neutral, 10);
        c.already_held = true;
        assert_eq!(
            rules.evaluate(&c).rejection.unwrap().to_string(),
            "decision not Enter (Hold)"
        );

        let strong = scenario(10.0, "Enter");
        let mut c = ctx(&strong, RegimeClass::Neutral, 10);
        c.already_held = true;
        assert_eq!(
            rules.evaluate(&c).rejection.unwrap().to_string(),
            "already holding 000660"
        );

        c.already_held = false;
        assert_eq!(
            rules.evaluate(&c).rejection.unwrap().to_string(),
            "slots full (10/10)"
        );
    }

    #[test]
    fn bull_market_admits_seven() {
        let s = scenario(7.0, "enter");
        assert!(EntryRules::default()
            .evaluate(&ctx(&s, RegimeClass::Bull, 2))
            .is_accepted());
    }
}
