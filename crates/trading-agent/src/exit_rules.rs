use chrono::{DateTime, Utc};
use market_regime_detector::RegimeClass;
use portfolio_manager::{InvestmentHorizon, PartialSaleRecord, Position, DEFAULT_PARTIAL_SELL_RATIO};
use serde::{Deserialize, Serialize};
use technical_analysis::TrendScore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExitAction {
    Hold,
    /// Sell this fraction of what is still held.
    PartialSell { fraction: f64 },
    Close,
}

/// Which rule produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitRule {
    StopLoss,
    StopDeferred,
    TargetPartial,
    TargetHold,
    TargetRemainder,
    BearQuickExit,
    ShortHorizonProfit,
    ShortHorizonLoss,
    ProfitThreshold,
    LossThreshold,
    LongHoldLoss,
    LongHoldProfit,
    LongHorizonLoss,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub action: ExitAction,
    pub rule: ExitRule,
    pub reason: String,
}

impl ExitDecision {
    fn new(action: ExitAction, rule: ExitRule, reason: impl Into<String>) -> Self {
        Self {
            action,
            rule,
            reason: reason.into(),
        }
    }

    fn hold(rule: ExitRule, reason: impl Into<String>) -> Self {
        Self::new(ExitAction::Hold, rule, reason)
    }

    fn close(rule: ExitRule, reason: impl Into<String>) -> Self {
        Self::new(ExitAction::Close, rule, reason)
    }
}

pub struct ExitContext<'a> {
    pub position: &'a Position,
    pub partial: &'a PartialSaleRecord,
    pub trend: TrendScore,
    pub regime: RegimeClass,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExitRules {
    pub partial_sell_ratio: f64,
    /// After a partial sell, keep the rest while price stays above target × this.
    pub remaining_hold_criteria: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            partial_sell_ratio: DEFAULT_PARTIAL_SELL_RATIO,
            remaining_hold_criteria: 1.05,
        }
    }
}

impl ExitRules {
    /// Priority-ordered exit rules; the first match wins.
    pub fn evaluate(&self, ctx: &ExitContext<'_>) -> ExitDecision {
        let p = ctx.position;
        let price = p.current_price;
        let profit = p.profit_rate();
        let days = p.days_held(ctx.now);
        let trend = ctx.trend;
        let below_strong = trend < TrendScore::StrongUp;

        // 1. stop-loss
        if p.stop_loss > 0.0 && price <= p.stop_loss {
            if trend == TrendScore::StrongUp && profit > -7.0 {
                return ExitDecision::hold(ExitRule::StopDeferred, "stop deferred (strong uptrend)");
            }
            return ExitDecision::close(
                ExitRule::StopLoss,
                format!("stop-loss hit ({:.0} <= {:.0}, {:+.2}%)", price, p.stop_loss, profit),
            );
        }

        // 2-3. target
        if p.target_price > 0.0 && price >= p.target_price {
            if ctx.partial.is_untouched() {
                return ExitDecision::new(
                    ExitAction::PartialSell {
                        fraction: self.partial_sell_ratio,
                    },
                    ExitRule::TargetPartial,
                    format!(
                        "target reached, partial sell {:.0}% ({:.0} >= {:.0})",
                        self.partial_sell_ratio * 100.0,
                        price,
                        p.target_price
                    ),
                );
            }
            if trend >= TrendScore::StrongUp {
                return ExitDecision::hold(
                    ExitRule::TargetHold,
                    "target reached, holding remainder (strong uptrend)",
                );
            }
            let hold_above = p.target_price * self.remaining_hold_criteria;
            if price > hold_above {
                return ExitDecision::hold(
                    ExitRule::TargetHold,
                    format!("target reached, holding remainder ({:.0} > {:.0})", price, hold_above),
                );
            }
            return ExitDecision::close(
                ExitRule::TargetRemainder,
                format!("target reached, closing remainder ({:+.2}%)", profit),
            );
        }

        // 4. bear leg with gains
        if ctx.regime == RegimeClass::Bear && trend < TrendScore::Neutral && profit > 3.0 {
            return ExitDecision::close(
                ExitRule::BearQuickExit,
                format!("bear market downtrend, locking gains ({:+.2}%)", profit),
            );
        }

        // 5. short horizon
        if p.scenario.investment_horizon == InvestmentHorizon::Short && below_strong {
            if days >= 15 && profit >= 5.0 {
                return ExitDecision::close(
                    ExitRule::ShortHorizonProfit,
                    format!("short horizon: {} days, {:+.2}%", days, profit),
                );
            }
            if days >= 10 && profit <= -3.0 {
                return ExitDecision::close(
                    ExitRule::ShortHorizonLoss,
                    format!("short horizon: {} days, {:+.2}%", days, profit),
                );
            }
        }

        // 6. generic thresholds
        if below_strong {
            if profit >= 10.0 {
                return ExitDecision::close(
                    ExitRule::ProfitThreshold,
                    format!("profit ≥10% ({:+.2}%)", profit),
                );
            }
            if profit <= -5.0 {
                return ExitDecision::close(
                    ExitRule::LossThreshold,
                    format!("loss ≤-5% ({:+.2}%)", profit),
                );
            }
        }

        // 7. long holds
        if trend < TrendScore::WeakUp {
            if days >= 30 && profit < 0.0 {
                return ExitDecision::close(
                    ExitRule::LongHoldLoss,
                    format!("long hold: {} days at a loss ({:+.2}%)", days, profit),
                );
            }
            if days >= 60 && profit >= 3.0 {
                return ExitDecision::close(
                    ExitRule::LongHoldProfit,
                    format!("long hold: {} days, {:+.2}%", days, profit),
                );
            }
            if p.scenario.investment_horizon == InvestmentHorizon::Long && days >= 90 && profit < 0.0
            {
                return ExitDecision::close(
                    ExitRule::LongHorizonLoss,
                    format!("long horizon: {} days at a loss ({:+.2}%)", days, profit),
                );
            }
        }

        ExitDecision::hold(
            ExitRule::Default,
            format!("holding (trend {}, {:+.2}%, {} days)", trend, profit, days),
        )
    }
}
