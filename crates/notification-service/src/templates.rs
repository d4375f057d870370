use crate::PositionEvent;

/// Plain-text rendering of position events. Delivery channels can wrap these
/// in their own markup.
pub struct MessageTemplate;

impl MessageTemplate {
    pub fn title(event: &PositionEvent) -> String {
        match event {
            PositionEvent::Opened { ticker, company_name, .. } => {
                format!("BUY {} ({})", company_name, ticker)
            }
            PositionEvent::Skipped { ticker, company_name, .. } => {
                format!("SKIP {} ({})", company_name, ticker)
            }
            PositionEvent::PartialSell { ticker, company_name, .. } => {
                format!("PARTIAL SELL {} ({})", company_name, ticker)
            }
            PositionEvent::Closed { ticker, company_name, .. } => {
                format!("SELL {} ({})", company_name, ticker)
            }
            PositionEvent::RiskLevelsAdjusted { ticker, .. } => {
                format!("RISK LEVELS ADJUSTED {}", ticker)
            }
            PositionEvent::OrderFailed { ticker, side, .. } => {
                format!("ORDER FAILED {} {}", side.to_uppercase(), ticker)
            }
        }
    }

    pub fn render(event: &PositionEvent) -> String {
        match event {
            PositionEvent::Opened {
                entry_price,
                quantity,
                target_price,
                stop_loss,
                sector,
                ..
            } => format!(
                "Bought {} shares @ {:.0}. Target {:.0} / Stop {:.0}. Sector: {}",
                quantity, entry_price, target_price, stop_loss, sector
            ),
            PositionEvent::Skipped {
                buy_score,
                min_score,
                reason,
                ..
            } => format!(
                "Entry held: {}. Score {:.1} vs required {:.1}",
                reason, buy_score, min_score
            ),
            PositionEvent::PartialSell {
                quantity,
                price,
                profit_rate,
                remaining_ratio,
                reason,
                ..
            } => format!(
                "Sold {} shares @ {:.0} ({:+.2}%). {:.0}% of the position remains. {}",
                quantity,
                price,
                profit_rate,
                remaining_ratio * 100.0,
                reason
            ),
            PositionEvent::Closed {
                exit_price,
                profit_rate,
                holding_days,
                reason,
                ..
            } => format!(
                "Closed @ {:.0}, {:+.2}% after {} days. {}",
                exit_price, profit_rate, holding_days, reason
            ),
            PositionEvent::RiskLevelsAdjusted {
                target_price,
                stop_loss,
                urgency,
                reason,
                ..
            } => format!(
                "Target {:.0} / Stop {:.0} ({} urgency). {}",
                target_price, stop_loss, urgency, reason
            ),
            PositionEvent::OrderFailed { message, .. } => message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_message_carries_reason_and_scores() {
        let event = PositionEvent::Skipped {
            ticker: "000660".to_string(),
            company_name: "SK hynix".to_string(),
            buy_score: 8.0,
            min_score: 9.0,
            reason: "score shortfall (8<9)".to_string(),
        };
        assert_eq!(MessageTemplate::title(&event), "SKIP SK hynix (000660)");
        assert_eq!(
            MessageTemplate::render(&event),
            "Entry held: score shortfall (8<9). Score 8.0 vs required 9.0"
        );
    }

    #[test]
    fn closed_message_is_signed() {
        let event = PositionEvent::Closed {
            ticker: "000660".to_string(),
            company_name: "SK hynix".to_string(),
            exit_price: 95_000.0,
            profit_rate: -5.25,
            holding_days: 4,
            reason: "loss ≤-5%".to_string(),
        };
        assert!(MessageTemplate::render(&event).contains("-5.25%"));
    }
}
