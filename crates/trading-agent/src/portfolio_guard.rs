use portfolio_manager::Position;

use crate::types::UNKNOWN_SECTOR;

/// Slot and sector limits on the set of open positions.
#[derive(Debug, Clone)]
pub struct SlotCapacityManager {
    capacity: usize,
    max_same_sector: usize,
    sector_concentration_ratio: f64,
}

impl SlotCapacityManager {
    pub fn new(capacity: usize, max_same_sector: usize, sector_concentration_ratio: f64) -> Self {
        Self {
            capacity,
            max_same_sector,
            sector_concentration_ratio,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A per-scenario limit can only tighten the configured capacity.
    pub fn effective_capacity(&self, max_portfolio_size: Option<usize>) -> usize {
        match max_portfolio_size {
            Some(limit) => limit.min(self.capacity),
            None => self.capacity,
        }
    }

    pub fn has_free_slot(open: usize, capacity: usize) -> bool {
        open < capacity
    }

    /// Fraction of slots in use; a zero capacity counts as full.
    pub fn occupancy(open: usize, capacity: usize) -> f64 {
        if capacity == 0 {
            return 1.0;
        }
        open as f64 / capacity as f64
    }

    /// False when `sector` is already over-represented among active positions:
    /// it holds `max_same_sector` of them, or its share reaches the
    /// concentration ratio. Unknown sectors are never capped.
    pub fn sector_diversity(&self, sector: &str, positions: &[Position]) -> bool {
        if is_unknown_sector(sector) {
            return true;
        }

        let active: Vec<&Position> = positions.iter().filter(|p| p.is_active()).collect();
        if active.is_empty() {
            return true;
        }

        let same_sector = active
            .iter()
            .filter(|p| p.scenario.sector.eq_ignore_ascii_case(sector))
            .count();
        let share = same_sector as f64 / active.len() as f64;

        if same_sector >= self.max_same_sector || share >= self.sector_concentration_ratio {
            tracing::info!(
                "Sector '{}' over-represented: {} of {} positions ({:.0}%)",
                sector,
                same_sector,
                active.len(),
                share * 100.0
            );
            return false;
        }
        true
    }
}

impl Default for SlotCapacityManager {
    fn default() -> Self {
        Self::new(10, 3, 0.3)
    }
}

fn is_unknown_sector(sector: &str) -> bool {
    let s = sector.trim();
    s.is_empty() || s.eq_ignore_ascii_case(UNKNOWN_SECTOR) || s == "알 수 없음"
}
