pub mod calculator;
pub mod models;
#[cfg(test)]
mod tests;

pub use calculator::RiskParameterCalculator;
pub use models::*;
