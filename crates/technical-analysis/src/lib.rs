pub mod trend;
pub mod volatility;


pub use trend::*;
pub use volatility::*;
