//! 成本治理：价格表、token 估算、按日重置的成本账本

pub mod clock;
pub mod ledger;
pub mod pricing;
pub mod tokens;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::{CostLedger, CostStatistics, TimeWindow, UsageInput, UsageRecord};
pub use pricing::{PriceTable, DEFAULT_PRICING};
pub use tokens::TokenEstimator;
