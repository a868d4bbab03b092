pub mod aggregate;
pub mod pricing;
pub mod reader;
pub mod types;

pub use pricing::{CostSummary, ModelPricing, PricingTable};
pub use reader::StatsReader;
pub use types::*;
