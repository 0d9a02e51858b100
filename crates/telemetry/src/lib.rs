//! Token usage accounting and cost estimation for Kestrel sessions.
//!
//! The loop records provider-reported usage after every model call and tool
//! execution; at the end of a turn it asks the [`UsageTracker`] for the
//! status line shown to the operator.

pub mod pricing;
pub mod usage;

pub use pricing::{ModelPricing, PricingTable};
pub use usage::{UsageSnapshot, UsageTracker};
