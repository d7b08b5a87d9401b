//! The text relay pipeline: validation, token accounting, quota settlement,
//! adapter dispatch, and the axum surface that exposes the OpenAI-compatible
//! endpoints.

pub mod core;
pub mod handler;
pub mod orchestrator;
pub mod pricing;
pub mod sensitive;
pub mod settlement;
pub mod validate;

pub use core::{Core, CoreState, RelayOptions};
pub use orchestrator::{RelayResponse, relay_text};
pub use pricing::{ModelPrice, PriceData, PriceError, PricingResolver, StaticPricing};
pub use sensitive::{NoopScanner, SensitiveScanner, WordListScanner};
pub use settlement::{PreConsumed, SettlementConfig, post_consume_quota, pre_consume_quota};
pub use validate::validate_text_request;
