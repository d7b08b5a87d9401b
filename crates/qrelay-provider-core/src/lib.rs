//! Adapter abstractions for the relay.
//!
//! An adapter owns the full provider conversation: request translation,
//! transport, and response normalization back to the OpenAI wire shape.
//! This crate defines the trait and the per-request context it operates on;
//! concrete providers live in qrelay-provider-impl.

pub mod adapter;
pub mod error;
pub mod info;
pub mod sink;
pub mod tokens;

pub use adapter::{Adapter, AdapterRegistry};
pub use error::{RelayError, RelayResult};
pub use info::{
    ApiType, BuiltInTool, BuiltInToolCallInfo, RelayContext, RelayInfo, RelayMode,
    ResponsesUsageInfo,
};
pub use sink::ClientSink;
pub use tokens::{
    FALLBACK_COUNT_MODEL, TiktokenCounter, TokenCounter, TokenError, count_chat_tokens,
    count_value_tokens,
};
