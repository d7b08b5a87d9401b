//! Concrete provider adapters.
//!
//! Currently one adapter is built in: the workflow-style provider, which is
//! not OpenAI-wire-compatible and therefore exercises the full translation
//! contract (request folding, file upload side-channel, cross-event stream
//! translation, synthetic usage).

pub mod client;
pub mod providers;
pub mod registry;

pub use providers::workflow::WorkflowAdapter;
pub use registry::register_builtin_adapters;
