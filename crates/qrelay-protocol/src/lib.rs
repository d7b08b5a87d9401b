//! Wire types for the relay: the OpenAI-compatible downstream surface and
//! the workflow-provider upstream surface, plus an incremental SSE parser.
//!
//! This crate is IO-free; it only defines shapes and parsing helpers.

pub mod openai;
pub mod sse;
pub mod workflow;
