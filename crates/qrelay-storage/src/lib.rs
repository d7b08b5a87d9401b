//! Ledger and consumption-log seams.
//!
//! The persistent user/token/channel store is an external collaborator; the
//! relay only needs the narrow operations defined here. `MemoryLedger` backs
//! the binary's standalone mode and the test suite.

pub mod ledger;
pub mod log;

pub use ledger::{LedgerError, LedgerResult, MemoryLedger, QuotaLedger};
pub use log::{ConsumeLogEntry, ConsumeLogSink, MemoryLogSink, TracingLogSink};
