//! Reply orchestration.
//!
//! Each candidate message flows through:
//! 1. `ReplyProcessor::process()`: fetch, marker check, filters, throttle,
//!    compose, send, flag
//! 2. `AutoReplier::start()`: the polling loop around it (search, process
//!    each candidate, sleep, repeat until expiry or stop)
//!
//! Skipped messages are never marked, so they stay candidates until they
//! leave the look-back window.

pub mod compose;
pub mod message;
pub mod poller;
pub mod processor;
pub mod rules;
pub mod types;

pub use compose::{FallbackDetector, LanguageDetector, OutgoingReply, compose_reply};
pub use message::IncomingMail;
pub use poller::{AutoReplier, ReplierControl, ReplierSettings};
pub use processor::{PipelineContext, ProcessorSettings, ReplyProcessor};
pub use rules::{FilterChain, FilterRule, RuleField};
pub use types::{Disposition, RunSummary, SkipReason, Stage};
