//! Shared types for the reply pipeline.

use std::fmt;

use crate::error::PipelineError;
use crate::pipeline::rules::RuleField;

// ── Stage result ────────────────────────────────────────────────────

/// Outcome of one pipeline stage.
#[derive(Debug)]
pub enum Stage<T> {
    /// Continue with the stage output.
    Proceed(T),
    /// Stop processing this message; the loop continues.
    Skip(SkipReason),
    /// Abort the polling loop.
    Fatal(PipelineError),
}

// ── Skip reasons ────────────────────────────────────────────────────

/// Why a message was not (or not fully) answered.
///
/// Except for `AlreadyReplied`, skipped messages stay unmarked and are seen
/// again on the next poll while they remain inside the look-back window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The auto-replied marker is already set.
    AlreadyReplied,
    /// An exclusion rule matched.
    Filtered { field: RuleField, rule: String },
    /// Sender was answered within the cooling-off window.
    Throttled,
    /// The throttle store could not be consulted.
    ThrottleUnavailable,
    /// Sender, recipient or headers are unusable.
    Malformed(String),
    /// No template resolved for the recipient and language.
    NoTemplate { recipient: String, language: String },
    /// The message could not be read from the store.
    FetchFailed(String),
    /// Every send attempt failed.
    SendFailed { attempts: u32, error: String },
}

impl SkipReason {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyReplied => "already_replied",
            Self::Filtered { .. } => "filtered",
            Self::Throttled => "throttled",
            Self::ThrottleUnavailable => "throttle_unavailable",
            Self::Malformed(_) => "malformed",
            Self::NoTemplate { .. } => "no_template",
            Self::FetchFailed(_) => "fetch_failed",
            Self::SendFailed { .. } => "send_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyReplied => f.write_str("auto-replied marker already set"),
            Self::Filtered { field, rule } => write!(f, "{field} excluded by rule '{rule}'"),
            Self::Throttled => f.write_str("rebound protection"),
            Self::ThrottleUnavailable => f.write_str("throttle store unavailable"),
            Self::Malformed(reason) => write!(f, "malformed message: {reason}"),
            Self::NoTemplate {
                recipient,
                language,
            } => write!(f, "no template for {recipient} ({language})"),
            Self::FetchFailed(reason) => write!(f, "fetch failed: {reason}"),
            Self::SendFailed { attempts, error } => {
                write!(f, "send failed after {attempts} attempts: {error}")
            }
        }
    }
}

// ── Disposition ─────────────────────────────────────────────────────

/// Final result of processing one candidate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Reply sent. `flagged` is false when the marker could not be stored.
    Replied {
        sender: String,
        attempts: u32,
        flagged: bool,
    },
    /// Reply composed but not sent (dry run).
    Composed { sender: String },
    Skipped(SkipReason),
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied { .. } => "replied",
            Self::Composed { .. } => "composed",
            Self::Skipped(reason) => reason.label(),
        }
    }
}

/// Counters for one `AutoReplier::start` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u32,
    pub replied: u32,
    pub composed: u32,
    pub skipped: u32,
}

impl RunSummary {
    pub fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Replied { .. } => self.replied += 1,
            Disposition::Composed { .. } => self.composed += 1,
            Disposition::Skipped(_) => self.skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_dispositions() {
        let mut summary = RunSummary::default();
        summary.record(&Disposition::Replied {
            sender: "a@b.c".into(),
            attempts: 1,
            flagged: true,
        });
        summary.record(&Disposition::Skipped(SkipReason::Throttled));
        summary.record(&Disposition::Skipped(SkipReason::AlreadyReplied));
        assert_eq!(summary.replied, 1);
        assert_eq!(summary.skipped, 2);
    }

    #[test]
    fn skip_reason_display() {
        let reason = SkipReason::Filtered {
            field: RuleField::Domain,
            rule: "spam.org".into(),
        };
        assert_eq!(reason.to_string(), "domain excluded by rule 'spam.org'");
        assert_eq!(reason.label(), "filtered");
    }
}
