//! Mail session gateway: store (IMAP) and submission (SMTP) sessions behind
//! login-retry and reconnect-on-failure semantics.

pub mod imap;
pub mod smtp;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use tracing::{error, info, warn};

use crate::error::{GatewayError, PipelineError};

pub use imap::ImapStoreSession;
pub use smtp::SmtpSubmissionSession;

/// Custom keyword set on a source message once it has been auto-replied.
pub const AUTOREPLIED_FLAG: &str = "AUTOREPLIED";

/// How far back the poll window reaches.
pub const LOOK_BACK_DAYS: i64 = 1;

// ── Types ───────────────────────────────────────────────────────────

/// Message identifier within the selected mailbox (an IMAP UID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message flag: either a system flag or a custom keyword.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    Keyword(String),
}

impl Flag {
    /// The auto-replied marker keyword.
    pub fn auto_replied() -> Self {
        Self::Keyword(AUTOREPLIED_FLAG.to_string())
    }

    /// Parse a flag as it appears in a FLAGS list.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "\\seen" => Self::Seen,
            "\\answered" => Self::Answered,
            "\\flagged" => Self::Flagged,
            "\\deleted" => Self::Deleted,
            "\\draft" => Self::Draft,
            "\\recent" => Self::Recent,
            _ => Self::Keyword(raw.to_string()),
        }
    }

    /// Protocol representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Seen => "\\Seen",
            Self::Answered => "\\Answered",
            Self::Flagged => "\\Flagged",
            Self::Deleted => "\\Deleted",
            Self::Draft => "\\Draft",
            Self::Recent => "\\Recent",
            Self::Keyword(k) => k,
        }
    }

    /// Keywords compare case-insensitively, like servers do.
    pub fn matches(&self, other: &Flag) -> bool {
        self.as_str().eq_ignore_ascii_case(other.as_str())
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate search predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub since: NaiveDate,
    pub unseen: bool,
    pub unanswered: bool,
    pub without_keyword: Option<String>,
}

impl SearchCriteria {
    /// Recent, unseen, unanswered and not yet auto-replied.
    pub fn poll_window(now: DateTime<Utc>) -> Self {
        Self {
            since: (now - TimeDelta::days(LOOK_BACK_DAYS)).date_naive(),
            unseen: true,
            unanswered: true,
            without_keyword: Some(AUTOREPLIED_FLAG.to_string()),
        }
    }

    /// IMAP SEARCH keys, e.g. `SINCE 15-Oct-2026 UNSEEN UNANSWERED UNKEYWORD AUTOREPLIED`.
    pub fn to_imap(&self) -> String {
        let mut keys = vec![format!("SINCE {}", self.since.format("%d-%b-%Y"))];
        if self.unseen {
            keys.push("UNSEEN".into());
        }
        if self.unanswered {
            keys.push("UNANSWERED".into());
        }
        if let Some(keyword) = &self.without_keyword {
            keys.push(format!("UNKEYWORD {keyword}"));
        }
        keys.join(" ")
    }
}

/// Raw message bytes plus the flags it carried when fetched.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub id: MessageId,
    pub flags: Vec<Flag>,
    pub raw: Vec<u8>,
}

impl FetchedMessage {
    pub fn has_flag(&self, flag: &Flag) -> bool {
        self.flags.iter().any(|f| f.matches(flag))
    }
}

// ── Session traits ──────────────────────────────────────────────────

/// Message-store side: poll, read and flag messages.
#[async_trait]
pub trait StoreSession: Send {
    /// Connect, authenticate and select the mailbox.
    async fn connect(&mut self) -> Result<(), GatewayError>;

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<MessageId>, GatewayError>;

    /// Fetch without implicitly setting `\Seen`.
    async fn fetch(&mut self, id: MessageId) -> Result<FetchedMessage, GatewayError>;

    async fn set_flag(&mut self, id: MessageId, flag: &Flag) -> Result<(), GatewayError>;

    async fn clear_flag(&mut self, id: MessageId, flag: &Flag) -> Result<(), GatewayError>;

    async fn logout(&mut self) -> Result<(), GatewayError>;
}

/// Message-submission side.
#[async_trait]
pub trait SubmissionSession: Send {
    /// Connect and authenticate.
    async fn connect(&mut self) -> Result<(), GatewayError>;

    async fn send(&mut self, from: &str, to: &str, raw: &[u8]) -> Result<(), GatewayError>;

    async fn close(&mut self) -> Result<(), GatewayError>;
}

// ── Retry policy ────────────────────────────────────────────────────

/// Bounds and delays for login retries and per-message operation retries.
///
/// `send_attempts` and `send_cooldown` also bound the store operations of a
/// message (fetch, marking), which reconnect the same way a failed send does.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub login_attempts: u32,
    pub login_delay: Duration,
    pub send_attempts: u32,
    pub send_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            login_attempts: 10,
            login_delay: Duration::from_secs(15),
            send_attempts: 5,
            send_cooldown: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Same bounds, no waiting.
    pub fn immediate() -> Self {
        Self {
            login_delay: Duration::ZERO,
            send_cooldown: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Outcome of [`MailGateway::send_with_retry`].
#[derive(Debug)]
pub enum Delivery {
    Sent { attempts: u32 },
    GaveUp { attempts: u32, last_error: GatewayError },
}

/// Outcome of a retried store operation.
#[derive(Debug)]
pub enum StoreOutcome<T> {
    Done { value: T, attempts: u32 },
    GaveUp { attempts: u32, last_error: GatewayError },
}

// ── Gateway ─────────────────────────────────────────────────────────

/// Owns both sessions and applies the retry policy around them.
pub struct MailGateway<S, T> {
    store: S,
    submission: T,
    policy: RetryPolicy,
}

impl<S: StoreSession, T: SubmissionSession> MailGateway<S, T> {
    pub fn new(store: S, submission: T, policy: RetryPolicy) -> Self {
        Self {
            store,
            submission,
            policy,
        }
    }

    pub fn store(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn submission(&mut self) -> &mut T {
        &mut self.submission
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Log both sessions in, retrying transient failures.
    pub async fn login(&mut self) -> Result<(), PipelineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.connect().await {
                Ok(()) => break,
                Err(e) => self.login_failed("store", attempt, e).await?,
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.submission.connect().await {
                Ok(()) => break,
                Err(e) => self.login_failed("submission", attempt, e).await?,
            }
        }

        info!("Mail sessions logged in");
        Ok(())
    }

    /// Decide whether a failed login attempt is retried. Sleeps before `Ok`.
    async fn login_failed(
        &self,
        role: &'static str,
        attempt: u32,
        err: GatewayError,
    ) -> Result<(), PipelineError> {
        if !err.is_transient() {
            error!(role, error = %err, "Login failed");
            return Err(PipelineError::Login(err));
        }
        if attempt >= self.policy.login_attempts {
            error!(role, attempts = attempt, error = %err, "Login retries exhausted");
            return Err(PipelineError::LoginExhausted {
                attempts: attempt,
                source: err,
            });
        }
        warn!(
            role,
            attempt,
            delay_secs = self.policy.login_delay.as_secs(),
            error = %err,
            "Login failed, retrying"
        );
        tokio::time::sleep(self.policy.login_delay).await;
        Ok(())
    }

    /// Close both sessions. Errors are logged, never returned.
    pub async fn logout(&mut self) {
        if let Err(e) = self.store.logout().await {
            warn!(error = %e, "Store logout failed");
        }
        if let Err(e) = self.submission.close().await {
            warn!(error = %e, "Submission close failed");
        }
    }

    /// Close both sessions, wait the cooldown, log in again.
    pub async fn reconnect(&mut self) -> Result<(), PipelineError> {
        self.logout().await;
        if !self.policy.send_cooldown.is_zero() {
            info!(
                cooldown_secs = self.policy.send_cooldown.as_secs(),
                "Cooling down before reconnect"
            );
            tokio::time::sleep(self.policy.send_cooldown).await;
        }
        self.login().await
    }

    /// Fetch one message, reconnecting between failed attempts.
    pub async fn fetch_with_retry(
        &mut self,
        id: MessageId,
    ) -> Result<StoreOutcome<FetchedMessage>, PipelineError> {
        let max = self.policy.send_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.fetch(id).await {
                Ok(message) => {
                    return Ok(StoreOutcome::Done {
                        value: message,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    if let Some(gave_up) = self.store_failed("fetch", id, attempt, max, e).await? {
                        return Ok(gave_up);
                    }
                }
            }
        }
    }

    /// Set the auto-replied marker and clear `\Seen`, reconnecting between
    /// failed attempts. Both updates are idempotent, so a retry repeats both.
    pub async fn mark_replied(&mut self, id: MessageId) -> Result<StoreOutcome<()>, PipelineError> {
        let max = self.policy.send_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.store.set_flag(id, &Flag::auto_replied()).await {
                Ok(()) => self.store.clear_flag(id, &Flag::Seen).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    return Ok(StoreOutcome::Done {
                        value: (),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    if let Some(gave_up) = self.store_failed("flag", id, attempt, max, e).await? {
                        return Ok(gave_up);
                    }
                }
            }
        }
    }

    /// Reconnect after a failed store operation, or give up once `max`
    /// attempts are spent.
    async fn store_failed<V>(
        &mut self,
        op: &'static str,
        id: MessageId,
        attempt: u32,
        max: u32,
        err: GatewayError,
    ) -> Result<Option<StoreOutcome<V>>, PipelineError> {
        if attempt >= max {
            error!(op, id = %id, attempts = attempt, error = %err, "Store operation retries exhausted");
            return Ok(Some(StoreOutcome::GaveUp {
                attempts: attempt,
                last_error: err,
            }));
        }
        warn!(op, id = %id, attempt, error = %err, "Store operation failed, reconnecting");
        self.reconnect().await?;
        Ok(None)
    }

    /// Send one message, reconnecting between failed attempts.
    ///
    /// Only a failed reconnect is an error; running out of attempts is
    /// reported as [`Delivery::GaveUp`].
    pub async fn send_with_retry(
        &mut self,
        from: &str,
        to: &str,
        raw: &[u8],
    ) -> Result<Delivery, PipelineError> {
        let max = self.policy.send_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.submission.send(from, to, raw).await {
                Ok(()) => return Ok(Delivery::Sent { attempts: attempt }),
                Err(e) if attempt >= max => {
                    error!(to, attempts = attempt, error = %e, "Giving up on message");
                    return Ok(Delivery::GaveUp {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    warn!(to, attempt, error = %e, "Send failed, reconnecting");
                    self.reconnect().await?;
                }
            }
        }
    }
}
