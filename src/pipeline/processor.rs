//! Per-message reply pipeline.
//!
//! Flow for one candidate:
//! 1. Fetch raw bytes and flags (without marking the message seen)
//! 2. Skip if the auto-replied marker is already present
//! 3. Filter chain on sender, domain and subject
//! 4. Throttle check (records the sender when accepted)
//! 5. Resolve language and templates, compose the reply
//! 6. Send with retry
//! 7. Set the marker and clear `\Seen` on the original

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::gateway::{
    Delivery, FetchedMessage, Flag, MailGateway, MessageId, SearchCriteria, StoreOutcome,
    StoreSession, SubmissionSession,
};
use crate::pipeline::compose::{LanguageDetector, OutgoingReply, compose_reply, resolve_language};
use crate::pipeline::message::IncomingMail;
use crate::pipeline::rules::FilterChain;
use crate::pipeline::types::{Disposition, SkipReason, Stage};
use crate::store::ThrottleStore;
use crate::templates::TemplateIndex;

/// Unwrap a `Stage`, returning early on skip or fatal.
macro_rules! proceed {
    ($stage:expr) => {
        match $stage {
            Stage::Proceed(value) => value,
            Stage::Skip(reason) => return Ok(Disposition::Skipped(reason)),
            Stage::Fatal(err) => return Err(err),
        }
    };
}

/// Processor tuning.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Cooling-off window for rebound protection.
    pub cooling_off: Duration,
    /// Compose and record, but never send or change flags.
    pub dry_run: bool,
}

/// Shared, read-only collaborators of the pipeline.
#[derive(Clone)]
pub struct PipelineContext {
    pub templates: Arc<TemplateIndex>,
    pub filters: Arc<FilterChain>,
    pub throttle: Arc<dyn ThrottleStore>,
    pub detector: Arc<dyn LanguageDetector>,
}

/// Runs the reply pipeline for one message at a time.
pub struct ReplyProcessor<S, T> {
    gateway: MailGateway<S, T>,
    context: PipelineContext,
    settings: ProcessorSettings,
}

impl<S: StoreSession, T: SubmissionSession> ReplyProcessor<S, T> {
    pub fn new(
        gateway: MailGateway<S, T>,
        context: PipelineContext,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            gateway,
            context,
            settings,
        }
    }

    pub fn gateway(&mut self) -> &mut MailGateway<S, T> {
        &mut self.gateway
    }

    pub async fn login(&mut self) -> Result<(), PipelineError> {
        self.gateway.login().await
    }

    /// Release both sessions.
    pub async fn shutdown(&mut self) {
        self.gateway.logout().await;
    }

    /// Candidate messages for this poll cycle.
    ///
    /// A failed search reconnects and yields no candidates; only a failed
    /// reconnect is fatal.
    pub async fn search(&mut self, now: DateTime<Utc>) -> Result<Vec<MessageId>, PipelineError> {
        let criteria = SearchCriteria::poll_window(now);
        debug!(criteria = %criteria.to_imap(), "Searching messages");
        match self.gateway.store().search(&criteria).await {
            Ok(ids) => {
                info!(count = ids.len(), "Search done");
                Ok(ids)
            }
            Err(e) => {
                warn!(error = %e, "Search failed, reconnecting");
                self.gateway.reconnect().await?;
                Ok(Vec::new())
            }
        }
    }

    /// Run the pipeline for one candidate.
    pub async fn process(&mut self, id: MessageId) -> Result<Disposition, PipelineError> {
        let fetched = proceed!(self.fetch(id).await);
        proceed!(check_marker(&fetched));

        let mail = proceed!(parse(&fetched));
        info!(
            id = %id,
            sender = %mail.sender,
            subject = %mail.subject,
            "Processing message"
        );

        proceed!(self.filter(&mail));
        proceed!(self.throttle(&mail).await);
        let reply = proceed!(self.compose(&mail));

        if self.settings.dry_run {
            info!(
                id = %id,
                to = %reply.to,
                language = %reply.language,
                "Dry run, reply not sent"
            );
            return Ok(Disposition::Composed { sender: mail.sender });
        }

        let attempts = proceed!(self.send(&reply).await);
        let flagged = self.mark_replied(id).await?;

        Ok(Disposition::Replied {
            sender: mail.sender,
            attempts,
            flagged,
        })
    }

    // ── Stages ──────────────────────────────────────────────────────

    async fn fetch(&mut self, id: MessageId) -> Stage<FetchedMessage> {
        match self.gateway.fetch_with_retry(id).await {
            Ok(StoreOutcome::Done { value, .. }) => Stage::Proceed(value),
            Ok(StoreOutcome::GaveUp { last_error, .. }) => {
                warn!(id = %id, stage = "fetch", error = %last_error, "Skipping unreadable message");
                Stage::Skip(SkipReason::FetchFailed(last_error.to_string()))
            }
            Err(fatal) => Stage::Fatal(fatal),
        }
    }

    fn filter(&self, mail: &IncomingMail) -> Stage<()> {
        match self
            .context
            .filters
            .first_match(&mail.sender, mail.sender_domain(), &mail.subject)
        {
            Some(rule) => {
                info!(
                    sender = %mail.sender,
                    subject = %mail.subject,
                    field = %rule.field,
                    rule = %rule.source,
                    "Message excluded"
                );
                Stage::Skip(SkipReason::Filtered {
                    field: rule.field,
                    rule: rule.source.clone(),
                })
            }
            None => Stage::Proceed(()),
        }
    }

    async fn throttle(&self, mail: &IncomingMail) -> Stage<()> {
        match self
            .context
            .throttle
            .should_suppress(&mail.sender, Utc::now(), self.settings.cooling_off)
            .await
        {
            Ok(false) => Stage::Proceed(()),
            Ok(true) => {
                info!(
                    sender = %mail.sender,
                    subject = %mail.subject,
                    "Rebound protection, not replying"
                );
                Stage::Skip(SkipReason::Throttled)
            }
            Err(e) => {
                error!(sender = %mail.sender, stage = "throttle", error = %e, "Throttle check failed");
                Stage::Skip(SkipReason::ThrottleUnavailable)
            }
        }
    }

    fn compose(&self, mail: &IncomingMail) -> Stage<OutgoingReply> {
        let language = resolve_language(mail, self.context.detector.as_ref());
        debug!(sender = %mail.sender, language = %language, "Original language");

        match compose_reply(mail, &self.context.templates, &language) {
            Ok(Some(reply)) => Stage::Proceed(reply),
            Ok(None) => {
                warn!(
                    sender = %mail.sender,
                    recipient = %mail.recipient,
                    language = %language,
                    "No template found, message left unmarked"
                );
                Stage::Skip(SkipReason::NoTemplate {
                    recipient: mail.recipient.clone(),
                    language,
                })
            }
            Err(e) => {
                warn!(sender = %mail.sender, stage = "compose", error = %e, "Cannot compose reply");
                Stage::Skip(SkipReason::Malformed(e.to_string()))
            }
        }
    }

    async fn send(&mut self, reply: &OutgoingReply) -> Stage<u32> {
        match self
            .gateway
            .send_with_retry(&reply.from, &reply.to, &reply.raw)
            .await
        {
            Ok(Delivery::Sent { attempts }) => Stage::Proceed(attempts),
            Ok(Delivery::GaveUp {
                attempts,
                last_error,
            }) => Stage::Skip(SkipReason::SendFailed {
                attempts,
                error: last_error.to_string(),
            }),
            Err(fatal) => Stage::Fatal(fatal),
        }
    }

    /// Set the marker and clear `\Seen`. Returns whether both succeeded.
    async fn mark_replied(&mut self, id: MessageId) -> Result<bool, PipelineError> {
        match self.gateway.mark_replied(id).await? {
            StoreOutcome::Done { .. } => {
                info!(id = %id, "Marker flag added to the message");
                Ok(true)
            }
            StoreOutcome::GaveUp { last_error, .. } => {
                error!(
                    id = %id,
                    stage = "flag",
                    error = %last_error,
                    "Reply sent but message not marked"
                );
                Ok(false)
            }
        }
    }
}

// ── Pure stages ─────────────────────────────────────────────────────

fn check_marker(message: &FetchedMessage) -> Stage<()> {
    if message.has_flag(&Flag::auto_replied()) {
        warn!(id = %message.id, "Message already has the marker flag");
        return Stage::Skip(SkipReason::AlreadyReplied);
    }
    Stage::Proceed(())
}

fn parse(message: &FetchedMessage) -> Stage<IncomingMail> {
    match IncomingMail::parse(&message.raw) {
        Ok(mail) => Stage::Proceed(mail),
        Err(e) => {
            warn!(id = %message.id, stage = "parse", error = %e, "Skipping unusable message");
            Stage::Skip(SkipReason::Malformed(e.to_string()))
        }
    }
}
