//! Outer polling loop with cooperative start/stop control.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::AutoReplyConfig;
use crate::error::PipelineError;
use crate::gateway::{StoreSession, SubmissionSession};
use crate::pipeline::processor::ReplyProcessor;
use crate::pipeline::types::RunSummary;

/// Delay between two messages of one cycle (outbound rate limit).
pub const DEFAULT_MESSAGE_DELAY: Duration = Duration::from_secs(2);

/// Loop timing.
#[derive(Debug, Clone)]
pub struct ReplierSettings {
    /// No cycle starts on or after this date.
    pub expiry_date: NaiveDate,
    /// Sleep between cycles. `None` runs a single pass.
    pub refresh_delay: Option<Duration>,
    pub message_delay: Duration,
}

impl ReplierSettings {
    pub fn from_config(config: &AutoReplyConfig) -> Self {
        Self {
            expiry_date: config.expiry_date,
            refresh_delay: config.refresh_delay,
            message_delay: DEFAULT_MESSAGE_DELAY,
        }
    }

    fn expired(&self, today: NaiveDate) -> bool {
        today >= self.expiry_date
    }
}

struct ControlState {
    active: Mutex<bool>,
    wake: Notify,
}

/// Cloneable handle to request a stop from another task or a signal handler.
#[derive(Clone)]
pub struct ReplierControl {
    state: Arc<ControlState>,
}

impl ReplierControl {
    fn new() -> Self {
        Self {
            state: Arc::new(ControlState {
                active: Mutex::new(false),
                wake: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // The flag is a plain bool; a poisoned guard still holds a valid value.
        self.state
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Request a stop. Takes effect at the next loop boundary.
    /// Returns false when the replier was not running.
    pub fn stop(&self) -> bool {
        let mut active = self.lock();
        if !*active {
            return false;
        }
        *active = false;
        drop(active);
        self.state.wake.notify_waiters();
        info!("Stop requested");
        true
    }

    pub fn is_running(&self) -> bool {
        *self.lock()
    }

    /// Stopped → Running. Returns false when already running.
    fn activate(&self) -> bool {
        let mut active = self.lock();
        if *active {
            return false;
        }
        *active = true;
        true
    }

    fn deactivate(&self) {
        *self.lock() = false;
    }

    /// Sleep for `delay` unless a stop arrives first. Returns true when the
    /// full delay elapsed while still running.
    async fn pause(&self, delay: Duration) -> bool {
        let stopped = self.state.wake.notified();
        if !self.is_running() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.is_running(),
            _ = stopped => false,
        }
    }
}

/// Top-level auto-replier: polls, processes and sleeps until expiry or stop.
pub struct AutoReplier<S, T> {
    processor: tokio::sync::Mutex<ReplyProcessor<S, T>>,
    settings: ReplierSettings,
    control: ReplierControl,
}

impl<S: StoreSession, T: SubmissionSession> AutoReplier<S, T> {
    pub fn new(processor: ReplyProcessor<S, T>, settings: ReplierSettings) -> Self {
        Self {
            processor: tokio::sync::Mutex::new(processor),
            settings,
            control: ReplierControl::new(),
        }
    }

    pub fn control(&self) -> ReplierControl {
        self.control.clone()
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Request a stop; a no-op when already stopped.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Run the loop until expiry, stop, single pass completion or a fatal
    /// error. Calling `start` while running returns immediately.
    ///
    /// Sessions are released on every exit path.
    pub async fn start(&self) -> Result<RunSummary, PipelineError> {
        if !self.control.activate() {
            info!("Auto-replier already running");
            return Ok(RunSummary::default());
        }
        info!(
            expiry = %self.settings.expiry_date,
            refresh_secs = self.settings.refresh_delay.map(|d| d.as_secs()),
            "Auto-replier started"
        );

        let mut processor = self.processor.lock().await;
        let result = self.run(&mut processor).await;
        processor.shutdown().await;
        self.control.deactivate();

        match &result {
            Ok(summary) => info!(
                cycles = summary.cycles,
                replied = summary.replied,
                skipped = summary.skipped,
                "Auto-replier stopped"
            ),
            Err(e) => tracing::error!(error = %e, "Auto-replier aborted"),
        }
        result
    }

    async fn run(&self, processor: &mut ReplyProcessor<S, T>) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();
        let mut logged_in = false;

        loop {
            if !self.control.is_running() {
                break;
            }
            if self.settings.expired(Local::now().date_naive()) {
                info!(expiry = %self.settings.expiry_date, "Expiry date reached");
                break;
            }
            if !logged_in {
                processor.login().await?;
                logged_in = true;
            }

            summary.cycles += 1;
            let ids = processor.search(Utc::now()).await?;
            for (position, id) in ids.into_iter().enumerate() {
                if position > 0 && !self.control.pause(self.settings.message_delay).await {
                    break;
                }
                if !self.control.is_running() {
                    break;
                }
                let disposition = processor.process(id).await?;
                debug!(id = %id, outcome = disposition.label(), "Message processed");
                summary.record(&disposition);
            }

            let Some(delay) = self.settings.refresh_delay else {
                debug!("Single pass complete");
                break;
            };
            debug!(delay_secs = delay.as_secs(), "Waiting for next cycle");
            if !self.control.pause(delay).await {
                break;
            }
        }
        Ok(summary)
    }
}
