use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{TimeDelta, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autoreply::config::AutoReplyConfig;
use autoreply::gateway::{ImapStoreSession, MailGateway, RetryPolicy, SmtpSubmissionSession};
use autoreply::pipeline::{
    AutoReplier, FallbackDetector, FilterChain, PipelineContext, ProcessorSettings,
    ReplierSettings, ReplyProcessor,
};
use autoreply::store::{LibSqlBackend, ThrottleStore};
use autoreply::templates::{DateFormatTable, TemplateIndex};

/// Mailbox auto-replier.
#[derive(Parser)]
#[command(name = "autoreply", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short = 'f', long = "config")]
    config: PathBuf,

    /// Log level filter (overrides RUST_LOG and the configured level).
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<String>,

    /// Compose replies and record senders, but never send or flag.
    #[arg(long)]
    dry_run: bool,

    /// Delete throttle records older than the cooling-off window and exit.
    #[arg(long)]
    prune_history: bool,
}

/// Advisory lock on the lock file, held for as long as the handle lives.
///
/// The OS drops the lock when the process exits, however it exits, so a
/// file left behind by a killed instance does not block the next start.
struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Cannot open lock file {}", path.display()))?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => anyhow::bail!(
                "Another instance is running (lock file {})",
                path.display()
            ),
            Err(TryLockError::Error(e)) => {
                return Err(e).with_context(|| format!("Cannot lock {}", path.display()));
            }
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AutoReplyConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let _log_guard = init_logging(&cli, &config)?;

    let _lock = InstanceLock::acquire(&config.lock_path)?;

    let store: Arc<dyn ThrottleStore> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_path.display()))?,
    );

    if cli.prune_history {
        let cooling_off = TimeDelta::from_std(config.cooling_off).context("Invalid cooling-off window")?;
        let deleted = store.prune(Utc::now() - cooling_off).await?;
        tracing::info!(deleted, "Throttle history pruned");
        return Ok(());
    }

    let templates = TemplateIndex::load(&config.templates, &DateFormatTable::default(), config.expiry_date)?;
    if templates.is_empty() {
        tracing::warn!("No reply templates configured, nothing will be sent");
    }

    let context = PipelineContext {
        templates: Arc::new(templates),
        filters: Arc::new(FilterChain::from_config(&config.filters)),
        throttle: store,
        detector: Arc::new(FallbackDetector),
    };
    let gateway = MailGateway::new(
        ImapStoreSession::new(config.imap.clone()),
        SmtpSubmissionSession::new(config.smtp.clone()),
        RetryPolicy::default(),
    );
    let processor = ReplyProcessor::new(
        gateway,
        context,
        ProcessorSettings {
            cooling_off: config.cooling_off,
            dry_run: cli.dry_run,
        },
    );
    let replier = AutoReplier::new(processor, ReplierSettings::from_config(&config));

    let control = replier.control();
    tokio::spawn(async move {
        shutdown_signal().await;
        control.stop();
    });

    if cli.dry_run {
        tracing::info!("Dry run: replies are composed but not sent");
    }
    let summary = replier.start().await?;
    tracing::info!(
        replied = summary.replied,
        composed = summary.composed,
        skipped = summary.skipped,
        "Done"
    );
    Ok(())
}

/// stderr plus a daily-rolling file next to the configuration.
fn init_logging(
    cli: &Cli,
    config: &AutoReplyConfig,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = match cli.log_level.as_deref().or(config.log_level.as_deref()) {
        Some(level) => EnvFilter::try_new(level).context("Invalid log level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let directory = config
        .log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = config
        .log_path
        .file_name()
        .context("Log path has no file name")?;
    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
