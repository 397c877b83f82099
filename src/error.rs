//! Error types for the auto-replier.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Account binding for {role} is ambiguous: {reason}")]
    AmbiguousAccount { role: String, reason: String },

    #[error("Template #{index} has no body")]
    EmptyTemplateBody { index: usize },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mail session errors, for both the store (IMAP) and submission (SMTP) side.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{service} connection to {host} failed: {reason}")]
    Connect {
        service: &'static str,
        host: String,
        reason: String,
    },

    #[error("{service} authentication failed for {user}: {reason}")]
    AuthFailed {
        service: &'static str,
        user: String,
        reason: String,
    },

    #[error("{service} protocol error: {reason}")]
    Protocol {
        service: &'static str,
        reason: String,
    },

    #[error("{service} session is not connected")]
    NotConnected { service: &'static str },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Credentials error: {0}")]
    Credentials(#[from] ConfigError),

    #[error("{service} IO error: {source}")]
    Io {
        service: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    /// Whether the failure is a connectivity problem worth retrying during login.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Io { .. })
    }
}

/// Per-message data errors. The message is skipped and left unmarked.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Message could not be parsed")]
    Unparseable,

    #[error("Message has no {header} address")]
    MissingAddress { header: &'static str },

    #[error("Invalid {header} address: {address}")]
    InvalidAddress {
        header: &'static str,
        address: String,
    },

    #[error("Failed to build reply: {0}")]
    Compose(String),
}

/// Errors that abort the polling loop.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Login failed after {attempts} attempts: {source}")]
    LoginExhausted {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error("Login failed: {0}")]
    Login(GatewayError),

    #[error("Store session failed: {0}")]
    Store(GatewayError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
