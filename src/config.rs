//! Configuration types.
//!
//! The configuration file is JSON and mirrors the layout of the legacy XML
//! settings: accounts are declared once and bound to the IMAP and SMTP
//! servers by id, passwords are stored base64-encoded and only decoded at
//! login time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use chrono::NaiveDate;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::templates::ContentKind;

pub const DEFAULT_IMAP_PORT: u16 = 143;
pub const DEFAULT_SMTP_PORT: u16 = 25;
pub const DEFAULT_REFRESH_DELAY_SECS: i64 = 300;
pub const DEFAULT_BLOCK_HOURS: u32 = 12;
pub const DEFAULT_MAILBOX: &str = "INBOX";
pub const LOCK_FILE_NAME: &str = ".autoreplier.lck";

// ── Public configuration ────────────────────────────────────────────

/// User name plus a base64-encoded password.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    encoded_password: SecretString,
}

impl Credentials {
    /// Wrap an already-encoded password.
    pub fn new(user: impl Into<String>, encoded_password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            encoded_password: SecretString::from(encoded_password.into()),
        }
    }

    /// Encode a plain password (used by tests and tooling).
    pub fn from_plain(user: impl Into<String>, password: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(password.as_bytes());
        Self::new(user, encoded)
    }

    /// Decode the password. Called once per login.
    pub fn decode_password(&self) -> Result<SecretString, ConfigError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.encoded_password.expose_secret().trim())
            .map_err(|e| ConfigError::InvalidValue {
                key: format!("password of {}", self.user),
                message: format!("not valid base64: {e}"),
            })?;
        let plain = String::from_utf8(bytes).map_err(|e| ConfigError::InvalidValue {
            key: format!("password of {}", self.user),
            message: format!("not valid UTF-8: {e}"),
        })?;
        Ok(SecretString::from(plain))
    }
}

/// Endpoint and credentials of one mail server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when true, plain TCP otherwise.
    pub use_tls: bool,
    pub credentials: Credentials,
}

/// Message-store (IMAP) settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub server: ServerConfig,
    pub mailbox: String,
}

/// Exclusion lists. Each entry is compiled as a pattern, falling back to a
/// literal when it does not compile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
}

/// One reply template as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    /// Explicit language binding. `None` binds the template to the default slot.
    #[serde(default, rename = "lang")]
    pub language: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: ContentKind,
    /// Owning recipient address. `None` binds the template to the default bucket.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub body: String,
}

/// Fully validated configuration consumed by the core.
#[derive(Debug, Clone)]
pub struct AutoReplyConfig {
    /// Replies stop once this date is reached.
    pub expiry_date: NaiveDate,
    /// Sleep between poll cycles. `None` runs a single pass.
    pub refresh_delay: Option<Duration>,
    /// Cooling-off window during which a sender is not replied to again.
    pub cooling_off: Duration,
    pub imap: ImapConfig,
    pub smtp: ServerConfig,
    pub filters: FilterConfig,
    pub templates: Vec<TemplateConfig>,
    pub database_path: PathBuf,
    pub log_path: PathBuf,
    pub log_level: Option<String>,
    pub lock_path: PathBuf,
}

impl AutoReplyConfig {
    /// Load and validate a configuration file.
    ///
    /// Relative `database_path` / `log.path` values are resolved against the
    /// configuration directory; when absent they default to `<stem>.db` and
    /// `<stem>.log` next to the file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text, path)
    }

    /// Parse configuration text as if it had been read from `path`.
    pub fn from_json(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.validate(path)
    }
}

// ── Raw (on-disk) representation ────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfig {
    date: Option<String>,
    refresh_delay_secs: Option<i64>,
    block_hours: Option<u32>,
    #[serde(default)]
    accounts: Vec<RawAccount>,
    imap: Option<RawServer>,
    smtp: Option<RawServer>,
    #[serde(default)]
    skipped: FilterConfig,
    #[serde(default)]
    templates: Vec<TemplateConfig>,
    database_path: Option<PathBuf>,
    log: Option<RawLog>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    id: String,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    server: Option<String>,
    port: Option<u16>,
    #[serde(default)]
    ssl: bool,
    account_id: Option<String>,
    mailbox: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLog {
    path: Option<PathBuf>,
    level: Option<String>,
}

impl RawConfig {
    fn validate(self, path: &Path) -> Result<AutoReplyConfig, ConfigError> {
        let date = self.date.ok_or_else(|| ConfigError::MissingRequired {
            key: "date".into(),
            hint: "Set the expiry date as YYYY-MM-DD".into(),
        })?;
        let expiry_date =
            NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|e| {
                ConfigError::InvalidValue {
                    key: "date".into(),
                    message: format!("{date}: {e}"),
                }
            })?;

        let refresh_secs = self.refresh_delay_secs.unwrap_or(DEFAULT_REFRESH_DELAY_SECS);
        let refresh_delay = u64::try_from(refresh_secs)
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs);

        let block_hours = self.block_hours.unwrap_or(DEFAULT_BLOCK_HOURS);
        let cooling_off = Duration::from_secs(u64::from(block_hours) * 3600);

        let accounts = index_accounts(self.accounts)?;

        let imap = self.imap.ok_or_else(|| ConfigError::MissingRequired {
            key: "imap".into(),
            hint: "Declare the IMAP server and its account-id".into(),
        })?;
        let mailbox = imap
            .mailbox
            .clone()
            .unwrap_or_else(|| DEFAULT_MAILBOX.to_string());
        let imap_server = build_server("imap", imap, DEFAULT_IMAP_PORT, &accounts)?;

        let smtp = self.smtp.ok_or_else(|| ConfigError::MissingRequired {
            key: "smtp".into(),
            hint: "Declare the SMTP server and its account-id".into(),
        })?;
        let smtp = build_server("smtp", smtp, DEFAULT_SMTP_PORT, &accounts)?;

        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let resolve = |p: PathBuf| if p.is_absolute() { p } else { base_dir.join(p) };

        let database_path = self
            .database_path
            .map(resolve)
            .unwrap_or_else(|| path.with_extension("db"));
        let (log_path, log_level) = match self.log {
            Some(log) => (
                log.path.map(resolve).unwrap_or_else(|| path.with_extension("log")),
                log.level,
            ),
            None => (path.with_extension("log"), None),
        };

        Ok(AutoReplyConfig {
            expiry_date,
            refresh_delay,
            cooling_off,
            imap: ImapConfig {
                server: imap_server,
                mailbox,
            },
            smtp,
            filters: self.skipped,
            templates: self.templates,
            database_path,
            log_path,
            log_level,
            lock_path: base_dir.join(LOCK_FILE_NAME),
        })
    }
}

/// Index accounts by id, rejecting duplicates and undecodable passwords.
fn index_accounts(accounts: Vec<RawAccount>) -> Result<HashMap<String, Credentials>, ConfigError> {
    let mut map = HashMap::with_capacity(accounts.len());
    for account in accounts {
        let credentials = Credentials::new(account.user, account.password);
        credentials.decode_password()?;
        if map.insert(account.id.clone(), credentials).is_some() {
            return Err(ConfigError::AmbiguousAccount {
                role: "accounts".into(),
                reason: format!("account id '{}' is declared more than once", account.id),
            });
        }
    }
    Ok(map)
}

fn build_server(
    role: &str,
    raw: RawServer,
    default_port: u16,
    accounts: &HashMap<String, Credentials>,
) -> Result<ServerConfig, ConfigError> {
    let host = raw
        .server
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingRequired {
            key: format!("{role}.server"),
            hint: "Set the host name or IP address".into(),
        })?;
    let account_id = raw.account_id.ok_or_else(|| ConfigError::MissingRequired {
        key: format!("{role}.account_id"),
        hint: "Bind the server to one of the declared accounts".into(),
    })?;
    let credentials = accounts
        .get(&account_id)
        .cloned()
        .ok_or_else(|| ConfigError::AmbiguousAccount {
            role: role.into(),
            reason: format!("no account with id '{account_id}'"),
        })?;

    Ok(ServerConfig {
        host,
        port: raw.port.unwrap_or(default_port),
        use_tls: raw.ssl,
        credentials,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "date": "2030-01-15",
        "refresh_delay_secs": 120,
        "block_hours": 6,
        "accounts": [
            {"id": "main", "user": "bot@example.com", "password": "c2VjcmV0"}
        ],
        "imap": {"server": "imap.example.com", "port": 993, "ssl": true, "account_id": "main"},
        "smtp": {"server": "smtp.example.com", "account_id": "main"},
        "skipped": {"addresses": ["noreply@.*"], "domains": ["spam.org"]},
        "templates": [
            {"lang": "fr", "type": "HTML", "email": "bot@example.com", "body": "<p>Absent</p>"},
            {"body": "Away until ${date}"}
        ]
    }"#;

    fn parse(text: &str) -> Result<AutoReplyConfig, ConfigError> {
        AutoReplyConfig::from_json(text, Path::new("/etc/autoreply/office.json"))
    }

    #[test]
    fn parses_full_config() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.expiry_date, NaiveDate::from_ymd_opt(2030, 1, 15).unwrap());
        assert_eq!(config.refresh_delay, Some(Duration::from_secs(120)));
        assert_eq!(config.cooling_off, Duration::from_secs(6 * 3600));
        assert_eq!(config.imap.server.port, 993);
        assert!(config.imap.server.use_tls);
        assert_eq!(config.imap.mailbox, "INBOX");
        assert_eq!(config.smtp.port, DEFAULT_SMTP_PORT);
        assert!(!config.smtp.use_tls);
        assert_eq!(config.filters.addresses, vec!["noreply@.*"]);
        assert!(config.filters.subjects.is_empty());
        assert_eq!(config.templates.len(), 2);
        assert_eq!(config.templates[0].kind, ContentKind::Html);
        assert_eq!(config.templates[1].kind, ContentKind::Text);
        assert!(config.templates[1].language.is_none());
    }

    #[test]
    fn derives_paths_from_config_location() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/etc/autoreply/office.db"));
        assert_eq!(config.log_path, PathBuf::from("/etc/autoreply/office.log"));
        assert_eq!(config.lock_path, PathBuf::from("/etc/autoreply/.autoreplier.lck"));
    }

    #[test]
    fn decodes_password_at_use() {
        let config = parse(SAMPLE).unwrap();
        let password = config.imap.server.credentials.decode_password().unwrap();
        assert_eq!(password.expose_secret(), "secret");
    }

    #[test]
    fn non_positive_refresh_means_single_pass() {
        let text = SAMPLE.replace("\"refresh_delay_secs\": 120", "\"refresh_delay_secs\": -1");
        assert!(parse(&text).unwrap().refresh_delay.is_none());
    }

    #[test]
    fn missing_date_is_fatal() {
        let text = SAMPLE.replace("\"date\": \"2030-01-15\",", "");
        assert!(matches!(
            parse(&text),
            Err(ConfigError::MissingRequired { key, .. }) if key == "date"
        ));
    }

    #[test]
    fn missing_smtp_is_fatal() {
        let text = SAMPLE.replace(
            "\"smtp\": {\"server\": \"smtp.example.com\", \"account_id\": \"main\"},",
            "",
        );
        assert!(matches!(
            parse(&text),
            Err(ConfigError::MissingRequired { key, .. }) if key == "smtp"
        ));
    }

    #[test]
    fn unknown_account_is_ambiguous() {
        let text = SAMPLE.replace(
            "\"account_id\": \"main\"}",
            "\"account_id\": \"other\"}",
        );
        assert!(matches!(parse(&text), Err(ConfigError::AmbiguousAccount { .. })));
    }

    #[test]
    fn duplicate_account_is_ambiguous() {
        let text = SAMPLE.replace(
            "{\"id\": \"main\", \"user\": \"bot@example.com\", \"password\": \"c2VjcmV0\"}",
            "{\"id\": \"main\", \"user\": \"a@x.com\", \"password\": \"c2VjcmV0\"},
             {\"id\": \"main\", \"user\": \"b@x.com\", \"password\": \"c2VjcmV0\"}",
        );
        assert!(matches!(parse(&text), Err(ConfigError::AmbiguousAccount { .. })));
    }

    #[test]
    fn undecodable_password_is_rejected() {
        let text = SAMPLE.replace("c2VjcmV0", "not base64 !!");
        assert!(matches!(parse(&text), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(parse("{ not json"), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn credentials_roundtrip_plain_password() {
        let creds = Credentials::from_plain("bot", "hunter2");
        assert_eq!(creds.decode_password().unwrap().expose_secret(), "hunter2");
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replier.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AutoReplyConfig::from_file(&path).unwrap();
        assert_eq!(config.database_path, dir.path().join("replier.db"));
    }
}
