//! Store session over raw IMAP (rustls or plain TCP).
//!
//! The protocol client is blocking and generic over the transport; the
//! async session runs each command on the blocking pool.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use super::{FetchedMessage, Flag, MessageId, SearchCriteria, StoreSession};
use crate::config::ImapConfig;
use crate::error::GatewayError;

const SERVICE: &str = "imap";
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Any byte stream an IMAP client can run over.
pub trait ImapStream: Read + Write + Send {}

impl<T: Read + Write + Send> ImapStream for T {}

// ── Protocol client ─────────────────────────────────────────────────

/// One response line with any `{n}` literals that were embedded in it.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Untagged lines plus the tagged completion.
#[derive(Debug)]
struct Response {
    untagged: Vec<ResponseLine>,
    status: String,
    detail: String,
}

impl Response {
    fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK")
    }
}

/// Minimal blocking IMAP4rev1 client.
pub struct ImapClient<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapClient<S> {
    /// Wrap a connected stream and consume the server greeting.
    pub fn new(stream: S) -> Result<Self, GatewayError> {
        let mut client = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        };
        let greeting = client.read_line()?;
        if !greeting.text.starts_with("* OK") && !greeting.text.starts_with("* PREAUTH") {
            return Err(protocol(format!("unexpected greeting: {}", greeting.text.trim_end())));
        }
        Ok(client)
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), GatewayError> {
        let response = self.command(&format!("LOGIN {} {}", quote(user), quote(password)))?;
        if !response.is_ok() {
            return Err(GatewayError::AuthFailed {
                service: SERVICE,
                user: user.to_string(),
                reason: response.detail,
            });
        }
        Ok(())
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), GatewayError> {
        self.checked(&format!("SELECT {}", quote(mailbox)))?;
        Ok(())
    }

    pub fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<MessageId>, GatewayError> {
        let response = self.checked(&format!("UID SEARCH {}", criteria.to_imap()))?;
        let mut ids = Vec::new();
        for line in &response.untagged {
            if let Some(rest) = strip_prefix_ci(&line.text, "* SEARCH") {
                ids.extend(
                    rest.split_whitespace()
                        .filter_map(|n| n.parse::<u32>().ok())
                        .map(MessageId),
                );
            }
        }
        Ok(ids)
    }

    pub fn uid_fetch(&mut self, id: MessageId) -> Result<FetchedMessage, GatewayError> {
        let response = self.checked(&format!("UID FETCH {id} (FLAGS BODY.PEEK[])"))?;
        let mut flags = Vec::new();
        let mut raw = None;
        for line in response.untagged {
            if !line.text.contains("FETCH") {
                continue;
            }
            // Unsolicited FETCH updates for other messages carry no UID.
            if fetch_uid(&line.text) != Some(id.0) {
                continue;
            }
            if let Some(parsed) = parse_flags(&line.text) {
                flags = parsed;
            }
            if let Some(body) = line.literals.into_iter().next() {
                raw = Some(body);
            }
        }
        let raw = raw.ok_or_else(|| protocol(format!("no body returned for UID {id}")))?;
        Ok(FetchedMessage { id, flags, raw })
    }

    /// `action` is `+FLAGS.SILENT` or `-FLAGS.SILENT`.
    pub fn uid_store(&mut self, id: MessageId, action: &str, flag: &Flag) -> Result<(), GatewayError> {
        self.checked(&format!("UID STORE {id} {action} ({flag})"))?;
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), GatewayError> {
        self.command("LOGOUT")?;
        Ok(())
    }

    /// Run a command and require a tagged OK.
    fn checked(&mut self, cmd: &str) -> Result<Response, GatewayError> {
        let response = self.command(cmd)?;
        if !response.is_ok() {
            let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
            return Err(protocol(format!(
                "{verb} returned {} {}",
                response.status, response.detail
            )));
        }
        Ok(response)
    }

    fn command(&mut self, cmd: &str) -> Result<Response, GatewayError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .map_err(io)?;
        stream.flush().map_err(io)?;

        let mut untagged = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(rest) = line.text.strip_prefix(&tag) {
                let rest = rest.trim();
                let (status, detail) = rest.split_once(' ').unwrap_or((rest, ""));
                return Ok(Response {
                    untagged,
                    status: status.to_string(),
                    detail: detail.to_string(),
                });
            }
            if line.text.starts_with("* BYE") && !cmd.eq_ignore_ascii_case("LOGOUT") {
                return Err(protocol(format!("server closed session: {}", line.text.trim_end())));
            }
            untagged.push(line);
        }
    }

    /// Read one logical response line, pulling in `{n}` literals.
    fn read_line(&mut self) -> Result<ResponseLine, GatewayError> {
        let mut line = ResponseLine::default();
        loop {
            let mut buf = Vec::new();
            let n = self.stream.read_until(b'\n', &mut buf).map_err(io)?;
            if n == 0 {
                return Err(GatewayError::Io {
                    service: SERVICE,
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "IMAP connection closed",
                    ),
                });
            }
            let chunk = String::from_utf8_lossy(&buf);
            let chunk = chunk.trim_end_matches(['\r', '\n']);
            line.text.push_str(chunk);

            match literal_len(chunk) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal).map_err(io)?;
                    line.literals.push(literal);
                }
                None => return Ok(line),
            }
        }
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

fn io(source: std::io::Error) -> GatewayError {
    GatewayError::Io {
        service: SERVICE,
        source,
    }
}

fn protocol(reason: String) -> GatewayError {
    GatewayError::Protocol {
        service: SERVICE,
        reason,
    }
}

/// Quote an IMAP string argument.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

/// Size of a trailing `{n}` literal marker, if any.
fn literal_len(chunk: &str) -> Option<usize> {
    let inner = chunk.strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].trim_end_matches('+').parse().ok()
}

fn fetch_uid(text: &str) -> Option<u32> {
    let upper = text.to_ascii_uppercase();
    let pos = upper.find("UID ")?;
    text[pos + 4..]
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

fn parse_flags(text: &str) -> Option<Vec<Flag>> {
    let upper = text.to_ascii_uppercase();
    let start = upper.find("FLAGS (")? + "FLAGS (".len();
    let end = text[start..].find(')')? + start;
    Some(text[start..end].split_whitespace().map(Flag::parse).collect())
}

// ── Transport ───────────────────────────────────────────────────────

fn open_stream(host: &str, port: u16, use_tls: bool) -> Result<Box<dyn ImapStream>, GatewayError> {
    let connect_err = |reason: String| GatewayError::Connect {
        service: SERVICE,
        host: format!("{host}:{port}"),
        reason,
    };

    let tcp = TcpStream::connect((host, port)).map_err(|e| connect_err(e.to_string()))?;
    tcp.set_read_timeout(Some(READ_TIMEOUT)).map_err(io)?;

    if !use_tls {
        return Ok(Box::new(tcp));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| connect_err(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| connect_err(format!("TLS setup failed: {e}")))?;
    Ok(Box::new(rustls::StreamOwned::new(conn, tcp)))
}

// ── Async session ───────────────────────────────────────────────────

type Client = ImapClient<Box<dyn ImapStream>>;

/// [`StoreSession`] over a live IMAP connection.
pub struct ImapStoreSession {
    config: ImapConfig,
    client: Option<Client>,
}

impl ImapStoreSession {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    /// Run a blocking client operation off the async runtime.
    async fn with_client<R, F>(&mut self, op: F) -> Result<R, GatewayError>
    where
        F: FnOnce(&mut Client) -> Result<R, GatewayError> + Send + 'static,
        R: Send + 'static,
    {
        let mut client = self
            .client
            .take()
            .ok_or(GatewayError::NotConnected { service: SERVICE })?;
        let (client, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut client);
            (client, result)
        })
        .await
        .map_err(|e| protocol(format!("IMAP task failed: {e}")))?;
        self.client = Some(client);
        result
    }
}

#[async_trait]
impl StoreSession for ImapStoreSession {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let server = self.config.server.clone();
        let mailbox = self.config.mailbox.clone();
        let password = server.credentials.decode_password()?;

        info!(
            host = %server.host,
            port = server.port,
            tls = server.use_tls,
            user = %server.credentials.user,
            password = %"*".repeat(password.expose_secret().chars().count()),
            "Logging in to message store"
        );

        let client = tokio::task::spawn_blocking(move || -> Result<Client, GatewayError> {
            let stream = open_stream(&server.host, server.port, server.use_tls)?;
            let mut client = ImapClient::new(stream)?;
            client.login(&server.credentials.user, password.expose_secret())?;
            client.select(&mailbox)?;
            Ok(client)
        })
        .await
        .map_err(|e| protocol(format!("IMAP task failed: {e}")))??;

        self.client = Some(client);
        debug!(mailbox = %self.config.mailbox, "Mailbox selected");
        Ok(())
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<MessageId>, GatewayError> {
        let criteria = criteria.clone();
        self.with_client(move |c| c.uid_search(&criteria)).await
    }

    async fn fetch(&mut self, id: MessageId) -> Result<FetchedMessage, GatewayError> {
        self.with_client(move |c| c.uid_fetch(id)).await
    }

    async fn set_flag(&mut self, id: MessageId, flag: &Flag) -> Result<(), GatewayError> {
        let flag = flag.clone();
        self.with_client(move |c| c.uid_store(id, "+FLAGS.SILENT", &flag))
            .await
    }

    async fn clear_flag(&mut self, id: MessageId, flag: &Flag) -> Result<(), GatewayError> {
        let flag = flag.clone();
        self.with_client(move |c| c.uid_store(id, "-FLAGS.SILENT", &flag))
            .await
    }

    async fn logout(&mut self) -> Result<(), GatewayError> {
        if self.client.is_none() {
            return Ok(());
        }
        let result = self.with_client(|c| c.logout()).await;
        self.client = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Replays canned server output and records what the client wrote.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Scripted {
        fn new(server: &str) -> Self {
            Self {
                input: Cursor::new(server.as_bytes().to_vec()),
                written: Vec::new(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client(server: &str) -> ImapClient<Scripted> {
        ImapClient::new(Scripted::new(server)).unwrap()
    }

    fn written(client: &ImapClient<Scripted>) -> String {
        String::from_utf8_lossy(&client.stream.get_ref().written).to_string()
    }

    #[test]
    fn login_quotes_credentials() {
        let mut c = client("* OK ready\r\nA0001 OK LOGIN completed\r\n");
        c.login("bot@example.com", "p\"w\\d").unwrap();
        assert_eq!(
            written(&c),
            "A0001 LOGIN \"bot@example.com\" \"p\\\"w\\\\d\"\r\n"
        );
    }

    #[test]
    fn rejected_login_is_auth_failure() {
        let mut c = client("* OK ready\r\nA0001 NO [AUTHENTICATIONFAILED] bad\r\n");
        let err = c.login("bot", "x").unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailed { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn bad_greeting_is_rejected() {
        assert!(ImapClient::new(Scripted::new("* BYE go away\r\n")).is_err());
    }

    #[test]
    fn search_parses_uids() {
        let mut c = client("* OK ready\r\n* SEARCH 3 7 12\r\nA0001 OK SEARCH done\r\n");
        let criteria = SearchCriteria {
            since: chrono::NaiveDate::from_ymd_opt(2026, 10, 15).unwrap(),
            unseen: true,
            unanswered: true,
            without_keyword: Some("AUTOREPLIED".into()),
        };
        let ids = c.uid_search(&criteria).unwrap();
        assert_eq!(ids, vec![MessageId(3), MessageId(7), MessageId(12)]);
        assert_eq!(
            written(&c),
            "A0001 UID SEARCH SINCE 15-Oct-2026 UNSEEN UNANSWERED UNKEYWORD AUTOREPLIED\r\n"
        );
    }

    #[test]
    fn empty_search_result() {
        let mut c = client("* OK ready\r\n* SEARCH\r\nA0001 OK done\r\n");
        let criteria = SearchCriteria::poll_window(chrono::Utc::now());
        assert!(c.uid_search(&criteria).unwrap().is_empty());
    }

    #[test]
    fn fetch_reads_literal_and_flags() {
        let body = "Subject: Hi\r\n\r\nHello\r\n";
        let server = format!(
            "* OK ready\r\n* 2 FETCH (UID 7 FLAGS (\\Seen AUTOREPLIED) BODY[] {{{}}}\r\n{body})\r\nA0001 OK FETCH done\r\n",
            body.len()
        );
        let mut c = client(&server);
        let msg = c.uid_fetch(MessageId(7)).unwrap();
        assert_eq!(msg.raw, body.as_bytes());
        assert!(msg.has_flag(&Flag::Seen));
        assert!(msg.has_flag(&Flag::auto_replied()));
        assert_eq!(written(&c), "A0001 UID FETCH 7 (FLAGS BODY.PEEK[])\r\n");
    }

    #[test]
    fn fetch_ignores_unsolicited_flag_updates() {
        let body = "Subject: Hi\r\n\r\nHello\r\n";
        let server = format!(
            "* OK ready\r\n* 2 FETCH (UID 7 FLAGS () BODY[] {{{}}}\r\n{body})\r\n* 5 FETCH (FLAGS (\\Seen AUTOREPLIED))\r\n* 6 FETCH (UID 9 FLAGS (\\Answered))\r\nA0001 OK FETCH done\r\n",
            body.len()
        );
        let mut c = client(&server);
        let msg = c.uid_fetch(MessageId(7)).unwrap();
        assert_eq!(msg.raw, body.as_bytes());
        assert!(msg.flags.is_empty());
    }

    #[test]
    fn fetch_without_body_is_protocol_error() {
        let mut c = client("* OK ready\r\nA0001 OK FETCH done\r\n");
        assert!(matches!(
            c.uid_fetch(MessageId(9)),
            Err(GatewayError::Protocol { .. })
        ));
    }

    #[test]
    fn store_uses_silent_flag_update() {
        let mut c = client("* OK ready\r\nA0001 OK STORE done\r\nA0002 OK STORE done\r\n");
        c.uid_store(MessageId(4), "+FLAGS.SILENT", &Flag::auto_replied())
            .unwrap();
        c.uid_store(MessageId(4), "-FLAGS.SILENT", &Flag::Seen).unwrap();
        assert_eq!(
            written(&c),
            "A0001 UID STORE 4 +FLAGS.SILENT (AUTOREPLIED)\r\nA0002 UID STORE 4 -FLAGS.SILENT (\\Seen)\r\n"
        );
    }

    #[test]
    fn tagged_no_is_protocol_error() {
        let mut c = client("* OK ready\r\nA0001 NO mailbox does not exist\r\n");
        let err = c.select("Missing").unwrap_err();
        assert!(matches!(err, GatewayError::Protocol { .. }));
    }

    #[test]
    fn closed_connection_is_transient() {
        let mut c = client("* OK ready\r\n");
        let err = c.select("INBOX").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn literal_marker_detection() {
        assert_eq!(literal_len("* 1 FETCH (BODY[] {42}"), Some(42));
        assert_eq!(literal_len("* 1 FETCH (FLAGS ())"), None);
    }

    #[tokio::test]
    async fn session_requires_connect() {
        let config = ImapConfig {
            server: crate::config::ServerConfig {
                host: "localhost".into(),
                port: 143,
                use_tls: false,
                credentials: crate::config::Credentials::from_plain("bot", "pw"),
            },
            mailbox: "INBOX".into(),
        };
        let mut session = ImapStoreSession::new(config);
        assert!(matches!(
            session.fetch(MessageId(1)).await,
            Err(GatewayError::NotConnected { .. })
        ));
        session.logout().await.unwrap();
    }
}
