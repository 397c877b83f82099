//! Submission session over SMTP via lettre.

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use super::SubmissionSession;
use crate::config::ServerConfig;
use crate::error::GatewayError;

const SERVICE: &str = "smtp";

/// [`SubmissionSession`] backed by a blocking lettre transport.
pub struct SmtpSubmissionSession {
    config: ServerConfig,
    transport: Option<SmtpTransport>,
}

impl SmtpSubmissionSession {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    fn build_transport(&self) -> Result<SmtpTransport, GatewayError> {
        let password = self.config.credentials.decode_password()?;
        let creds = Credentials::new(
            self.config.credentials.user.clone(),
            password.expose_secret().to_string(),
        );

        info!(
            host = %self.config.host,
            port = self.config.port,
            tls = self.config.use_tls,
            user = %self.config.credentials.user,
            password = %"*".repeat(password.expose_secret().chars().count()),
            "Logging in to submission server"
        );

        let builder = if self.config.use_tls {
            SmtpTransport::relay(&self.config.host).map_err(|e| GatewayError::Connect {
                service: SERVICE,
                host: self.config.host.clone(),
                reason: format!("SMTP relay error: {e}"),
            })?
        } else {
            SmtpTransport::builder_dangerous(&self.config.host)
        };

        Ok(builder
            .port(self.config.port)
            .credentials(creds)
            .build())
    }
}

fn parse_address(address: &str) -> Result<Address, GatewayError> {
    address
        .parse::<Address>()
        .map_err(|e| GatewayError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl SubmissionSession for SmtpSubmissionSession {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let transport = self.build_transport()?;
        let host = format!("{}:{}", self.config.host, self.config.port);

        let probe = transport.clone();
        let ok = tokio::task::spawn_blocking(move || probe.test_connection())
            .await
            .map_err(|e| GatewayError::Protocol {
                service: SERVICE,
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| GatewayError::Connect {
                service: SERVICE,
                host: host.clone(),
                reason: e.to_string(),
            })?;

        if !ok {
            return Err(GatewayError::Connect {
                service: SERVICE,
                host,
                reason: "server did not accept the connection".into(),
            });
        }

        self.transport = Some(transport);
        debug!("Submission session ready");
        Ok(())
    }

    async fn send(&mut self, from: &str, to: &str, raw: &[u8]) -> Result<(), GatewayError> {
        let transport = self
            .transport
            .clone()
            .ok_or(GatewayError::NotConnected { service: SERVICE })?;
        let envelope = Envelope::new(Some(parse_address(from)?), vec![parse_address(to)?])
            .map_err(|e| GatewayError::InvalidAddress {
                address: to.to_string(),
                reason: e.to_string(),
            })?;
        let raw = raw.to_vec();

        tokio::task::spawn_blocking(move || transport.send_raw(&envelope, &raw))
            .await
            .map_err(|e| GatewayError::Protocol {
                service: SERVICE,
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| GatewayError::SendFailed(format!("SMTP send failed: {e}")))?;

        info!(to, "Reply sent");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        if self.transport.take().is_some() {
            debug!("Submission session closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials as AccountCredentials;

    fn session() -> SmtpSubmissionSession {
        SmtpSubmissionSession::new(ServerConfig {
            host: "smtp.example.com".into(),
            port: 25,
            use_tls: false,
            credentials: AccountCredentials::from_plain("bot@example.com", "secret"),
        })
    }

    #[tokio::test]
    async fn send_requires_connect() {
        let mut s = session();
        let err = s
            .send("bot@example.com", "user@example.com", b"raw")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected { service: "smtp" }));
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(matches!(
            parse_address("not an address"),
            Err(GatewayError::InvalidAddress { .. })
        ));
        assert!(parse_address("user@example.com").is_ok());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut s = session();
        s.close().await.unwrap();
        s.close().await.unwrap();
    }
}
