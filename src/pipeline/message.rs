//! Inbound message parsing: the headers the reply pipeline needs.

use mail_parser::MessageParser;

use crate::error::MessageError;
use crate::pipeline::rules::sender_domain;
use crate::store::normalize_sender;

/// The parts of an incoming message used to decide and compose a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMail {
    /// Reply target: `Reply-To` when present, else `From`. Lowercased.
    pub sender: String,
    /// First `To` address: the mailbox that received the message.
    pub recipient: String,
    pub subject: String,
    /// `Message-ID` without angle brackets.
    pub message_id: Option<String>,
    /// Raw `Content-Language` header value.
    pub content_language: Option<String>,
    /// Plain-text body, used for language detection.
    pub text: Option<String>,
}

impl IncomingMail {
    /// Parse raw RFC 5322 bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or(MessageError::Unparseable)?;

        let sender = first_address(parsed.reply_to())
            .or_else(|| first_address(parsed.from()))
            .ok_or(MessageError::MissingAddress { header: "From" })?;
        if !sender.contains('@') {
            return Err(MessageError::InvalidAddress {
                header: "From",
                address: sender,
            });
        }

        let recipient =
            first_address(parsed.to()).ok_or(MessageError::MissingAddress { header: "To" })?;
        if !recipient.contains('@') {
            return Err(MessageError::InvalidAddress {
                header: "To",
                address: recipient,
            });
        }

        let content_language = parsed
            .header_raw("Content-Language")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(Self {
            sender,
            recipient,
            subject: parsed.subject().unwrap_or_default().to_string(),
            message_id: parsed.message_id().map(str::to_string),
            content_language,
            text: parsed.body_text(0).map(|t| t.into_owned()),
        })
    }

    /// Domain part of the sender address.
    pub fn sender_domain(&self) -> &str {
        sender_domain(&self.sender).unwrap_or_default()
    }
}

/// First address in a header, normalized.
///
/// Handles plain lists and RFC 5322 groups.
fn first_address(addr: Option<&mail_parser::Address>) -> Option<String> {
    let addr = addr?;
    let raw = match addr {
        mail_parser::Address::List(addrs) => addrs.iter().find_map(|a| a.address.as_deref()),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .find_map(|a| a.address.as_deref()),
    }?;
    let normalized = normalize_sender(raw);
    (!normalized.is_empty()).then_some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = "From: User <User@Example.com>\r\n\
        To: Bot <bot@example.com>\r\n\
        Subject: Hello\r\n\
        Message-ID: <1@x>\r\n\
        Content-Language: fr-FR, en\r\n\
        \r\n\
        Bonjour\r\n";

    #[test]
    fn parses_reply_headers() {
        let mail = IncomingMail::parse(BASIC.as_bytes()).unwrap();
        assert_eq!(mail.sender, "user@example.com");
        assert_eq!(mail.recipient, "bot@example.com");
        assert_eq!(mail.subject, "Hello");
        assert_eq!(mail.message_id.as_deref(), Some("1@x"));
        assert_eq!(mail.content_language.as_deref(), Some("fr-FR, en"));
        assert_eq!(mail.text.as_deref().map(str::trim), Some("Bonjour"));
        assert_eq!(mail.sender_domain(), "example.com");
    }

    #[test]
    fn reply_to_wins_over_from() {
        let raw = "From: a@one.com\r\nReply-To: b@two.com\r\nTo: bot@example.com\r\nSubject: x\r\n\r\nbody\r\n";
        let mail = IncomingMail::parse(raw.as_bytes()).unwrap();
        assert_eq!(mail.sender, "b@two.com");
    }

    #[test]
    fn group_recipient_is_resolved() {
        let raw = "From: a@one.com\r\nTo: Team: bot@example.com, other@example.com;\r\nSubject: x\r\n\r\nbody\r\n";
        let mail = IncomingMail::parse(raw.as_bytes()).unwrap();
        assert_eq!(mail.recipient, "bot@example.com");
    }

    #[test]
    fn missing_subject_is_empty() {
        let raw = "From: a@one.com\r\nTo: bot@example.com\r\n\r\nbody\r\n";
        let mail = IncomingMail::parse(raw.as_bytes()).unwrap();
        assert_eq!(mail.subject, "");
        assert!(mail.message_id.is_none());
        assert!(mail.content_language.is_none());
    }

    #[test]
    fn missing_recipient_is_rejected() {
        let raw = "From: a@one.com\r\nSubject: x\r\n\r\nbody\r\n";
        assert!(matches!(
            IncomingMail::parse(raw.as_bytes()),
            Err(MessageError::MissingAddress { header: "To" })
        ));
    }

    #[test]
    fn sender_without_domain_is_rejected() {
        let raw = "From: localuser\r\nTo: bot@example.com\r\nSubject: x\r\n\r\nbody\r\n";
        assert!(IncomingMail::parse(raw.as_bytes()).is_err());
    }
}
