//! Reply composition and message language resolution.

use lettre::Message;
use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use uuid::Uuid;

use crate::error::MessageError;
use crate::pipeline::message::IncomingMail;
use crate::templates::{ContentKind, DEFAULT_LANGUAGE, TemplateIndex};

// ── Language detection ──────────────────────────────────────────────

/// Best-effort language detection from the message body.
pub trait LanguageDetector: Send + Sync {
    /// Language code, or `None` when the text is inconclusive.
    fn detect(&self, text: &str) -> Option<String>;
}

/// Detector that never decides; messages without `Content-Language` use
/// the default language.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackDetector;

impl LanguageDetector for FallbackDetector {
    fn detect(&self, _text: &str) -> Option<String> {
        None
    }
}

/// Language of an incoming message.
///
/// An explicit `Content-Language` wins (first tag only, lowercased); then the
/// detector; then [`DEFAULT_LANGUAGE`].
pub fn resolve_language(mail: &IncomingMail, detector: &dyn LanguageDetector) -> String {
    if let Some(header) = &mail.content_language {
        let first = header.split(',').next().unwrap_or_default().trim();
        if !first.is_empty() {
            return first.to_lowercase();
        }
    }
    mail.text
        .as_deref()
        .and_then(|text| detector.detect(text))
        .map(|lang| lang.to_lowercase())
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
}

// ── Composition ─────────────────────────────────────────────────────

/// `Content-Language` header for the outgoing reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContentLanguage(String);

impl Header for ContentLanguage {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Content-Language")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.trim().to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// A composed reply ready for submission.
#[derive(Debug, Clone)]
pub struct OutgoingReply {
    /// Envelope sender: the original recipient.
    pub from: String,
    /// Envelope recipient: the original sender.
    pub to: String,
    pub subject: String,
    /// Language of the template that was used.
    pub language: String,
    pub message_id: String,
    pub raw: Vec<u8>,
}

/// Build the reply to `mail` from the templates resolved for `language`.
///
/// Returns `Ok(None)` when neither a plain-text nor an HTML template
/// resolves for the original recipient.
pub fn compose_reply(
    mail: &IncomingMail,
    templates: &TemplateIndex,
    language: &str,
) -> Result<Option<OutgoingReply>, MessageError> {
    let text = templates.resolve(ContentKind::Text, &mail.recipient, language);
    let html = templates.resolve(ContentKind::Html, &mail.recipient, language);

    let body = match (text, html) {
        (None, None) => return Ok(None),
        (Some(t), None) => MultiPart::alternative().singlepart(SinglePart::plain(t.body().to_string())),
        (None, Some(h)) => MultiPart::alternative().singlepart(SinglePart::html(h.body().to_string())),
        (Some(t), Some(h)) => MultiPart::alternative()
            .singlepart(SinglePart::plain(t.body().to_string()))
            .singlepart(SinglePart::html(h.body().to_string())),
    };
    let used = html.or(text);
    let template_language = used.map_or(DEFAULT_LANGUAGE, |t| t.language()).to_string();
    let explicit_language = used.is_some_and(|t| t.has_explicit_language());

    let from = parse_mailbox("To", &mail.recipient)?;
    let to = parse_mailbox("From", &mail.sender)?;
    let subject = format!("Re: {}", mail.subject);
    let message_id = format!("<{}@{}>", Uuid::new_v4(), from.email.domain());

    let mut builder = Message::builder()
        .message_id(Some(message_id.clone()))
        .from(from)
        .to(to)
        .subject(subject.clone());
    if explicit_language {
        builder = builder.header(ContentLanguage(template_language.clone()));
    }
    if let Some(original) = &mail.message_id {
        builder = builder
            .in_reply_to(format!("<{original}>"))
            .references(format!("<{original}>"));
    }

    let message = builder
        .multipart(body)
        .map_err(|e| MessageError::Compose(e.to_string()))?;

    Ok(Some(OutgoingReply {
        from: mail.recipient.clone(),
        to: mail.sender.clone(),
        subject,
        language: template_language,
        message_id,
        raw: message.formatted(),
    }))
}

fn parse_mailbox(header: &'static str, address: &str) -> Result<Mailbox, MessageError> {
    address
        .parse::<Mailbox>()
        .map_err(|_| MessageError::InvalidAddress {
            header,
            address: address.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateConfig;
    use crate::templates::DateFormatTable;
    use chrono::NaiveDate;
    use mail_parser::MessageParser;

    struct Fixed(&'static str);

    impl LanguageDetector for Fixed {
        fn detect(&self, _text: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn mail() -> IncomingMail {
        IncomingMail {
            sender: "user@example.com".into(),
            recipient: "bot@example.com".into(),
            subject: "Hello".into(),
            message_id: Some("1@x".into()),
            content_language: None,
            text: Some("Hi there".into()),
        }
    }

    fn index(templates: &[(Option<&str>, ContentKind, &str)]) -> TemplateIndex {
        let configs: Vec<TemplateConfig> = templates
            .iter()
            .map(|(lang, kind, body)| TemplateConfig {
                language: lang.map(String::from),
                kind: *kind,
                email: None,
                body: body.to_string(),
            })
            .collect();
        TemplateIndex::load(
            &configs,
            &DateFormatTable::default(),
            NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn reply_headers_link_to_original() {
        let templates = index(&[(None, ContentKind::Text, "I am away.")]);
        let reply = compose_reply(&mail(), &templates, "en").unwrap().unwrap();

        let parsed = MessageParser::default().parse(&reply.raw).unwrap();
        assert_eq!(parsed.subject(), Some("Re: Hello"));
        assert_eq!(parsed.in_reply_to().as_text(), Some("1@x"));
        assert_eq!(
            parsed.from().and_then(|a| a.first()).and_then(|a| a.address()),
            Some("bot@example.com")
        );
        assert_eq!(
            parsed.to().and_then(|a| a.first()).and_then(|a| a.address()),
            Some("user@example.com")
        );
        assert!(parsed.message_id().is_some_and(|id| id.ends_with("@example.com")));
        assert_eq!(reply.from, "bot@example.com");
        assert_eq!(reply.to, "user@example.com");
    }

    #[test]
    fn includes_both_parts_when_resolved() {
        let templates = index(&[
            (None, ContentKind::Text, "plain away"),
            (None, ContentKind::Html, "<p>html away</p>"),
        ]);
        let reply = compose_reply(&mail(), &templates, "en").unwrap().unwrap();
        let parsed = MessageParser::default().parse(&reply.raw).unwrap();
        assert!(parsed.body_text(0).is_some_and(|t| t.contains("plain away")));
        assert!(parsed.body_html(0).is_some_and(|h| h.contains("html away")));
    }

    #[test]
    fn content_language_follows_template() {
        let templates = index(&[(Some("fr"), ContentKind::Text, "Absent")]);
        let reply = compose_reply(&mail(), &templates, "fr").unwrap().unwrap();
        assert_eq!(reply.language, "fr");
        let raw = String::from_utf8_lossy(&reply.raw);
        assert!(raw.contains("Content-Language: fr"));
    }

    #[test]
    fn no_template_is_none() {
        let templates = index(&[(Some("fr"), ContentKind::Text, "Absent")]);
        assert!(compose_reply(&mail(), &templates, "de").unwrap().is_none());
    }

    #[test]
    fn default_template_has_no_content_language() {
        let templates = index(&[(None, ContentKind::Text, "away")]);
        let reply = compose_reply(&mail(), &templates, "en").unwrap().unwrap();
        assert_eq!(reply.language, "en");
        assert!(!String::from_utf8_lossy(&reply.raw).contains("Content-Language"));
    }

    #[test]
    fn missing_message_id_omits_threading_headers() {
        let templates = index(&[(None, ContentKind::Text, "away")]);
        let mut original = mail();
        original.message_id = None;
        let reply = compose_reply(&original, &templates, "en").unwrap().unwrap();
        let raw = String::from_utf8_lossy(&reply.raw);
        assert!(!raw.contains("In-Reply-To"));
    }

    #[test]
    fn content_language_header_wins() {
        let mut m = mail();
        m.content_language = Some("DE-at, en".into());
        assert_eq!(resolve_language(&m, &Fixed("it")), "de-at");
    }

    #[test]
    fn detector_used_without_header() {
        assert_eq!(resolve_language(&mail(), &Fixed("IT")), "it");
        assert_eq!(resolve_language(&mail(), &FallbackDetector), "en");
    }
}
