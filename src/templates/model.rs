//! Reply template model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Language used when neither the template nor the message names one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Body format of a template; each kind is indexed separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    #[serde(rename = "HTML", alias = "html")]
    Html,
    #[default]
    #[serde(rename = "TEXT", alias = "text")]
    Text,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Html => f.write_str("HTML"),
            Self::Text => f.write_str("TEXT"),
        }
    }
}

/// A loaded reply template. Immutable once built by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTemplate {
    language: String,
    explicit_language: bool,
    kind: ContentKind,
    email: Option<String>,
    body: String,
}

impl ReplyTemplate {
    /// Build a template. Language and address are normalized to lowercase.
    pub fn new(
        language: Option<&str>,
        kind: ContentKind,
        email: Option<&str>,
        body: impl Into<String>,
    ) -> Self {
        let language = language.map(str::trim).filter(|l| !l.is_empty());
        Self {
            language: language.unwrap_or(DEFAULT_LANGUAGE).to_lowercase(),
            explicit_language: language.is_some(),
            kind,
            email: email
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_lowercase),
            body: body.into(),
        }
    }

    /// Language code, `en` when none was configured.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Whether the template was bound to a language explicitly.
    pub fn has_explicit_language(&self) -> bool {
        self.explicit_language
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Owning recipient address, if bound to one.
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub(crate) fn with_body(mut self, body: String) -> Self {
        self.body = body;
        self
    }
}

impl fmt::Display for ReplyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Template, language: {}, type: {}", self.language, self.kind)?;
        if let Some(email) = &self.email {
            write!(f, ", email: {email}")?;
        }
        Ok(())
    }
}
