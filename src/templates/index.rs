//! Two-level template index: content kind → address bucket → language slot.
//!
//! Built once at startup and queried read-only afterwards. Each slot is
//! first-writer-wins: later templates for an occupied slot are ignored.

use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::debug;

use super::date::{DateFormatTable, format_long_date};
use super::model::{ContentKind, ReplyTemplate};
use crate::config::TemplateConfig;
use crate::error::ConfigError;

/// Placeholder replaced with the long localized expiry date.
pub const DATE_PLACEHOLDER: &str = "${date}";

/// Address bucket or language slot key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Slot {
    Default,
    Named(String),
}

impl Slot {
    fn from_option(value: Option<&str>) -> Self {
        value.map_or(Self::Default, |v| Self::Named(v.to_lowercase()))
    }
}

type Bucket = HashMap<Slot, ReplyTemplate>;

#[derive(Debug, Default)]
struct KindIndex {
    buckets: HashMap<Slot, Bucket>,
}

impl KindIndex {
    /// Insert into an empty slot; returns false when the slot was taken.
    fn insert(&mut self, address: Slot, language: Slot, template: &ReplyTemplate) -> bool {
        let bucket = self.buckets.entry(address).or_default();
        if bucket.contains_key(&language) {
            return false;
        }
        bucket.insert(language, template.clone());
        true
    }

    fn resolve(&self, address: &str, language: &str) -> Option<&ReplyTemplate> {
        let bucket = self
            .buckets
            .get(&Slot::Named(address.to_lowercase()))
            .or_else(|| self.buckets.get(&Slot::Default))?;
        bucket
            .get(&Slot::Named(language.to_lowercase()))
            .or_else(|| bucket.get(&Slot::Default))
    }

    fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }
}

/// Immutable lookup of reply templates.
#[derive(Debug, Default)]
pub struct TemplateIndex {
    html: KindIndex,
    text: KindIndex,
}

impl TemplateIndex {
    /// Build the index from templates in configuration order.
    ///
    /// `${date}` in each body is replaced with `expiry` formatted in the
    /// template's language. An empty body is a configuration error.
    pub fn load(
        templates: &[TemplateConfig],
        dates: &DateFormatTable,
        expiry: NaiveDate,
    ) -> Result<Self, ConfigError> {
        let mut index = Self::default();
        for (position, config) in templates.iter().enumerate() {
            if config.body.trim().is_empty() {
                return Err(ConfigError::EmptyTemplateBody { index: position });
            }
            let template = ReplyTemplate::new(
                config.language.as_deref(),
                config.kind,
                config.email.as_deref(),
                config.body.as_str(),
            );
            let body = if template.body().contains(DATE_PLACEHOLDER) {
                let formatted = format_long_date(dates, template.language(), expiry);
                template.body().replace(DATE_PLACEHOLDER, &formatted)
            } else {
                template.body().to_string()
            };
            index.insert(template.with_body(body));
        }
        debug!(
            html = index.html.len(),
            text = index.text.len(),
            "Template index built"
        );
        Ok(index)
    }

    fn insert(&mut self, template: ReplyTemplate) {
        let kind = match template.kind() {
            ContentKind::Html => &mut self.html,
            ContentKind::Text => &mut self.text,
        };
        let language = if template.has_explicit_language() {
            Slot::Named(template.language().to_string())
        } else {
            Slot::Default
        };
        let address = Slot::from_option(template.email());

        // The default/default slot is filled by the first template without a
        // language binding, whatever its address.
        if !template.has_explicit_language()
            && address != Slot::Default
            && kind.insert(Slot::Default, Slot::Default, &template)
        {
            debug!(%template, "Template added to default slot");
        }

        if kind.insert(address, language, &template) {
            debug!(%template, "Template added");
        } else {
            debug!(%template, "Template slot already taken, ignoring");
        }
    }

    /// Resolve a template for the original recipient and message language.
    ///
    /// Exact address bucket, else the default bucket; within it, exact
    /// language, else the default language slot. `None` means nothing to send.
    pub fn resolve(&self, kind: ContentKind, address: &str, language: &str) -> Option<&ReplyTemplate> {
        match kind {
            ContentKind::Html => self.html.resolve(address, language),
            ContentKind::Text => self.text.resolve(address, language),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.html.len() == 0 && self.text.len() == 0
    }
}
