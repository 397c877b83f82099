//! Filter chain: exclusion rules on sender address, sender domain and subject.
//!
//! Each configured entry is compiled as a regex anchored at the start of the
//! field. Address and domain rules ignore case, since senders are matched in
//! lowercase. An entry that does not compile is logged and kept as a literal
//! equality rule.

use std::fmt;

use regex::Regex;
use tracing::{debug, error};

use crate::config::FilterConfig;

/// Which message field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Address,
    Domain,
    Subject,
}

impl RuleField {
    fn ignores_case(self) -> bool {
        !matches!(self, Self::Subject)
    }
}

impl fmt::Display for RuleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Address => "address",
            Self::Domain => "domain",
            Self::Subject => "subject",
        })
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Pattern(Regex),
    Literal(String),
}

/// A single exclusion rule.
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// The entry as configured.
    pub source: String,
    /// Which field it applies to.
    pub field: RuleField,
    matcher: Matcher,
}

impl FilterRule {
    pub fn compile(field: RuleField, source: &str) -> Self {
        let pattern = if field.ignores_case() {
            format!("(?i)^(?:{source})")
        } else {
            format!("^(?:{source})")
        };
        let matcher = match Regex::new(&pattern) {
            Ok(regex) => Matcher::Pattern(regex),
            Err(e) => {
                error!(
                    field = %field,
                    rule = source,
                    error = %e,
                    "Invalid exclusion pattern, using literal match"
                );
                Matcher::Literal(source.to_string())
            }
        };
        Self {
            source: source.to_string(),
            field,
            matcher,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self.matcher, Matcher::Pattern(_))
    }

    pub fn matches(&self, value: &str) -> bool {
        match &self.matcher {
            Matcher::Pattern(regex) => regex.is_match(value),
            Matcher::Literal(literal) if self.field.ignores_case() => {
                literal.eq_ignore_ascii_case(value)
            }
            Matcher::Literal(literal) => literal == value,
        }
    }
}

/// Ordered exclusion lists: addresses, then domains, then subjects.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    addresses: Vec<FilterRule>,
    domains: Vec<FilterRule>,
    subjects: Vec<FilterRule>,
}

impl FilterChain {
    pub fn from_config(config: &FilterConfig) -> Self {
        let compile = |field, entries: &[String]| -> Vec<FilterRule> {
            entries
                .iter()
                .filter(|e| !e.is_empty())
                .map(|e| FilterRule::compile(field, e))
                .collect()
        };
        let chain = Self {
            addresses: compile(RuleField::Address, &config.addresses),
            domains: compile(RuleField::Domain, &config.domains),
            subjects: compile(RuleField::Subject, &config.subjects),
        };
        debug!(
            addresses = chain.addresses.len(),
            domains = chain.domains.len(),
            subjects = chain.subjects.len(),
            "Filter chain loaded"
        );
        chain
    }

    /// First rule matching the message, in chain order.
    pub fn first_match(&self, address: &str, domain: &str, subject: &str) -> Option<&FilterRule> {
        self.addresses
            .iter()
            .find(|r| r.matches(address))
            .or_else(|| self.domains.iter().find(|r| r.matches(domain)))
            .or_else(|| self.subjects.iter().find(|r| r.matches(subject)))
    }

    pub fn is_excluded(&self, address: &str, domain: &str, subject: &str) -> bool {
        self.first_match(address, domain, subject).is_some()
    }

    pub fn len(&self) -> usize {
        self.addresses.len() + self.domains.len() + self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Domain part of an address: everything after the first `@`.
pub fn sender_domain(address: &str) -> Option<&str> {
    address.split_once('@').map(|(_, domain)| domain)
}
