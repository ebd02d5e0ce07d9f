#![forbid(unsafe_code)]

use crate::PolicyError;
use regex::Regex;

/// One allowed-host glob, compiled to an anchored regex at config time so
/// per-request matching never recompiles.
///
/// `*` matches any run of characters (including dots); every other regex
/// metacharacter in the pattern is escaped. Matching is case-insensitive
/// and ignores a trailing dot on the candidate name.
#[derive(Debug, Clone)]
pub struct HostPattern {
    raw: String,
    regex: Regex,
}

impl HostPattern {
    pub fn compile(pattern: &str) -> Result<Self, PolicyError> {
        let trimmed = pattern.trim().trim_end_matches('.');
        if trimmed.is_empty() {
            return Err(PolicyError::InvalidHostPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern",
            });
        }
        let mut expr = String::with_capacity(trimmed.len() + 8);
        expr.push_str("(?i)^");
        for ch in trimmed.chars() {
            if ch == '*' {
                expr.push_str(".*");
            } else {
                expr.push_str(&regex::escape(&ch.to_string()));
            }
        }
        expr.push('$');
        let regex = Regex::new(&expr).map_err(|_| PolicyError::InvalidHostPattern {
            pattern: pattern.to_string(),
            reason: "pattern does not compile",
        })?;
        Ok(Self {
            raw: trimmed.to_string(),
            regex,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, host: &str) -> bool {
        self.regex.is_match(host.trim_end_matches('.'))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostPatternSet {
    patterns: Vec<HostPattern>,
}

impl HostPatternSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PolicyError> {
        let patterns = patterns
            .iter()
            .map(|p| HostPattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(host))
    }

    /// The hostname check of the admission rule: an empty set passes every
    /// hostname, a non-empty set requires at least one match.
    pub fn allows(&self, host: &str) -> bool {
        self.patterns.is_empty() || self.matches(host)
    }
}
