//! URL pattern matching for `@include`, `@exclude` and `@match` rules.
//!
//! Three dialects compile down to one anchored [`Regex`] each:
//! - globs, where `*` matches anything and every other character is literal
//!   (spaces are dropped, a `.tld` host suffix matches any common TLD)
//! - regex literals written as `/body/` or `/body/i`
//! - match patterns such as `*://*.example.com/*` or `<all_urls>`
//!
//! Compilation is the only place a pattern can fail. Once a [`Pattern`] or
//! [`MatchPattern`] exists, testing a URL against it is infallible.

use std::fmt;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A pattern that could not be compiled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid pattern '{pattern}': {message}")]
pub struct PatternError {
    pub pattern: String,
    pub message: String,
}

impl PatternError {
    fn new(pattern: &str, message: impl Into<String>) -> Self {
        Self {
            pattern: pattern.to_string(),
            message: message.into(),
        }
    }
}

/// Top-level domains substituted for a trailing `.tld` in a glob's host.
const TLDS: &[&str] = &[
    "com", "net", "org", "edu", "gov", "mil", "int", "info", "biz", "name", "io", "co", "me", "tv",
    "us", "ca", "uk", "co.uk", "org.uk", "de", "fr", "nl", "be", "ch", "at", "it", "es", "pt",
    "se", "no", "dk", "fi", "pl", "cz", "ru", "ua", "jp", "co.jp", "cn", "kr", "tw", "hk", "in",
    "au", "com.au", "nz", "br", "com.br", "mx", "ar", "eu",
];

static TLD_ALTERNATION: Lazy<String> = Lazy::new(|| {
    let alternatives: Vec<String> = TLDS.iter().map(|tld| regex::escape(tld)).collect();
    format!(r"\.(?:{})", alternatives.join("|"))
});

/// Translate glob text into regex source (without anchors).
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut buf = [0u8; 4];
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            ' ' => {}
            _ => out.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    out
}

/// Split a glob into `(before, after)` around a `.tld` host suffix, if any.
fn split_tld(glob: &str) -> Option<(&str, &str)> {
    let host_start = glob.find("://").map(|i| i + 3).unwrap_or(0);
    let host_end = glob[host_start..]
        .find('/')
        .map(|i| host_start + i)
        .unwrap_or(glob.len());
    let host = &glob[host_start..host_end];
    if host.len() > 4 && host.ends_with(".tld") {
        let cut = host_end - ".tld".len();
        Some((&glob[..cut], &glob[host_end..]))
    } else {
        None
    }
}

/// Recognise `/body/flags` regex literals.
fn regex_literal(pattern: &str) -> Option<(&str, &str)> {
    let rest = pattern.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let (body, flags) = (&rest[..end], &rest[end + 1..]);
    if body.is_empty() || !flags.chars().all(|f| f == 'i') {
        return None;
    }
    Some((body, flags))
}

/// An `@include`/`@exclude` pattern (glob or regex literal).
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern, rejecting empty or malformed input.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(PatternError::new(pattern, "pattern is empty"));
        }

        let regex = match regex_literal(trimmed) {
            Some((body, flags)) => RegexBuilder::new(body)
                .case_insensitive(flags.contains('i'))
                .build(),
            None => {
                let body = match split_tld(trimmed) {
                    Some((before, after)) => format!(
                        "{}{}{}",
                        glob_to_regex(before),
                        *TLD_ALTERNATION,
                        glob_to_regex(after)
                    ),
                    None => glob_to_regex(trimmed),
                };
                Regex::new(&format!("^{}$", body))
            }
        }
        .map_err(|e| PatternError::new(pattern, e.to_string()))?;

        Ok(Self {
            source: trimmed.to_string(),
            regex,
        })
    }

    /// Whether `url` matches this pattern.
    pub fn test(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for Pattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::compile(&value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.source
    }
}

/// An `@match` pattern: `<all_urls>` or `scheme://host/path`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MatchPattern {
    source: String,
    regex: Regex,
}

impl MatchPattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let trimmed = pattern.trim();
        let body = if trimmed == "<all_urls>" {
            r"(?:https?|ftp|file)://.*".to_string()
        } else {
            let (scheme, rest) = trimmed
                .split_once("://")
                .ok_or_else(|| PatternError::new(pattern, "missing scheme separator"))?;
            let scheme = match scheme {
                "*" => "https?",
                "http" | "https" | "ftp" | "file" => scheme,
                other => {
                    return Err(PatternError::new(
                        pattern,
                        format!("unsupported scheme '{}'", other),
                    ))
                }
            };
            let slash = rest
                .find('/')
                .ok_or_else(|| PatternError::new(pattern, "missing path"))?;
            let (host, path) = rest.split_at(slash);
            let host = if host == "*" {
                "[^/]*".to_string()
            } else if let Some(domain) = host.strip_prefix("*.") {
                if domain.contains('*') {
                    return Err(PatternError::new(pattern, "wildcard inside host"));
                }
                format!(r"(?:[^/]*\.)?{}(?::\d+)?", regex::escape(domain))
            } else if host.contains('*') {
                return Err(PatternError::new(pattern, "wildcard inside host"));
            } else if host.is_empty() && scheme != "file" {
                return Err(PatternError::new(pattern, "missing host"));
            } else {
                format!(r"{}(?::\d+)?", regex::escape(host))
            };
            format!("{}://{}{}", scheme, host, glob_to_regex(path))
        };

        let regex = Regex::new(&format!("^{}$", body))
            .map_err(|e| PatternError::new(pattern, e.to_string()))?;

        Ok(Self {
            source: trimmed.to_string(),
            regex,
        })
    }

    pub fn test(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for MatchPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for MatchPattern {}

impl fmt::Debug for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MatchPattern").field(&self.source).finish()
    }
}

impl TryFrom<String> for MatchPattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::compile(&value)
    }
}

impl From<MatchPattern> for String {
    fn from(pattern: MatchPattern) -> Self {
        pattern.source
    }
}
