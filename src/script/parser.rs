//! Userscript metadata block parsing.
//!
//! ```text
//! // ==UserScript==
//! // @name        Example
//! // @namespace   https://example.com
//! // @include     http://example.com/*
//! // @run-at      document-start
//! // ==/UserScript==
//! ```

use tracing::debug;

use super::{RunAt, Script, ScriptId};
use crate::error::{KeeperError, KeeperResult};
use crate::hash;
use crate::pattern::{MatchPattern, Pattern};

const BLOCK_START: &str = "==UserScript==";
const BLOCK_END: &str = "==/UserScript==";
const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = -999..=999;

/// Parse a single `// @key value` metadata line.
///
/// Returns `None` for lines that are not metadata entries.
fn parse_metadata_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim().strip_prefix("//")?.trim_start();
    let rest = rest.strip_prefix('@')?;
    match rest.find(char::is_whitespace) {
        Some(split) => Some((&rest[..split], rest[split..].trim())),
        None if !rest.is_empty() => Some((rest, "")),
        None => None,
    }
}

/// Collect the `(key, value)` entries of the metadata block.
fn metadata_entries(source: &str) -> KeeperResult<Vec<(&str, &str)>> {
    let mut lines = source.lines();
    lines
        .by_ref()
        .find(|line| line.trim().strip_prefix("//").map(str::trim) == Some(BLOCK_START))
        .ok_or_else(|| KeeperError::parse("script", "missing ==UserScript== block"))?;

    let mut entries = Vec::new();
    for line in lines {
        if line.trim().strip_prefix("//").map(str::trim) == Some(BLOCK_END) {
            return Ok(entries);
        }
        if let Some(entry) = parse_metadata_line(line) {
            entries.push(entry);
        }
    }

    Err(KeeperError::parse("script", "unterminated ==UserScript== block"))
}

/// Name fallback: the file stem of a `.user.js` download URL.
fn name_from_url(download_url: &str) -> Option<String> {
    let parsed = url::Url::parse(download_url).ok()?;
    let file = parsed.path_segments()?.next_back()?.to_string();
    let stem = file
        .strip_suffix(".user.js")
        .or_else(|| file.strip_suffix(".js"))
        .unwrap_or(&file);
    (!stem.is_empty()).then(|| stem.to_string())
}

impl Script {
    /// Parse userscript source text into a new, enabled record.
    ///
    /// `filename` is left empty; the store assigns one at install time.
    pub fn parse(source: &str, download_url: Option<&str>) -> KeeperResult<Script> {
        let mut name = None;
        let mut explicit_id = None;
        let mut namespace = String::new();
        let mut description = String::new();
        let mut version = None;
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        let mut matches = Vec::new();
        let mut run_at = RunAt::default();
        let mut delay_ms = None;
        let mut priority = 0;
        let mut top_level_only = false;
        let mut meta_download_url = None;
        let mut update_url = None;

        for (key, value) in metadata_entries(source)? {
            match key {
                "name" if !value.is_empty() => name = Some(value.to_string()),
                "id" if !value.is_empty() => explicit_id = Some(value.to_string()),
                "namespace" => namespace = value.to_string(),
                "description" => description = value.to_string(),
                "version" if !value.is_empty() => version = Some(value.to_string()),
                "include" => includes.push(Pattern::compile(value)?),
                "exclude" => excludes.push(Pattern::compile(value)?),
                "match" => matches.push(MatchPattern::compile(value)?),
                "run-at" => match value.parse() {
                    Ok(parsed) => run_at = parsed,
                    Err(e) => debug!("Ignoring @run-at: {}", e),
                },
                "delay" => match value.parse::<u64>() {
                    Ok(ms) => delay_ms = Some(ms),
                    Err(_) => debug!("Ignoring @delay '{}'", value),
                },
                "priority" => match value.parse::<i32>() {
                    Ok(p) => priority = p.clamp(*PRIORITY_RANGE.start(), *PRIORITY_RANGE.end()),
                    Err(_) => debug!("Ignoring @priority '{}'", value),
                },
                "noframes" => top_level_only = true,
                "downloadURL" if !value.is_empty() => meta_download_url = Some(value.to_string()),
                "updateURL" if !value.is_empty() => update_url = Some(value.to_string()),
                _ => {}
            }
        }

        let name = name
            .or_else(|| download_url.and_then(name_from_url))
            .ok_or_else(|| KeeperError::parse("script", "@name is required"))?;

        if includes.is_empty() && matches.is_empty() {
            return Err(KeeperError::parse(
                format!("script '{}'", name),
                "at least one @include or @match is required",
            ));
        }

        let id = explicit_id.unwrap_or_else(|| format!("{}@{}", name, namespace));

        Ok(Script {
            id: ScriptId::new(id),
            name,
            namespace,
            description,
            version,
            filename: String::new(),
            enabled: true,
            priority,
            includes,
            excludes,
            matches,
            run_at,
            delay_ms,
            top_level_only,
            source_digest: hash::digest(source),
            download_url: meta_download_url.or_else(|| download_url.map(str::to_string)),
            update_url,
            blocked: false,
            needs_uninstall: false,
            enabled_before_uninstall: None,
            catalog: None,
        })
    }
}
