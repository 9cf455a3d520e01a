//! Userscript records.
//!
//! A [`Script`] is created by parsing source text (see [`parser`]) or by
//! loading a persisted registry (JSON, or the legacy XML in [`xml`]). Its `id`
//! never changes after install; everything else can be replaced by an edit, an
//! update, or a refresh from disk.

pub mod parser;
pub mod xml;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pattern::{MatchPattern, Pattern};

/// Stable identifier of an installed script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptId(String);

impl ScriptId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScriptId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Document lifecycle milestone at which a script is injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunAt {
    /// Before the page's own scripts run.
    DocumentStart,
    /// When the DOM content has loaded.
    #[default]
    DocumentEnd,
    /// One scheduling tick after the DOM content has loaded.
    DocumentIdle,
    /// When the window (subresources included) has loaded.
    WindowLoad,
}

impl RunAt {
    pub const ALL: [RunAt; 4] = [
        RunAt::DocumentStart,
        RunAt::DocumentEnd,
        RunAt::DocumentIdle,
        RunAt::WindowLoad,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunAt::DocumentStart => "document-start",
            RunAt::DocumentEnd => "document-end",
            RunAt::DocumentIdle => "document-idle",
            RunAt::WindowLoad => "window-load",
        }
    }
}

impl fmt::Display for RunAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunAt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunAt::ALL
            .into_iter()
            .find(|run_at| run_at.as_str() == s)
            .ok_or_else(|| format!("unknown run-at '{}'", s))
    }
}

/// What the userscripts.org catalog last reported for a script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogInfo {
    /// Version of the copy the catalog currently serves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Descriptor of one installed userscript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: ScriptId,

    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub version: Option<String>,

    /// Body file name inside the profile directory.
    pub filename: String,

    pub enabled: bool,

    /// Higher values inject (and list) first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub includes: Vec<Pattern>,

    #[serde(default)]
    pub excludes: Vec<Pattern>,

    #[serde(default)]
    pub matches: Vec<MatchPattern>,

    #[serde(default)]
    pub run_at: RunAt,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Declared `@noframes`: never injected into subframes.
    #[serde(default)]
    pub top_level_only: bool,

    /// Digest of the body as last loaded.
    #[serde(default)]
    pub source_digest: String,

    #[serde(default, rename = "downloadURL")]
    pub download_url: Option<String>,

    #[serde(default, rename = "updateURL")]
    pub update_url: Option<String>,

    /// Set by the blocklist; blocked scripts never inject.
    #[serde(default)]
    pub blocked: bool,

    /// Queued for removal, still undoable.
    #[serde(default)]
    pub needs_uninstall: bool,

    /// `enabled` as it was before the uninstall was queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) enabled_before_uninstall: Option<bool>,

    /// Catalog metadata, for scripts tracked by userscripts.org.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogInfo>,
}

impl Script {
    /// Whether the script is allowed to inject at all, ignoring URLs.
    ///
    /// A queued uninstall counts as disabled.
    pub fn is_runnable(&self) -> bool {
        self.enabled && !self.blocked && !self.needs_uninstall
    }

    /// Whether `url` passes this script's own include/match/exclude rules.
    pub fn matches_url(&self, url: &str) -> bool {
        let included = self.includes.iter().any(|p| p.test(url))
            || self.matches.iter().any(|p| p.test(url));
        included && !self.excludes.iter().any(|p| p.test(url))
    }

    /// Whether this script is tracked by the userscripts.org catalog.
    pub fn is_uso_script(&self) -> bool {
        self.download_url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .is_some_and(|u| u.host_str() == Some("userscripts.org"))
    }

    /// Where the catalog publishes this script's metadata block.
    ///
    /// An `updateURL` pointing at a `.meta.js` wins; otherwise the download
    /// URL's `.user.js` suffix is swapped for `.meta.js`.
    pub fn catalog_meta_url(&self) -> Option<String> {
        if !self.is_uso_script() {
            return None;
        }
        if let Some(update) = self.update_url.as_deref().filter(|u| u.ends_with(".meta.js")) {
            return Some(update.to_string());
        }
        self.download_url
            .as_deref()
            .and_then(|u| u.strip_suffix(".user.js"))
            .map(|stem| format!("{}.meta.js", stem))
    }

    /// Whether the catalog serves a different version than the installed one.
    pub fn update_available(&self) -> bool {
        self.catalog
            .as_ref()
            .and_then(|c| c.version.as_ref())
            .is_some_and(|remote| self.version.as_ref() != Some(remote))
    }

    /// Take metadata from a freshly parsed copy of this script.
    ///
    /// Identity and user state (id, file, enabled, priority, block and
    /// uninstall flags) are kept.
    pub(crate) fn merge_metadata(&mut self, newer: Script) {
        self.name = newer.name;
        self.namespace = newer.namespace;
        self.description = newer.description;
        self.version = newer.version;
        self.includes = newer.includes;
        self.excludes = newer.excludes;
        self.matches = newer.matches;
        self.run_at = newer.run_at;
        self.delay_ms = newer.delay_ms;
        self.top_level_only = newer.top_level_only;
        self.source_digest = newer.source_digest;
        if newer.download_url.is_some() {
            self.download_url = newer.download_url;
        }
        if newer.update_url.is_some() {
            self.update_url = newer.update_url;
        }
    }
}
