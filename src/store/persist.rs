//! On-disk registry formats and the load fallback chain.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fs::FileSystem;
use crate::error::{KeeperError, KeeperResult};
use crate::pattern::Pattern;
use crate::script::{xml, Script};

pub const REGISTRY_FILE: &str = "scriptkeeper-config.json";
pub const REGISTRY_TMP_FILE: &str = "scriptkeeper-config.json.tmp";
pub const XML_REGISTRY_FILE: &str = "scriptkeeper-config.xml";
pub const LEGACY_XML_REGISTRY_FILE: &str = "config.xml";
pub const BLOCKLIST_FILE: &str = "scriptkeeper-blocklist.json";
pub const STORAGE_DIR: &str = "storage";

/// Locations of everything kept in a profile directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePaths {
    pub dir: PathBuf,
    pub registry: PathBuf,
    pub registry_tmp: PathBuf,
    pub xml_registry: PathBuf,
    pub legacy_xml_registry: PathBuf,
    pub blocklist: PathBuf,
    pub storage: PathBuf,
}

impl ProfilePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            registry: dir.join(REGISTRY_FILE),
            registry_tmp: dir.join(REGISTRY_TMP_FILE),
            xml_registry: dir.join(XML_REGISTRY_FILE),
            legacy_xml_registry: dir.join(LEGACY_XML_REGISTRY_FILE),
            blocklist: dir.join(BLOCKLIST_FILE),
            storage: dir.join(STORAGE_DIR),
            dir,
        }
    }

    /// Path of a script body.
    pub fn script(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }
}

/// The primary (JSON) registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedRegistry {
    #[serde(default)]
    pub excludes: Vec<Pattern>,
    #[serde(default)]
    pub scripts: Vec<Script>,
}

/// Where a loaded registry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    /// Left behind by an interrupted save; promoted to the primary slot.
    Interrupted,
    Xml,
    LegacyXml,
    /// Nothing usable on disk.
    Empty,
}

impl LoadSource {
    /// XML is never written, so an XML load must be migrated to JSON.
    pub fn needs_save(self) -> bool {
        matches!(self, LoadSource::Xml | LoadSource::LegacyXml)
    }
}

#[derive(Debug, Clone, Copy)]
enum Format {
    Json,
    Xml,
}

impl Format {
    fn parse(self, text: &str) -> KeeperResult<PersistedRegistry> {
        match self {
            Format::Json => {
                serde_json::from_str(text).map_err(|e| KeeperError::parse("JSON registry", e))
            }
            Format::Xml => xml::parse(text).map(|legacy| PersistedRegistry {
                excludes: legacy.excludes,
                scripts: legacy.scripts,
            }),
        }
    }
}

/// Load the registry, trying each known file in order.
///
/// Absent and unparsable files fall through to the next attempt. When every
/// attempt fails the result is an empty registry.
pub fn load(fs: &dyn FileSystem, paths: &ProfilePaths) -> (PersistedRegistry, LoadSource) {
    let attempts = [
        (&paths.registry, Format::Json, LoadSource::Primary),
        (&paths.registry_tmp, Format::Json, LoadSource::Interrupted),
        (&paths.xml_registry, Format::Xml, LoadSource::Xml),
        (&paths.legacy_xml_registry, Format::Xml, LoadSource::LegacyXml),
    ];

    for (path, format, source) in attempts {
        let text = match fs.read(path) {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(e) => {
                warn!(path = %path.display(), "Failed to read registry: {}", e);
                continue;
            }
        };

        match format.parse(&text) {
            Ok(registry) => {
                if source == LoadSource::Interrupted {
                    promote_interrupted(fs, paths);
                }
                info!(
                    path = %path.display(),
                    scripts = registry.scripts.len(),
                    excludes = registry.excludes.len(),
                    "Loaded registry"
                );
                return (registry, source);
            }
            Err(e) => warn!(path = %path.display(), "Skipping registry: {}", e),
        }
    }

    debug!(dir = %paths.dir.display(), "No registry found, starting empty");
    (PersistedRegistry::default(), LoadSource::Empty)
}

fn promote_interrupted(fs: &dyn FileSystem, paths: &ProfilePaths) {
    if let Err(e) = fs.rename(&paths.registry_tmp, &paths.registry) {
        warn!(path = %paths.registry_tmp.display(), "Failed to promote interrupted save: {}", e);
    }
}

/// Write `contents` to `tmp` and then move it over `target`.
///
/// `target` is only ever replaced by a complete file.
pub fn write_atomic(
    fs: &dyn FileSystem,
    tmp: &Path,
    target: &Path,
    contents: &str,
) -> KeeperResult<()> {
    let persistence = |path: &Path| {
        let path = path.to_path_buf();
        move |source| KeeperError::Persistence { path, source }
    };

    if let Some(parent) = target.parent() {
        fs.create_dir_all(parent).map_err(persistence(parent))?;
    }
    fs.write(tmp, contents).map_err(persistence(tmp))?;
    fs.rename(tmp, target).map_err(persistence(target))
}

/// Serialize and atomically write the registry.
pub fn save(
    fs: &dyn FileSystem,
    paths: &ProfilePaths,
    registry: &PersistedRegistry,
) -> KeeperResult<()> {
    let contents = serde_json::to_string_pretty(registry)?;
    write_atomic(fs, &paths.registry_tmp, &paths.registry, &contents)
}
