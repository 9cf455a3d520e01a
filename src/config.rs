use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::error::KeeperResult;

pub const DEFAULT_BLOCKLIST_URL: &str = "https://scriptkeeper.github.io/blocklist.json";

/// Minimum time between blocklist or catalog fetches, in seconds.
const MIN_FETCH_INTERVAL: u64 = 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub general: GeneralConfig,
    pub injection: InjectionConfig,
    pub blocklist: BlocklistConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Global injection toggle.
    pub enabled: bool,
    /// Directory holding the registry, script bodies and script storage.
    pub profile_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Re-read modified script files on every navigation.
    pub enable_script_refreshing: bool,
    pub allow_file_urls: bool,
    /// Mirror `GM_log` output to the host console.
    pub log_to_console: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    pub enabled: bool,
    pub url: String,
    /// Seconds between remote fetches.
    pub interval: u64,
    /// Unix time of the last fetch attempt.
    pub last_fetch: i64,
}

/// Refresh of userscripts.org metadata for catalog-tracked scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub enabled: bool,
    /// Seconds between refreshes.
    pub interval: u64,
    /// Unix time of the last refresh attempt.
    pub last_fetch: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            profile_dir: dirs::data_dir()
                .map(|d| d.join("scriptkeeper").to_string_lossy().into_owned())
                .unwrap_or_else(|| "~/.scriptkeeper".to_string()),
        }
    }
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            enable_script_refreshing: true,
            allow_file_urls: false,
            log_to_console: true,
        }
    }
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_BLOCKLIST_URL.to_string(),
            interval: 24 * 60 * 60,
            last_fetch: 0,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 7 * 24 * 60 * 60,
            last_fetch: 0,
        }
    }
}

impl Preferences {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
            })
            .join("scriptkeeper")
            .join("config.toml")
    }

    /// Load preferences from `path`, or return defaults if not found
    pub fn load_from(path: &PathBuf) -> Self {
        let mut prefs = if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(prefs) => prefs,
                    Err(e) => {
                        warn!(path = %path.display(), "Failed to parse config: {}", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), "Failed to read config: {}", e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        prefs.validate();
        prefs
    }

    /// Clamp values to acceptable ranges
    fn validate(&mut self) {
        self.blocklist.interval = self.blocklist.interval.max(MIN_FETCH_INTERVAL);
        self.blocklist.last_fetch = self.blocklist.last_fetch.max(0);
        self.catalog.interval = self.catalog.interval.max(MIN_FETCH_INTERVAL);
        self.catalog.last_fetch = self.catalog.last_fetch.max(0);
    }

    /// Save preferences to `path`
    pub fn save_to(&self, path: &PathBuf) -> KeeperResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// Profile directory with `~` and environment variables expanded.
    pub fn profile_dir(&self) -> PathBuf {
        let expanded = shellexpand::full(&self.general.profile_dir)
            .map(|expanded| expanded.into_owned())
            .unwrap_or_else(|_| self.general.profile_dir.clone());
        PathBuf::from(expanded)
    }
}

/// Live preferences shared by the store, blocklist and scheduler.
#[derive(Debug)]
pub struct Settings {
    path: Option<PathBuf>,
    current: RwLock<Preferences>,
}

impl Settings {
    /// Settings backed by a TOML file; updates are written back to it.
    pub fn load(path: PathBuf) -> Self {
        let current = Preferences::load_from(&path);
        Self {
            path: Some(path),
            current: RwLock::new(current),
        }
    }

    /// Settings that live only in memory.
    pub fn in_memory(prefs: Preferences) -> Self {
        Self {
            path: None,
            current: RwLock::new(prefs),
        }
    }

    /// Snapshot of the current preferences.
    pub fn get(&self) -> Preferences {
        self.current.read().clone()
    }

    pub fn injection_enabled(&self) -> bool {
        self.current.read().general.enabled
    }

    /// Apply `change` and persist the result.
    ///
    /// The in-memory value is updated even when writing the file fails.
    pub fn update(&self, change: impl FnOnce(&mut Preferences)) -> KeeperResult<()> {
        let snapshot = {
            let mut current = self.current.write();
            change(&mut current);
            current.validate();
            current.clone()
        };

        match &self.path {
            Some(path) => snapshot.save_to(path),
            None => Ok(()),
        }
    }
}
