//! Remote blocklist.
//!
//! The list is fetched from the configured URL at most once per interval and
//! cached in the profile directory. A fetched list whose digest equals the
//! cached one is ignored. Otherwise it replaces the cache and every script is
//! re-checked.
//!
//! Only the `uso` rule set is understood. A rule `X` blocks a script whose
//! download URL is on `userscripts.org` and either ends in `/X` (or `/X/`)
//! or contains `/X.user.js`.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{KeeperError, KeeperResult};
use crate::fetch::Fetcher;
use crate::hash;
use crate::script::Script;
use crate::store::{persist, ConfigStore};

const USO_HOST: &str = "userscripts.org";

/// Rules consumed from a blocklist document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uso: Option<Vec<String>>,
}

impl BlockRules {
    pub fn is_empty(&self) -> bool {
        self.uso.as_ref().map_or(true, Vec::is_empty)
    }

    pub fn blocks_url(&self, url: &str) -> bool {
        let Some(rules) = &self.uso else {
            return false;
        };
        let on_uso = url::Url::parse(url)
            .map(|u| u.host_str() == Some(USO_HOST))
            .unwrap_or(false);
        if !on_uso {
            return false;
        }

        rules.iter().filter(|rule| !rule.is_empty()).any(|rule| {
            url.ends_with(&format!("/{}", rule))
                || url.ends_with(&format!("/{}/", rule))
                || url.contains(&format!("/{}.user.js", rule))
        })
    }

    pub fn blocks(&self, script: &Script) -> bool {
        script
            .download_url
            .as_deref()
            .is_some_and(|url| self.blocks_url(url))
    }
}

/// What the manager is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlocklistPhase {
    Disabled,
    Idle,
    LoadingCache,
    Fetching,
}

#[derive(Debug)]
struct BlocklistState {
    phase: BlocklistPhase,
    rules: BlockRules,
    /// Digest of the document `rules` came from.
    digest: String,
}

pub struct BlocklistManager {
    store: Arc<ConfigStore>,
    settings: Arc<Settings>,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<BlocklistState>,
}

impl BlocklistManager {
    pub fn new(
        store: Arc<ConfigStore>,
        settings: Arc<Settings>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Arc<Self> {
        let phase = if settings.get().blocklist.enabled {
            BlocklistPhase::Idle
        } else {
            BlocklistPhase::Disabled
        };
        Arc::new(Self {
            store,
            settings,
            fetcher,
            state: Mutex::new(BlocklistState {
                phase,
                rules: BlockRules::default(),
                digest: String::new(),
            }),
        })
    }

    pub fn phase(&self) -> BlocklistPhase {
        self.state.lock().phase
    }

    pub fn rules(&self) -> BlockRules {
        self.state.lock().rules.clone()
    }

    pub fn digest(&self) -> String {
        self.state.lock().digest.clone()
    }

    fn set_phase(&self, phase: BlocklistPhase) {
        self.state.lock().phase = phase;
    }

    /// Apply the cached list and start a fetch if one is due.
    ///
    /// Returns the background fetch, if one was started.
    pub async fn startup(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.settings.get().blocklist.enabled {
            self.set_phase(BlocklistPhase::Disabled);
            return None;
        }
        self.load_cache().await;
        self.refresh_if_due()
    }

    /// Load the cached list and re-check every script against it.
    ///
    /// Returns `false` if there is no usable cache.
    pub async fn load_cache(&self) -> bool {
        self.set_phase(BlocklistPhase::LoadingCache);

        let fs = self.store.file_system();
        let path = self.store.paths().blocklist.clone();
        let read = tokio::task::spawn_blocking(move || fs.read(&path)).await;

        let loaded = match read {
            Ok(Ok(Some(text))) => match serde_json::from_str::<BlockRules>(&text) {
                Ok(rules) => {
                    let mut state = self.state.lock();
                    state.rules = rules;
                    state.digest = hash::digest(&text);
                    true
                }
                Err(e) => {
                    warn!("Ignoring unreadable blocklist cache: {}", e);
                    false
                }
            },
            Ok(Ok(None)) => false,
            Ok(Err(e)) => {
                warn!("Failed to read blocklist cache: {}", e);
                false
            }
            Err(e) => {
                warn!("Blocklist cache task failed: {}", e);
                false
            }
        };

        self.set_phase(BlocklistPhase::Idle);
        if loaded {
            self.apply();
        }
        loaded
    }

    /// Start a background fetch if the refresh interval has elapsed.
    ///
    /// Records the attempt time before fetching, so a failed fetch waits a
    /// full interval too.
    pub fn refresh_if_due(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let prefs = self.settings.get().blocklist;
        if !prefs.enabled {
            return None;
        }

        let now = chrono::Utc::now().timestamp();
        if now - prefs.last_fetch < prefs.interval as i64 {
            debug!(last_fetch = prefs.last_fetch, "Blocklist is fresh");
            return None;
        }

        if let Err(e) = self.settings.update(|p| p.blocklist.last_fetch = now) {
            warn!("Failed to record blocklist fetch time: {}", e);
        }

        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(e) = manager.fetch_now().await {
                debug!("Blocklist fetch failed: {}", e);
            }
        }))
    }

    /// Fetch the remote list now.
    ///
    /// Returns whether the rules changed. On failure the current rules stay.
    pub async fn fetch_now(&self) -> KeeperResult<bool> {
        self.set_phase(BlocklistPhase::Fetching);
        let result = self.fetch_and_apply().await;
        let phase = if self.settings.get().blocklist.enabled {
            BlocklistPhase::Idle
        } else {
            BlocklistPhase::Disabled
        };
        self.set_phase(phase);
        result
    }

    async fn fetch_and_apply(&self) -> KeeperResult<bool> {
        let url = self.settings.get().blocklist.url;
        let body = self.fetcher.fetch(&url).await?;

        let rules: BlockRules = serde_json::from_str(&body)
            .map_err(|e| KeeperError::parse("blocklist", e))?;
        if rules.uso.is_none() {
            return Err(KeeperError::parse("blocklist", "no uso rules"));
        }

        let digest = hash::digest(&body);
        if self.state.lock().digest == digest {
            debug!("Blocklist unchanged");
            return Ok(false);
        }

        let fs = self.store.file_system();
        let path = self.store.paths().blocklist.clone();
        let tmp = path.with_extension("json.tmp");
        let written = tokio::task::spawn_blocking(move || {
            persist::write_atomic(fs.as_ref(), &tmp, &path, &body)
        })
        .await
        .map_err(io::Error::other)?;
        if let Err(e) = written {
            warn!("Failed to cache blocklist: {}", e);
        }

        {
            // set_enforcement(false) updates the settings before it clears
            // the state under this lock.
            let mut state = self.state.lock();
            if !self.settings.get().blocklist.enabled {
                debug!("Blocklist disabled during fetch, not applying");
                return Ok(false);
            }
            state.rules = rules;
            state.digest = digest;
        }
        info!("Updated blocklist");
        self.apply();
        Ok(true)
    }

    /// Turn enforcement on or off.
    ///
    /// Turning it off forgets the rules; scripts keep their block flag until
    /// the next check.
    pub async fn set_enforcement(self: &Arc<Self>, enabled: bool) -> KeeperResult<()> {
        self.settings.update(|p| p.blocklist.enabled = enabled)?;
        if enabled {
            self.load_cache().await;
            self.refresh_if_due();
        } else {
            let mut state = self.state.lock();
            state.rules = BlockRules::default();
            state.digest.clear();
            state.phase = BlocklistPhase::Disabled;
        }
        Ok(())
    }

    /// Re-check every script against the current rules.
    ///
    /// Does nothing while enforcement is off. Returns how many flipped.
    pub fn apply(&self) -> usize {
        if !self.settings.get().blocklist.enabled {
            return 0;
        }
        let rules = self.rules();
        self.store.apply_block_check(|script| rules.blocks(script))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Preferences;
    use crate::fetch::tests::StaticFetcher;
    use crate::fetch::{FetchFuture, HttpRequest, HttpResponse};
    use crate::store::{DiskFileSystem, EventKind, ProfilePaths};
    use tempfile::TempDir;
    use tokio::sync::{Notify, Semaphore};

    const LIST_URL: &str = "http://blocklist.test/list.json";
    const USO_SCRIPT: &str = "http://userscripts.org/scripts/source/42.user.js";

    fn settings(last_fetch: i64) -> Arc<Settings> {
        let mut prefs = Preferences::default();
        prefs.blocklist.url = LIST_URL.to_string();
        prefs.blocklist.last_fetch = last_fetch;
        Arc::new(Settings::in_memory(prefs))
    }

    async fn store_with_uso_script(dir: &std::path::Path) -> Arc<ConfigStore> {
        let store = ConfigStore::load(ProfilePaths::new(dir), Arc::new(DiskFileSystem))
            .await
            .unwrap();
        store
            .install_source(
                "// ==UserScript==\n// @name Uso\n// @include *\n// ==/UserScript==\n",
                Some(USO_SCRIPT),
            )
            .await
            .unwrap();
        store
    }

    fn block_events(store: &ConfigStore) -> Arc<Mutex<usize>> {
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        store.subscribe(move |event| {
            if event.kind == EventKind::BlockStateChanged {
                *sink.lock() += 1;
            }
            Ok(())
        });
        count
    }

    #[test]
    fn test_uso_rules() {
        let rules = BlockRules {
            uso: Some(vec!["42".to_string()]),
        };
        assert!(rules.blocks_url("http://userscripts.org/scripts/show/42"));
        assert!(rules.blocks_url("http://userscripts.org/scripts/show/42/"));
        assert!(rules.blocks_url(USO_SCRIPT));
        assert!(!rules.blocks_url("http://userscripts.org/scripts/show/420"));
        assert!(!rules.blocks_url("http://example.com/scripts/source/42.user.js"));
        assert!(!BlockRules::default().blocks_url(USO_SCRIPT));
    }

    #[tokio::test]
    async fn test_same_digest_does_not_rescan() {
        let temp = TempDir::new().unwrap();
        let store = store_with_uso_script(temp.path()).await;
        let events = block_events(&store);
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(LIST_URL, 200, r#"{"uso":["42"]}"#);

        let manager = BlocklistManager::new(store.clone(), settings(0), fetcher.clone());
        let fetch = manager.startup().await.expect("fetch is due");
        fetch.await.unwrap();

        assert_eq!(*events.lock(), 1);
        assert!(store.scripts()[0].blocked);
        assert!(store.paths().blocklist.exists());

        assert!(!manager.fetch_now().await.unwrap());
        assert_eq!(*events.lock(), 1);
        assert_eq!(fetcher.request_count(), 2);
        store.flush().await;
    }

    #[tokio::test]
    async fn test_cache_is_applied_on_startup() {
        let temp = TempDir::new().unwrap();
        let store = store_with_uso_script(temp.path()).await;
        std::fs::write(&store.paths().blocklist, r#"{"uso":["42"]}"#).unwrap();
        let fetcher = Arc::new(StaticFetcher::default());

        let now = chrono::Utc::now().timestamp();
        let manager = BlocklistManager::new(store.clone(), settings(now), fetcher.clone());
        assert!(manager.startup().await.is_none());

        assert!(store.scripts()[0].blocked);
        assert_eq!(fetcher.request_count(), 0);
        assert_eq!(manager.phase(), BlocklistPhase::Idle);
        store.flush().await;
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_cache() {
        let temp = TempDir::new().unwrap();
        let store = store_with_uso_script(temp.path()).await;
        std::fs::write(&store.paths().blocklist, r#"{"uso":["42"]}"#).unwrap();
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.fail(LIST_URL);

        let manager = BlocklistManager::new(store.clone(), settings(0), fetcher.clone());
        if let Some(fetch) = manager.startup().await {
            fetch.await.unwrap();
        }

        assert_eq!(fetcher.request_count(), 1);
        assert!(!manager.rules().is_empty());
        assert!(store.scripts()[0].blocked);
        assert_eq!(manager.phase(), BlocklistPhase::Idle);
        store.flush().await;
    }

    #[tokio::test]
    async fn test_disabling_clears_rules_but_keeps_flags() {
        let temp = TempDir::new().unwrap();
        let store = store_with_uso_script(temp.path()).await;
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(LIST_URL, 200, r#"{"uso":["42"]}"#);

        let manager = BlocklistManager::new(store.clone(), settings(0), fetcher);
        assert!(manager.fetch_now().await.unwrap());
        manager.set_enforcement(false).await.unwrap();

        assert!(manager.rules().is_empty());
        assert_eq!(manager.phase(), BlocklistPhase::Disabled);
        assert!(store.scripts()[0].blocked);
        assert_eq!(manager.apply(), 0);
        store.flush().await;
    }

    /// Holds every request until a permit is released.
    struct GatedFetcher {
        inner: StaticFetcher,
        started: Notify,
        release: Semaphore,
    }

    impl GatedFetcher {
        fn new() -> Self {
            Self {
                inner: StaticFetcher::default(),
                started: Notify::new(),
                release: Semaphore::new(0),
            }
        }
    }

    impl Fetcher for GatedFetcher {
        fn request<'a>(&'a self, request: HttpRequest) -> FetchFuture<'a, HttpResponse> {
            Box::pin(async move {
                self.started.notify_one();
                if let Ok(permit) = self.release.acquire().await {
                    permit.forget();
                }
                self.inner.request(request).await
            })
        }
    }

    #[tokio::test]
    async fn test_disabling_during_fetch_wins() {
        let temp = TempDir::new().unwrap();
        let store = store_with_uso_script(temp.path()).await;
        let events = block_events(&store);
        let fetcher = Arc::new(GatedFetcher::new());
        fetcher.inner.serve(LIST_URL, 200, r#"{"uso":["42"]}"#);

        let manager = BlocklistManager::new(store.clone(), settings(0), fetcher.clone());
        let in_flight = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.fetch_now().await })
        };
        fetcher.started.notified().await;
        assert_eq!(manager.phase(), BlocklistPhase::Fetching);

        manager.set_enforcement(false).await.unwrap();
        fetcher.release.add_permits(1);
        assert!(!in_flight.await.unwrap().unwrap());

        assert!(manager.rules().is_empty());
        assert!(manager.digest().is_empty());
        assert_eq!(manager.phase(), BlocklistPhase::Disabled);
        assert!(!store.scripts()[0].blocked);
        assert_eq!(*events.lock(), 0);
        store.flush().await;
    }

    #[tokio::test]
    async fn test_list_without_uso_is_ignored() {
        let temp = TempDir::new().unwrap();
        let store = store_with_uso_script(temp.path()).await;
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(LIST_URL, 200, r#"{"other":[]}"#);

        let manager = BlocklistManager::new(store.clone(), settings(0), fetcher);
        assert!(manager.fetch_now().await.is_err());
        assert!(manager.digest().is_empty());
        assert!(!store.paths().blocklist.exists());
        store.flush().await;
    }
}
