//! userscripts.org catalog metadata.
//!
//! Scripts installed from the catalog publish a `.meta.js` metadata block
//! next to their source. At most once per interval the block of every
//! catalog script that is not blocked is fetched, one request at a time, and
//! the reported version and description are stored on the script.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{KeeperError, KeeperResult};
use crate::fetch::Fetcher;
use crate::script::{CatalogInfo, Script};
use crate::store::ConfigStore;

/// Pause between two metadata requests.
const REQUEST_SPACING: Duration = Duration::from_millis(100);

pub struct CatalogRefresher {
    store: Arc<ConfigStore>,
    settings: Arc<Settings>,
    fetcher: Arc<dyn Fetcher>,
}

impl CatalogRefresher {
    pub fn new(
        store: Arc<ConfigStore>,
        settings: Arc<Settings>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            fetcher,
        })
    }

    /// Start a background refresh if the interval has elapsed.
    ///
    /// The attempt time is recorded up front. The returned task yields how
    /// many scripts changed.
    pub fn refresh_if_due(self: &Arc<Self>) -> Option<JoinHandle<usize>> {
        let prefs = self.settings.get().catalog;
        if !prefs.enabled {
            return None;
        }

        let now = chrono::Utc::now().timestamp();
        if now - prefs.last_fetch < prefs.interval as i64 {
            debug!(last_fetch = prefs.last_fetch, "Catalog metadata is fresh");
            return None;
        }

        if let Err(e) = self.settings.update(|p| p.catalog.last_fetch = now) {
            warn!("Failed to record catalog fetch time: {}", e);
        }

        let refresher = Arc::clone(self);
        Some(tokio::spawn(async move { refresher.refresh_all().await }))
    }

    /// Refresh every catalog script that is not blocked.
    ///
    /// A failed request only affects its own script. Returns how many
    /// scripts changed.
    pub async fn refresh_all(&self) -> usize {
        let candidates: Vec<Script> = self
            .store
            .scripts()
            .into_iter()
            .filter(|s| !s.blocked && s.is_uso_script())
            .collect();

        let mut changed = 0;
        for (i, script) in candidates.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(REQUEST_SPACING).await;
            }
            match self.refresh_script(script).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => debug!(script = %script.id, "Catalog refresh failed: {}", e),
            }
        }

        if changed > 0 {
            info!(changed, "Refreshed catalog metadata");
        }
        changed
    }

    /// Fetch and store the catalog metadata of one script.
    pub async fn refresh_script(&self, script: &Script) -> KeeperResult<bool> {
        let url = script
            .catalog_meta_url()
            .ok_or_else(|| KeeperError::parse("catalog metadata", "not a catalog script"))?;
        let body = self.fetcher.fetch(&url).await?;

        let meta = Script::parse(&body, script.download_url.as_deref())?;
        let info = CatalogInfo {
            version: meta.version,
            description: meta.description,
        };
        self.store.set_catalog_info(&script.id, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Preferences;
    use crate::fetch::tests::StaticFetcher;
    use crate::store::{DiskFileSystem, EventKind, ProfilePaths};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    const FIRST: &str = "http://userscripts.org/scripts/source/1.user.js";
    const SECOND: &str = "http://userscripts.org/scripts/source/2.user.js";
    const BLOCKED: &str = "http://userscripts.org/scripts/source/3.user.js";

    fn meta(name: &str, version: &str) -> String {
        format!(
            "// ==UserScript==\n// @name {}\n// @version {}\n\
             // @description from catalog\n// @include *\n// ==/UserScript==\n",
            name, version
        )
    }

    fn settings(last_fetch: i64) -> Arc<Settings> {
        let mut prefs = Preferences::default();
        prefs.catalog.last_fetch = last_fetch;
        Arc::new(Settings::in_memory(prefs))
    }

    async fn store(dir: &std::path::Path) -> Arc<ConfigStore> {
        let store = ConfigStore::load(ProfilePaths::new(dir), Arc::new(DiskFileSystem))
            .await
            .unwrap();
        for (name, url) in [("One", FIRST), ("Two", SECOND), ("Three", BLOCKED)] {
            let source = format!(
                "// ==UserScript==\n// @name {}\n// @version 1.0\n\
                 // @include *\n// ==/UserScript==\n",
                name
            );
            store.install_source(&source, Some(url)).await.unwrap();
        }
        store.install_source(&meta("Local", "1.0"), None).await.unwrap();
        store.apply_block_check(|s| s.download_url.as_deref() == Some(BLOCKED));
        store
    }

    fn modified_events(store: &ConfigStore) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(move |event| {
            if let (EventKind::Modified, Some(script)) = (event.kind, &event.script) {
                sink.lock().push(script.name.clone());
            }
            Ok(())
        });
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_records_catalog_versions() {
        let temp = TempDir::new().unwrap();
        let store = store(temp.path()).await;
        let events = modified_events(&store);
        let fetcher = Arc::new(StaticFetcher::default());
        let first_meta = "http://userscripts.org/scripts/source/1.meta.js";
        fetcher.serve(first_meta, 200, &meta("One", "2.0"));
        fetcher.fail("http://userscripts.org/scripts/source/2.meta.js");

        let refresher = CatalogRefresher::new(store.clone(), settings(0), fetcher.clone());
        let task = refresher.refresh_if_due().expect("refresh is due");
        assert_eq!(task.await.unwrap(), 1);

        // the blocked and the local script are never requested
        assert_eq!(fetcher.request_count(), 2);
        assert_eq!(*events.lock(), vec!["One".to_string()]);

        let scripts = store.scripts();
        let one = scripts.iter().find(|s| s.name == "One").unwrap();
        assert_eq!(one.version.as_deref(), Some("1.0"));
        assert_eq!(one.catalog.as_ref().unwrap().version.as_deref(), Some("2.0"));
        assert_eq!(one.catalog.as_ref().unwrap().description, "from catalog");
        assert!(one.update_available());
        assert!(scripts.iter().find(|s| s.name == "Two").unwrap().catalog.is_none());

        // unchanged metadata does not notify again
        assert_eq!(refresher.refresh_all().await, 0);
        assert_eq!(events.lock().len(), 1);
        store.flush().await;

        let (reloaded, _) = crate::store::persist::load(&DiskFileSystem, store.paths());
        let one = reloaded.scripts.iter().find(|s| s.name == "One").unwrap();
        assert_eq!(one.catalog.as_ref().unwrap().version.as_deref(), Some("2.0"));
    }

    #[tokio::test]
    async fn test_refresh_waits_for_interval() {
        let temp = TempDir::new().unwrap();
        let store = store(temp.path()).await;
        let fetcher = Arc::new(StaticFetcher::default());

        let now = chrono::Utc::now().timestamp();
        let refresher = CatalogRefresher::new(store.clone(), settings(now), fetcher.clone());
        assert!(refresher.refresh_if_due().is_none());

        let mut prefs = Preferences::default();
        prefs.catalog.enabled = false;
        let disabled = CatalogRefresher::new(
            store.clone(),
            Arc::new(Settings::in_memory(prefs)),
            fetcher.clone(),
        );
        assert!(disabled.refresh_if_due().is_none());
        assert_eq!(fetcher.request_count(), 0);
        store.flush().await;
    }

    #[tokio::test]
    async fn test_due_refresh_records_attempt_time() {
        let temp = TempDir::new().unwrap();
        let store = store(temp.path()).await;
        let settings = settings(0);
        let fetcher = Arc::new(StaticFetcher::default());
        let refresher = CatalogRefresher::new(store.clone(), settings.clone(), fetcher);

        let task = refresher.refresh_if_due().expect("refresh is due");
        assert!(settings.get().catalog.last_fetch > 0);
        assert!(refresher.refresh_if_due().is_none());
        assert_eq!(task.await.unwrap(), 0);
        store.flush().await;
    }
}
