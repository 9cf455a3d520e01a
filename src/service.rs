//! The assembled service a browser host talks to.
//!
//! [`Scriptkeeper`] wires the store, blocklist, catalog refresher,
//! provisioner and injector together and forwards the host's boundary events
//! to them.

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::blocklist::BlocklistManager;
use crate::catalog::CatalogRefresher;
use crate::config::Settings;
use crate::error::KeeperResult;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::injection::{DocumentId, Injector, Navigation};
use crate::sandbox::{BatchReport, DryRunEngine, HeadlessHost, Host, Provisioner, ScriptEngine};
use crate::script::Script;
use crate::store::{ConfigStore, DiskFileSystem, FileSystem, ProfilePaths};

static USER_SCRIPT_URL: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\.user(-\d+)?\.js$").ok());

/// Collaborators and settings for a [`Scriptkeeper`].
pub struct KeeperConfig {
    pub settings: Arc<Settings>,

    /// Profile directory; defaults to the one named in the settings.
    pub profile_dir: PathBuf,

    pub file_system: Arc<dyn FileSystem>,

    pub fetcher: Arc<dyn Fetcher>,

    pub engine: Arc<dyn ScriptEngine>,

    pub host: Arc<dyn Host>,
}

impl KeeperConfig {
    pub fn new(settings: Arc<Settings>) -> Self {
        let profile_dir = settings.get().profile_dir();
        Self {
            settings,
            profile_dir,
            file_system: Arc::new(DiskFileSystem),
            fetcher: Arc::new(HttpFetcher::new()),
            engine: Arc::new(DryRunEngine),
            host: Arc::new(HeadlessHost),
        }
    }
}

impl std::fmt::Debug for KeeperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperConfig")
            .field("settings", &self.settings)
            .field("profile_dir", &self.profile_dir)
            .finish_non_exhaustive()
    }
}

pub struct Scriptkeeper {
    settings: Arc<Settings>,
    store: Arc<ConfigStore>,
    blocklist: Arc<BlocklistManager>,
    catalog: Arc<CatalogRefresher>,
    provisioner: Arc<Provisioner>,
    injector: Injector,
    fetcher: Arc<dyn Fetcher>,
}

impl Scriptkeeper {
    /// Load the registry and start the blocklist.
    ///
    /// Due blocklist and catalog fetches run in the background. The catalog
    /// refresh starts after the cached blocklist was applied, so blocked
    /// scripts are skipped.
    pub async fn start(config: KeeperConfig) -> KeeperResult<Self> {
        let KeeperConfig {
            settings,
            profile_dir,
            file_system,
            fetcher,
            engine,
            host,
        } = config;

        info!(profile = %profile_dir.display(), "Starting scriptkeeper");
        let store = ConfigStore::load(ProfilePaths::new(profile_dir), file_system).await?;

        let blocklist = BlocklistManager::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            Arc::clone(&fetcher),
        );
        if blocklist.startup().await.is_some() {
            debug!("Blocklist fetch started");
        }

        let catalog = CatalogRefresher::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            Arc::clone(&fetcher),
        );
        if catalog.refresh_if_due().is_some() {
            debug!("Catalog refresh started");
        }

        let provisioner = Provisioner::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            engine,
            Arc::clone(&fetcher),
            host,
        );
        let injector = Injector::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            Arc::clone(&provisioner),
        );

        Ok(Self {
            settings,
            store,
            blocklist,
            catalog,
            provisioner,
            injector,
            fetcher,
        })
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn blocklist(&self) -> &Arc<BlocklistManager> {
        &self.blocklist
    }

    pub fn catalog(&self) -> &Arc<CatalogRefresher> {
        &self.catalog
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    /// Whether navigating to `url` should be turned into an install request.
    pub fn should_intercept(url: &str) -> bool {
        let path = match url::Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => url.to_string(),
        };
        USER_SCRIPT_URL
            .as_ref()
            .is_some_and(|re| re.is_match(&path))
    }

    /// Download and install the script at `url`.
    pub async fn install_from_url(&self, url: &str) -> KeeperResult<Script> {
        let source = self.fetcher.fetch(url).await?;
        let script = self.store.install_source(&source, Some(url)).await?;
        self.blocklist.apply();
        Ok(self.store.get(&script.id).unwrap_or(script))
    }

    pub async fn document_ready(&self, navigation: Navigation) -> BatchReport {
        self.injector.document_ready(navigation).await
    }

    pub fn content_loaded(&self, document: DocumentId) -> BatchReport {
        self.injector.content_loaded(document)
    }

    pub fn window_loaded(&self, document: DocumentId) -> BatchReport {
        self.injector.window_loaded(document)
    }

    pub fn document_destroyed(&self, document: DocumentId) -> bool {
        self.injector.document_destroyed(document)
    }

    pub fn location_changed(&self, document: DocumentId, url: &str) {
        self.injector.location_changed(document, url);
    }

    pub fn set_injection_enabled(&self, enabled: bool) -> KeeperResult<()> {
        self.injector.set_enabled(enabled)
    }

    pub async fn set_blocklist_enabled(&self, enabled: bool) -> KeeperResult<()> {
        self.blocklist.set_enforcement(enabled).await
    }

    /// Purge queued uninstalls and wait for the registry to be written.
    pub async fn shutdown(&self) {
        let purged = self.store.finalize_pending_uninstalls();
        if purged > 0 {
            info!(purged, "Finalized pending uninstalls");
        }
        self.store.flush().await;
    }
}
