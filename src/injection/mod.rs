//! Injection scheduling.
//!
//! The host reports document lifecycle events to an [`Injector`]:
//!
//! - [`document_ready`](Injector::document_ready) when a document is created
//! - [`content_loaded`](Injector::content_loaded) when its DOM is parsed
//! - [`window_loaded`](Injector::window_loaded) when subresources are done
//! - [`document_destroyed`](Injector::document_destroyed) when it goes away
//!
//! Matching happens once, at `document_ready`, and the matches are split into
//! run-at buckets. `document-start` scripts run right away. The other buckets
//! wait for their milestone and are checked again before they run, since the
//! document may have been redirected or injection switched off meanwhile.

mod document;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

pub use document::DocumentLifetime;

use crate::config::Settings;
use crate::error::KeeperResult;
use crate::sandbox::{BatchReport, Provisioner, Scope};
use crate::script::Script;
use crate::store::{ConfigEvent, ConfigStore, EventKind};
use document::{Buckets, DocumentContext};

/// Host-assigned identity of one document instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u64);

/// How far a document has loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    #[default]
    Loading,
    /// DOM content loaded.
    Interactive,
    /// Window loaded.
    Complete,
}

/// A new document, as reported by the host.
#[derive(Debug, Clone)]
pub struct Navigation {
    pub document: DocumentId,
    pub url: String,
    pub is_top_level: bool,
    pub ready_state: ReadyState,
    /// The document's global scope.
    pub page: Arc<Scope>,
}

impl Navigation {
    /// A top-level document that has just started loading.
    pub fn new(document: DocumentId, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            document,
            page: Scope::root(format!("page:{}", url)),
            url,
            is_top_level: true,
            ready_state: ReadyState::Loading,
        }
    }

    pub fn in_frame(mut self) -> Self {
        self.is_top_level = false;
        self
    }

    pub fn with_ready_state(mut self, ready_state: ReadyState) -> Self {
        self.ready_state = ready_state;
        self
    }

    pub fn with_page(mut self, page: Arc<Scope>) -> Self {
        self.page = page;
        self
    }
}

/// Whether scripts may be injected into documents at `url` at all.
///
/// Only web content qualifies: `http`, `https` and `ftp`, plus `file` when
/// allowed.
pub fn is_injectable_url(url: &str, allow_file_urls: bool) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => match parsed.scheme() {
            "http" | "https" | "ftp" => true,
            "file" => allow_file_urls,
            _ => false,
        },
        Err(_) => false,
    }
}

/// Whether a scheduled injection of `script` should still happen.
pub(crate) fn still_wanted(
    store: &ConfigStore,
    settings: &Settings,
    lifetime: &DocumentLifetime,
    script: &Script,
) -> bool {
    if lifetime.is_closed() {
        return false;
    }
    let prefs = settings.get();
    let url = lifetime.url();
    let wanted = prefs.general.enabled
        && is_injectable_url(&url, prefs.injection.allow_file_urls)
        && store.matches(&script.id, &url, lifetime.is_top_level());
    if !wanted {
        debug!(script = %script.id, document = ?lifetime.id(), url, "Dropping scheduled script");
    }
    wanted
}

fn revalidate(
    store: &ConfigStore,
    settings: &Settings,
    lifetime: &DocumentLifetime,
    scripts: Vec<Script>,
) -> Vec<Script> {
    scripts
        .into_iter()
        .filter(|s| still_wanted(store, settings, lifetime, s))
        .collect()
}

/// Buckets taken out of a context, ready to run outside the lock.
struct DueScripts {
    lifetime: Arc<DocumentLifetime>,
    page: Arc<Scope>,
    end: Vec<Script>,
    idle: Vec<Script>,
    load: Vec<Script>,
}

pub struct Injector {
    store: Arc<ConfigStore>,
    settings: Arc<Settings>,
    provisioner: Arc<Provisioner>,
    documents: Mutex<HashMap<DocumentId, DocumentContext>>,
}

impl Injector {
    pub fn new(
        store: Arc<ConfigStore>,
        settings: Arc<Settings>,
        provisioner: Arc<Provisioner>,
    ) -> Self {
        Self {
            store,
            settings,
            provisioner,
            documents: Mutex::default(),
        }
    }

    /// Documents currently tracked.
    pub fn document_count(&self) -> usize {
        self.documents.lock().len()
    }

    /// Match scripts for a new document and run its `document-start` bucket.
    ///
    /// Milestones the document has already passed, per
    /// [`Navigation::ready_state`] or reported while matching was in
    /// progress, fire right after. A repeated call for a tracked document is
    /// ignored.
    pub async fn document_ready(&self, navigation: Navigation) -> BatchReport {
        let prefs = self.settings.get();
        if !prefs.general.enabled {
            return BatchReport::default();
        }
        if !is_injectable_url(&navigation.url, prefs.injection.allow_file_urls) {
            debug!(url = %navigation.url, "Not an injectable document");
            return BatchReport::default();
        }

        let id = navigation.document;
        let lifetime = DocumentLifetime::new(
            id,
            navigation.url.clone(),
            navigation.is_top_level,
            self.store.runtime().clone(),
        );
        let page = Arc::clone(&navigation.page);
        {
            let mut documents = self.documents.lock();
            if documents.contains_key(&id) {
                debug!(document = ?id, "Document already tracked");
                return BatchReport::default();
            }
            let context = DocumentContext::new(
                Arc::clone(&lifetime),
                Arc::clone(&page),
                navigation.ready_state,
            );
            documents.insert(id, context);
        }

        if prefs.injection.enable_script_refreshing {
            self.store.update_modified_scripts().await;
        }

        let scripts = self
            .store
            .matching_scripts(&lifetime.url(), lifetime.is_top_level());
        self.provisioner.prepare(&lifetime, &scripts).await;
        let mut buckets = Buckets::partition(scripts);
        let start = std::mem::take(&mut buckets.start);

        {
            let mut documents = self.documents.lock();
            match documents.get_mut(&id) {
                Some(context) if Arc::ptr_eq(&context.lifetime, &lifetime) => {
                    context.buckets = buckets;
                    context.armed = true;
                }
                _ => {
                    debug!(document = ?id, "Document went away while matching");
                    return BatchReport::default();
                }
            }
        }

        let mut report = self.provisioner.inject(&lifetime, &page, &start);
        report.merge(self.fire_due(id));
        report
    }

    /// The document's DOM has loaded.
    pub fn content_loaded(&self, document: DocumentId) -> BatchReport {
        self.reach(document, ReadyState::Interactive)
    }

    /// The document has fully loaded; implies [`content_loaded`](Self::content_loaded).
    pub fn window_loaded(&self, document: DocumentId) -> BatchReport {
        self.reach(document, ReadyState::Complete)
    }

    fn reach(&self, document: DocumentId, ready: ReadyState) -> BatchReport {
        match self.documents.lock().get_mut(&document) {
            Some(context) => context.advance(ready),
            None => return BatchReport::default(),
        }
        self.fire_due(document)
    }

    /// Run every bucket whose milestone has been reached.
    fn fire_due(&self, document: DocumentId) -> BatchReport {
        let Some(due) = self.take_due(document) else {
            return BatchReport::default();
        };

        let end = revalidate(&self.store, &self.settings, &due.lifetime, due.end);
        let mut report = self.provisioner.inject(&due.lifetime, &due.page, &end);

        if !due.idle.is_empty() {
            self.schedule_idle(&due.lifetime, &due.page, due.idle);
        }

        let load = revalidate(&self.store, &self.settings, &due.lifetime, due.load);
        report.merge(self.provisioner.inject(&due.lifetime, &due.page, &load));
        report
    }

    fn take_due(&self, document: DocumentId) -> Option<DueScripts> {
        let mut documents = self.documents.lock();
        let context = documents.get_mut(&document)?;
        if !context.armed {
            return None;
        }

        let mut due = DueScripts {
            lifetime: Arc::clone(&context.lifetime),
            page: Arc::clone(&context.page),
            end: Vec::new(),
            idle: Vec::new(),
            load: Vec::new(),
        };
        if context.ready >= ReadyState::Interactive {
            due.end = std::mem::take(&mut context.buckets.end);
            due.idle = std::mem::take(&mut context.buckets.idle);
        }
        if context.ready >= ReadyState::Complete {
            due.load = std::mem::take(&mut context.buckets.load);
        }
        Some(due)
    }

    /// Run `scripts` one scheduling tick from now.
    fn schedule_idle(
        &self,
        lifetime: &Arc<DocumentLifetime>,
        page: &Arc<Scope>,
        scripts: Vec<Script>,
    ) {
        let store = Arc::clone(&self.store);
        let settings = Arc::clone(&self.settings);
        let provisioner = Arc::clone(&self.provisioner);
        let document = Arc::clone(lifetime);
        let page = Arc::clone(page);

        lifetime.spawn(async move {
            tokio::task::yield_now().await;
            let scripts = revalidate(&store, &settings, &document, scripts);
            provisioner.inject(&document, &page, &scripts);
        });
    }

    /// Forget a document, cancelling everything scheduled for it.
    ///
    /// Returns `false` for unknown or already destroyed documents.
    pub fn document_destroyed(&self, document: DocumentId) -> bool {
        let Some(context) = self.documents.lock().remove(&document) else {
            return false;
        };
        context.lifetime.teardown()
    }

    /// The document's effective URL changed, e.g. through a redirect.
    pub fn location_changed(&self, document: DocumentId, url: &str) {
        if let Some(context) = self.documents.lock().get(&document) {
            context.lifetime.set_url(url);
        }
    }

    /// Toggle injection globally.
    ///
    /// Scripts already waiting for a milestone are dropped when it arrives.
    pub fn set_enabled(&self, enabled: bool) -> KeeperResult<()> {
        self.settings.update(|prefs| prefs.general.enabled = enabled)?;
        info!(enabled, "Injection toggled");
        self.store.notify(&ConfigEvent::new(
            EventKind::PreferencesChanged,
            None,
            json!({ "enabled": enabled }),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Preferences;
    use crate::fetch::tests::StaticFetcher;
    use crate::sandbox::tests::{source, RecordingEngine};
    use crate::sandbox::HeadlessHost;
    use crate::store::{DiskFileSystem, ProfilePaths};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        injector: Injector,
        engine: Arc<RecordingEngine>,
        _temp: TempDir,
    }

    async fn harness(scripts: &[(&str, &str)], refresh: bool) -> Harness {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::load(ProfilePaths::new(temp.path()), Arc::new(DiskFileSystem))
            .await
            .unwrap();
        for (name, extra) in scripts {
            store.install_source(&source(name, extra), None).await.unwrap();
        }
        store.flush().await;

        let mut prefs = Preferences::default();
        prefs.injection.enable_script_refreshing = refresh;
        let settings = Arc::new(Settings::in_memory(prefs));
        let engine = Arc::new(RecordingEngine::default());
        let provisioner = Provisioner::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            engine.clone(),
            Arc::new(StaticFetcher::default()),
            Arc::new(HeadlessHost),
        );

        Harness {
            injector: Injector::new(store, settings, provisioner),
            engine,
            _temp: temp,
        }
    }

    fn nav(id: u64) -> Navigation {
        Navigation::new(DocumentId(id), "http://example.com/page")
    }

    #[test]
    fn test_injectable_urls() {
        assert!(is_injectable_url("http://example.com/", false));
        assert!(is_injectable_url("https://example.com/", false));
        assert!(!is_injectable_url("about:blank", false));
        assert!(!is_injectable_url("chrome://browser/content", false));
        assert!(!is_injectable_url("file:///tmp/a.html", false));
        assert!(is_injectable_url("file:///tmp/a.html", true));
        assert!(!is_injectable_url("not a url", true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_run_in_order() {
        let h = harness(
            &[
                ("load", "// @run-at window-load\n"),
                ("idle", "// @run-at document-idle\n"),
                ("end-lo", "// @priority 1\n"),
                ("end-hi", "// @priority 10\n"),
                ("start-lo", "// @run-at document-start\n// @priority 5\n"),
                ("start-hi", "// @run-at document-start\n// @priority 10\n"),
            ],
            false,
        )
        .await;

        h.injector.document_ready(nav(1)).await;
        assert_eq!(h.engine.runs(), vec!["start-hi", "start-lo"]);

        let report = h.injector.content_loaded(DocumentId(1));
        assert_eq!(report.executed.len(), 2);
        assert_eq!(h.engine.runs()[2..], ["end-hi", "end-lo"]);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.engine.runs().last().unwrap(), "idle");

        h.injector.window_loaded(DocumentId(1));
        assert_eq!(h.engine.runs().len(), 6);
        assert_eq!(h.engine.runs().last().unwrap(), "load");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_load_implies_content_loaded() {
        let h = harness(&[("load", "// @run-at window-load\n"), ("end", "")], false).await;

        h.injector.document_ready(nav(1)).await;
        h.injector.window_loaded(DocumentId(1));
        assert_eq!(h.engine.runs(), vec!["end", "load"]);

        // milestones do not re-run buckets
        h.injector.content_loaded(DocumentId(1));
        h.injector.window_loaded(DocumentId(1));
        assert_eq!(h.engine.runs().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_delayed_script() {
        let h = harness(&[("delayed", "// @delay 500\n")], false).await;

        h.injector.document_ready(nav(1)).await;
        h.injector.document_ready(nav(2)).await;
        let report = h.injector.content_loaded(DocumentId(1));
        assert_eq!(report.delayed.len(), 1);
        h.injector.content_loaded(DocumentId(2));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(h.injector.document_destroyed(DocumentId(1)));
        tokio::time::sleep(Duration::from_secs(1)).await;

        // only the surviving document ran it
        assert_eq!(h.engine.runs(), vec!["delayed"]);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let h = harness(&[("end", "")], false).await;

        h.injector.document_ready(nav(1)).await;
        assert_eq!(h.injector.document_count(), 1);
        assert!(h.injector.document_destroyed(DocumentId(1)));
        assert!(!h.injector.document_destroyed(DocumentId(1)));
        assert_eq!(h.injector.document_count(), 0);

        assert!(h.injector.content_loaded(DocumentId(1)).is_empty());
        assert!(h.engine.runs().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ready_is_ignored() {
        let h = harness(&[("start", "// @run-at document-start\n")], false).await;

        h.injector.document_ready(nav(1)).await;
        h.injector.document_ready(nav(1)).await;
        assert_eq!(h.engine.runs(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_disabling_drops_pending_scripts() {
        let h = harness(&[("end", ""), ("start", "// @run-at document-start\n")], false).await;

        h.injector.document_ready(nav(1)).await;
        h.injector.set_enabled(false).unwrap();
        h.injector.content_loaded(DocumentId(1));
        assert_eq!(h.engine.runs(), vec!["start"]);

        h.injector.document_ready(nav(2)).await;
        assert_eq!(h.injector.document_count(), 1);
    }

    #[tokio::test]
    async fn test_redirect_drops_pending_scripts() {
        let h = harness(&[("end", "")], false).await;

        h.injector.document_ready(nav(1)).await;
        h.injector.location_changed(DocumentId(1), "http://elsewhere.org/");
        let report = h.injector.content_loaded(DocumentId(1));

        assert!(report.is_empty());
        assert!(h.engine.runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_attach_fires_passed_milestones() {
        let h = harness(
            &[
                ("load", "// @run-at window-load\n"),
                ("end", ""),
                ("start", "// @run-at document-start\n"),
            ],
            false,
        )
        .await;

        let report = h
            .injector
            .document_ready(nav(1).with_ready_state(ReadyState::Complete))
            .await;
        assert_eq!(report.executed.len(), 3);
        assert_eq!(h.engine.runs(), vec!["start", "end", "load"]);
    }

    #[tokio::test]
    async fn test_milestone_during_matching() {
        let h = harness(&[("end", ""), ("start", "// @run-at document-start\n")], true).await;

        let injector = &h.injector;
        let (report, early) = tokio::join!(injector.document_ready(nav(1)), async {
            injector.content_loaded(DocumentId(1))
        });

        assert_eq!(report.executed.len() + early.executed.len(), 2);
        assert_eq!(h.engine.runs(), vec!["start", "end"]);
    }

    #[tokio::test]
    async fn test_bodies_are_read_when_matched() {
        let h = harness(&[("end", "")], false).await;

        h.injector.document_ready(nav(1)).await;
        let script = h.injector.store.scripts().remove(0);
        std::fs::remove_file(h.injector.store.script_path(&script)).unwrap();

        let report = h.injector.content_loaded(DocumentId(1));
        assert_eq!(report.executed, vec![script.id]);
        assert_eq!(h.engine.runs(), vec!["end"]);
    }

    #[tokio::test]
    async fn test_frames_skip_noframes_scripts() {
        let scripts = [("top", "// @noframes\n"), ("any", "// @run-at document-start\n")];
        let h = harness(&scripts, false).await;

        h.injector.document_ready(nav(1).in_frame()).await;
        h.injector.content_loaded(DocumentId(1));
        assert_eq!(h.engine.runs(), vec!["any"]);
    }

    #[tokio::test]
    async fn test_ineligible_documents_are_not_tracked() {
        let h = harness(&[("start", "// @run-at document-start\n")], false).await;

        let report = h
            .injector
            .document_ready(Navigation::new(DocumentId(1), "about:blank"))
            .await;
        assert!(report.is_empty());
        assert_eq!(h.injector.document_count(), 0);
    }
}
