//! The script registry.
//!
//! [`ConfigStore`] owns every installed [`Script`] and the registry-wide
//! exclude list. All mutation goes through its methods; each accepted change
//! notifies subscribers and requests a save.
//!
//! Saves are coalesced. At most one write is in flight; requests that arrive
//! meanwhile collapse into a single follow-up write of the latest state.

pub mod events;
pub mod fs;
pub mod persist;

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use events::{ConfigEvent, EventKind, Subscriber, SubscriptionId};
pub use fs::{DiskFileSystem, FileSystem};
pub use persist::{LoadSource, PersistedRegistry, ProfilePaths};

use crate::error::{KeeperError, KeeperResult};
use crate::hash;
use crate::pattern::Pattern;
use crate::script::{CatalogInfo, Script, ScriptId};
use events::Observers;

/// Progress of the registry writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    InFlight,
    /// A write is running and another was requested after it started.
    InFlightWithPending,
}

#[derive(Debug, Default)]
struct Registry {
    scripts: Vec<Script>,
    excludes: Vec<Pattern>,
}

impl Registry {
    fn position(&self, id: &ScriptId) -> KeeperResult<usize> {
        self.scripts
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| KeeperError::ScriptNotFound(id.to_string()))
    }

    fn exclude_sources(&self) -> Vec<String> {
        self.excludes.iter().map(|p| p.as_str().to_string()).collect()
    }
}

fn sort_by_priority(scripts: &mut [Script]) {
    scripts.sort_by_key(|s| Reverse(s.priority));
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "script".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether `script` should run on `url`.
///
/// Disabled, blocked and uninstall-queued scripts never match.
pub fn script_matches(
    script: &Script,
    excludes: &[Pattern],
    url: &str,
    is_top_level: bool,
) -> bool {
    script.is_runnable()
        && (is_top_level || !script.top_level_only)
        && script.matches_url(url)
        && !excludes.iter().any(|p| p.test(url))
}

type ActiveInjections = Arc<Mutex<HashMap<ScriptId, usize>>>;

/// Marks a script as executing; see [`ConfigStore::injection_guard`].
pub struct InjectionGuard {
    id: ScriptId,
    active: ActiveInjections,
}

impl Drop for InjectionGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.id);
            }
        }
    }
}

pub struct ConfigStore {
    paths: ProfilePaths,
    fs: Arc<dyn FileSystem>,
    runtime: Handle,
    registry: Mutex<Registry>,
    observers: Observers,
    save_state: watch::Sender<SaveState>,
    injecting: ActiveInjections,
    /// Scripts whose refresh was skipped because they were executing.
    deferred_refresh: Mutex<HashSet<ScriptId>>,
}

impl ConfigStore {
    /// Load the registry from a profile directory.
    ///
    /// Never fails on bad registry files; those fall back to the next format
    /// or to an empty registry. A registry read from XML is saved as JSON.
    pub async fn load(paths: ProfilePaths, fs: Arc<dyn FileSystem>) -> KeeperResult<Arc<Self>> {
        let (persisted, source) = {
            let fs = Arc::clone(&fs);
            let paths = paths.clone();
            tokio::task::spawn_blocking(move || persist::load(fs.as_ref(), &paths))
                .await
                .map_err(io::Error::other)?
        };

        let mut seen = HashSet::new();
        let mut scripts = Vec::with_capacity(persisted.scripts.len());
        for script in persisted.scripts {
            if seen.insert(script.id.clone()) {
                scripts.push(script);
            } else {
                warn!(script = %script.id, "Dropping duplicate registry entry");
            }
        }
        sort_by_priority(&mut scripts);

        let (save_state, _) = watch::channel(SaveState::Idle);
        let store = Arc::new(Self {
            paths,
            fs,
            runtime: Handle::current(),
            registry: Mutex::new(Registry {
                scripts,
                excludes: persisted.excludes,
            }),
            observers: Observers::default(),
            save_state,
            injecting: Arc::default(),
            deferred_refresh: Mutex::default(),
        });

        if source.needs_save() {
            info!(?source, "Migrating registry to JSON");
            store.request_save();
        }

        Ok(store)
    }

    pub fn paths(&self) -> &ProfilePaths {
        &self.paths
    }

    pub fn file_system(&self) -> Arc<dyn FileSystem> {
        Arc::clone(&self.fs)
    }

    /// Runtime the store was loaded on.
    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    // -- persistence ------------------------------------------------------

    pub fn save_state(&self) -> SaveState {
        *self.save_state.borrow()
    }

    /// Schedule a save, merging with one that is already queued.
    pub fn request_save(self: &Arc<Self>) {
        let mut start = false;
        self.save_state.send_modify(|state| {
            *state = match *state {
                SaveState::Idle => {
                    start = true;
                    SaveState::InFlight
                }
                SaveState::InFlight | SaveState::InFlightWithPending => {
                    SaveState::InFlightWithPending
                }
            };
        });

        if start {
            let store = Arc::clone(self);
            self.runtime.spawn(store.run_saves());
        }
    }

    async fn run_saves(self: Arc<Self>) {
        loop {
            let snapshot = self.snapshot();
            let fs = Arc::clone(&self.fs);
            let paths = self.paths.clone();
            let result =
                tokio::task::spawn_blocking(move || persist::save(fs.as_ref(), &paths, &snapshot))
                    .await;

            match result {
                Ok(Ok(())) => debug!(path = %self.paths.registry.display(), "Registry saved"),
                Ok(Err(e)) => warn!("Registry save failed, retrying on next change: {}", e),
                Err(e) => warn!("Registry save task failed: {}", e),
            }

            let mut again = false;
            self.save_state.send_modify(|state| {
                if *state == SaveState::InFlightWithPending {
                    again = true;
                    *state = SaveState::InFlight;
                } else {
                    *state = SaveState::Idle;
                }
            });
            if !again {
                break;
            }
        }
    }

    /// Wait until no save is running or queued.
    pub async fn flush(&self) {
        let mut state = self.save_state.subscribe();
        let _ = state.wait_for(|s| *s == SaveState::Idle).await;
    }

    /// Copy of the state that gets persisted.
    pub fn snapshot(&self) -> PersistedRegistry {
        let registry = self.registry.lock();
        PersistedRegistry {
            excludes: registry.excludes.clone(),
            scripts: registry.scripts.clone(),
        }
    }

    fn commit(self: &Arc<Self>, events: Vec<ConfigEvent>) {
        self.request_save();
        for event in &events {
            self.observers.notify(event);
        }
    }

    async fn write_body(&self, filename: &str, source: &str) -> KeeperResult<()> {
        let path = self.paths.script(filename);
        let tmp = path.with_extension("js.tmp");
        let fs = Arc::clone(&self.fs);
        let body = source.to_string();
        tokio::task::spawn_blocking(move || persist::write_atomic(fs.as_ref(), &tmp, &path, &body))
            .await
            .map_err(io::Error::other)?
    }

    // -- observers --------------------------------------------------------

    pub fn subscribe(
        &self,
        subscriber: impl Fn(&ConfigEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.observers.subscribe(Arc::new(subscriber))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Broadcast an event that did not originate in the store.
    pub fn notify(&self, event: &ConfigEvent) {
        self.observers.notify(event);
    }

    // -- queries ----------------------------------------------------------

    /// All scripts in priority order.
    pub fn scripts(&self) -> Vec<Script> {
        self.registry.lock().scripts.clone()
    }

    pub fn get(&self, id: &ScriptId) -> Option<Script> {
        self.registry.lock().scripts.iter().find(|s| &s.id == id).cloned()
    }

    pub fn excludes(&self) -> Vec<Pattern> {
        self.registry.lock().excludes.clone()
    }

    pub fn is_url_excluded(&self, url: &str) -> bool {
        self.registry.lock().excludes.iter().any(|p| p.test(url))
    }

    /// Scripts that should run on `url`, in priority order.
    pub fn matching_scripts(&self, url: &str, is_top_level: bool) -> Vec<Script> {
        let registry = self.registry.lock();
        if registry.excludes.iter().any(|p| p.test(url)) {
            return Vec::new();
        }
        registry
            .scripts
            .iter()
            .filter(|s| script_matches(s, &[], url, is_top_level))
            .cloned()
            .collect()
    }

    /// Whether the current record of `id` still matches `url`.
    pub fn matches(&self, id: &ScriptId, url: &str, is_top_level: bool) -> bool {
        let registry = self.registry.lock();
        registry
            .scripts
            .iter()
            .find(|s| &s.id == id)
            .is_some_and(|s| script_matches(s, &registry.excludes, url, is_top_level))
    }

    pub fn script_path(&self, script: &Script) -> PathBuf {
        self.paths.script(&script.filename)
    }

    /// Read a script's body from the profile directory.
    pub fn read_source(&self, script: &Script) -> KeeperResult<String> {
        let path = self.script_path(script);
        self.fs.read(&path)?.ok_or_else(|| {
            KeeperError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is missing", path.display()),
            ))
        })
    }

    /// Read several bodies off the async threads.
    ///
    /// Bodies that cannot be read are reported per script.
    pub async fn read_sources(
        self: &Arc<Self>,
        scripts: Vec<Script>,
    ) -> Vec<(ScriptId, KeeperResult<String>)> {
        let store = Arc::clone(self);
        let ids: Vec<ScriptId> = scripts.iter().map(|s| s.id.clone()).collect();
        let read = tokio::task::spawn_blocking(move || {
            scripts
                .iter()
                .map(|s| (s.id.clone(), store.read_source(s)))
                .collect::<Vec<_>>()
        })
        .await;

        match read {
            Ok(bodies) => bodies,
            Err(e) => {
                warn!("Script read task failed: {}", e);
                ids.into_iter()
                    .map(|id| (id, Err(KeeperError::Io(io::Error::other(e.to_string())))))
                    .collect()
            }
        }
    }

    /// Mark `id` as executing until the guard is dropped.
    ///
    /// Refreshes of an executing script are deferred to the next
    /// [`update_modified_scripts`](Self::update_modified_scripts).
    pub fn injection_guard(&self, id: &ScriptId) -> InjectionGuard {
        *self.injecting.lock().entry(id.clone()).or_insert(0) += 1;
        InjectionGuard {
            id: id.clone(),
            active: Arc::clone(&self.injecting),
        }
    }

    fn is_injecting(&self, id: &ScriptId) -> bool {
        self.injecting.lock().get(id).is_some_and(|n| *n > 0)
    }

    // -- mutations --------------------------------------------------------

    /// Add a parsed script, or replace the installed script with the same id.
    ///
    /// A replacement keeps the old position, enabled state and block flag.
    pub fn install(self: &Arc<Self>, mut script: Script) -> EventKind {
        let kind = {
            let mut registry = self.registry.lock();
            match registry.scripts.iter_mut().find(|s| s.id == script.id) {
                Some(existing) => {
                    script.priority = existing.priority;
                    script.enabled = if existing.needs_uninstall {
                        existing.enabled_before_uninstall.unwrap_or(true)
                    } else {
                        existing.enabled
                    };
                    script.blocked = existing.blocked;
                    script.needs_uninstall = false;
                    script.enabled_before_uninstall = None;
                    *existing = script.clone();
                    EventKind::Updated
                }
                None => {
                    registry.scripts.push(script.clone());
                    sort_by_priority(&mut registry.scripts);
                    EventKind::Installed
                }
            }
        };

        self.deferred_refresh.lock().remove(&script.id);
        info!(script = %script.id, ?kind, "Installed script");
        self.commit(vec![ConfigEvent::new(kind, Some(script), Value::Null)]);
        kind
    }

    /// Parse `source`, store its body and install it.
    pub async fn install_source(
        self: &Arc<Self>,
        source: &str,
        download_url: Option<&str>,
    ) -> KeeperResult<Script> {
        let mut script = Script::parse(source, download_url)?;
        script.filename = self.filename_for(&script);
        self.write_body(&script.filename, source).await?;

        let id = script.id.clone();
        self.install(script.clone());
        Ok(self.get(&id).unwrap_or(script))
    }

    fn filename_for(&self, script: &Script) -> String {
        let registry = self.registry.lock();
        if let Some(existing) = registry.scripts.iter().find(|s| s.id == script.id) {
            return existing.filename.clone();
        }

        let stem = sanitize_filename(&script.name);
        let taken = |candidate: &str| {
            registry.scripts.iter().any(|s| s.filename == candidate)
                || matches!(self.fs.read(&self.paths.script(candidate)), Ok(Some(_)))
        };

        let mut candidate = format!("{}.user.js", stem);
        let mut n = 2;
        while taken(&candidate) {
            candidate = format!("{}-{}.user.js", stem, n);
            n += 1;
        }
        candidate
    }

    /// Move a script `delta` places (negative is toward the front).
    ///
    /// The moved script takes a neighbouring priority where needed so the
    /// list stays sorted.
    pub fn move_script(self: &Arc<Self>, id: &ScriptId, delta: isize) -> KeeperResult<()> {
        let event = {
            let mut registry = self.registry.lock();
            let from = registry.position(id)?;
            let last = registry.scripts.len() as isize - 1;
            let to = (from as isize).saturating_add(delta).clamp(0, last) as usize;
            if to == from {
                return Ok(());
            }

            let mut script = registry.scripts.remove(from);
            if let Some(prev) = to.checked_sub(1).map(|i| &registry.scripts[i]) {
                script.priority = script.priority.min(prev.priority);
            }
            if let Some(next) = registry.scripts.get(to) {
                script.priority = script.priority.max(next.priority);
            }
            registry.scripts.insert(to, script.clone());
            ConfigEvent::new(EventKind::Moved, Some(script), json!({ "from": from, "to": to }))
        };

        self.commit(vec![event]);
        Ok(())
    }

    /// Re-sort by priority; saves only if the order changed.
    pub fn sort_scripts(self: &Arc<Self>) {
        let changed = {
            let mut registry = self.registry.lock();
            let before: Vec<ScriptId> = registry.scripts.iter().map(|s| s.id.clone()).collect();
            sort_by_priority(&mut registry.scripts);
            registry.scripts.iter().map(|s| &s.id).ne(before.iter())
        };
        if changed {
            self.commit(Vec::new());
        }
    }

    pub fn set_enabled(self: &Arc<Self>, id: &ScriptId, enabled: bool) -> KeeperResult<()> {
        let event = {
            let mut registry = self.registry.lock();
            let index = registry.position(id)?;
            let script = &mut registry.scripts[index];
            if script.enabled == enabled {
                return Ok(());
            }
            script.enabled = enabled;
            ConfigEvent::new(EventKind::EditEnabled, Some(script.clone()), json!(enabled))
        };

        self.commit(vec![event]);
        Ok(())
    }

    /// Replace a script's body, keeping its id and user state.
    pub async fn edit(self: &Arc<Self>, id: &ScriptId, source: &str) -> KeeperResult<Script> {
        let parsed = Script::parse(source, None)?;
        let filename = self
            .get(id)
            .ok_or_else(|| KeeperError::ScriptNotFound(id.to_string()))?
            .filename;
        self.write_body(&filename, source).await?;

        let updated = {
            let mut registry = self.registry.lock();
            let index = registry.position(id)?;
            let script = &mut registry.scripts[index];
            script.merge_metadata(parsed);
            script.clone()
        };

        self.deferred_refresh.lock().remove(id);
        self.commit(vec![ConfigEvent::new(
            EventKind::Edited,
            Some(updated.clone()),
            Value::Null,
        )]);
        Ok(updated)
    }

    /// Disable a script and mark it for removal. Undone by
    /// [`cancel_uninstall`](Self::cancel_uninstall).
    pub fn queue_uninstall(self: &Arc<Self>, id: &ScriptId) -> KeeperResult<()> {
        let event = {
            let mut registry = self.registry.lock();
            let index = registry.position(id)?;
            let script = &mut registry.scripts[index];
            if script.needs_uninstall {
                return Ok(());
            }
            script.enabled_before_uninstall = Some(script.enabled);
            script.enabled = false;
            script.needs_uninstall = true;
            ConfigEvent::new(EventKind::UninstallQueued, Some(script.clone()), Value::Null)
        };

        self.commit(vec![event]);
        Ok(())
    }

    pub fn cancel_uninstall(self: &Arc<Self>, id: &ScriptId) -> KeeperResult<()> {
        let event = {
            let mut registry = self.registry.lock();
            let index = registry.position(id)?;
            let script = &mut registry.scripts[index];
            if !script.needs_uninstall {
                return Ok(());
            }
            script.enabled = script.enabled_before_uninstall.take().unwrap_or(true);
            script.needs_uninstall = false;
            ConfigEvent::new(EventKind::UninstallCanceled, Some(script.clone()), Value::Null)
        };

        self.commit(vec![event]);
        Ok(())
    }

    /// Remove a script and its body for good.
    ///
    /// Returns `false` if no such script is installed.
    pub fn finalize_uninstall(self: &Arc<Self>, id: &ScriptId) -> bool {
        let removed = {
            let mut registry = self.registry.lock();
            match registry.position(id) {
                Ok(index) => registry.scripts.remove(index),
                Err(_) => return false,
            }
        };

        self.deferred_refresh.lock().remove(id);
        let fs = Arc::clone(&self.fs);
        let body = self.script_path(&removed);
        self.runtime.spawn_blocking(move || {
            if let Err(e) = fs.remove(&body) {
                warn!(path = %body.display(), "Failed to delete script body: {}", e);
            }
        });

        info!(script = %removed.id, "Uninstalled script");
        self.commit(vec![ConfigEvent::new(
            EventKind::Removed,
            Some(removed),
            Value::Null,
        )]);
        true
    }

    /// Finalize every queued uninstall. Returns how many were removed.
    pub fn finalize_pending_uninstalls(self: &Arc<Self>) -> usize {
        let pending: Vec<ScriptId> = self
            .registry
            .lock()
            .scripts
            .iter()
            .filter(|s| s.needs_uninstall)
            .map(|s| s.id.clone())
            .collect();

        pending
            .iter()
            .filter(|id| self.finalize_uninstall(id))
            .count()
    }

    /// Add a registry-wide exclude. Adding a pattern twice is a no-op.
    pub fn add_exclude(self: &Arc<Self>, pattern: &str) -> KeeperResult<()> {
        let compiled = Pattern::compile(pattern)?;
        let event = {
            let mut registry = self.registry.lock();
            if registry.excludes.contains(&compiled) {
                return Ok(());
            }
            registry.excludes.push(compiled);
            self.excludes_event(&registry)
        };

        self.commit(vec![event]);
        Ok(())
    }

    pub fn remove_exclude(self: &Arc<Self>, pattern: &str) -> bool {
        let event = {
            let mut registry = self.registry.lock();
            let before = registry.excludes.len();
            registry.excludes.retain(|p| p.as_str() != pattern);
            if registry.excludes.len() == before {
                return false;
            }
            self.excludes_event(&registry)
        };

        self.commit(vec![event]);
        true
    }

    /// Replace the whole exclude list. Nothing changes if any pattern is bad.
    pub fn set_excludes<I, S>(self: &Arc<Self>, patterns: I) -> KeeperResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| Pattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let event = {
            let mut registry = self.registry.lock();
            registry.excludes = compiled;
            self.excludes_event(&registry)
        };

        self.commit(vec![event]);
        Ok(())
    }

    fn excludes_event(&self, registry: &Registry) -> ConfigEvent {
        ConfigEvent::new(
            EventKind::PreferencesChanged,
            None,
            json!({ "excludes": registry.exclude_sources() }),
        )
    }

    /// Set each script's `blocked` flag from `is_blocked`.
    ///
    /// Emits one event per flipped script and returns how many flipped.
    pub fn apply_block_check(self: &Arc<Self>, is_blocked: impl Fn(&Script) -> bool) -> usize {
        let events: Vec<ConfigEvent> = {
            let mut registry = self.registry.lock();
            registry
                .scripts
                .iter_mut()
                .filter_map(|script| {
                    let blocked = is_blocked(script);
                    (blocked != script.blocked).then(|| {
                        script.blocked = blocked;
                        info!(script = %script.id, blocked, "Block state changed");
                        ConfigEvent::new(
                            EventKind::BlockStateChanged,
                            Some(script.clone()),
                            json!({ "blocked": blocked }),
                        )
                    })
                })
                .collect()
        };

        let flipped = events.len();
        if flipped > 0 {
            self.commit(events);
        }
        flipped
    }

    /// Record what the catalog reported for `id`.
    ///
    /// Emits [`EventKind::Modified`] and saves only when the record changed.
    pub fn set_catalog_info(
        self: &Arc<Self>,
        id: &ScriptId,
        info: CatalogInfo,
    ) -> KeeperResult<bool> {
        let event = {
            let mut registry = self.registry.lock();
            let index = registry.position(id)?;
            let script = &mut registry.scripts[index];
            if script.catalog.as_ref() == Some(&info) {
                return Ok(false);
            }
            script.catalog = Some(info);
            let update_available = script.update_available();
            debug!(script = %id, update_available, "Catalog info updated");
            ConfigEvent::new(
                EventKind::Modified,
                Some(script.clone()),
                json!({ "catalog": script.catalog }),
            )
        };

        self.commit(vec![event]);
        Ok(true)
    }

    /// Re-read scripts whose body changed on disk since it was last parsed.
    ///
    /// Scripts that are executing are skipped and re-read on the next call.
    /// Returns how many scripts were refreshed.
    pub async fn update_modified_scripts(self: &Arc<Self>) -> usize {
        let candidates: Vec<(ScriptId, PathBuf, String)> = self
            .registry
            .lock()
            .scripts
            .iter()
            .map(|s| (s.id.clone(), self.script_path(s), s.source_digest.clone()))
            .collect();

        let fs = Arc::clone(&self.fs);
        let bodies = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .map(|(id, path, digest)| {
                    let body = fs.read(&path);
                    (id, path, digest, body)
                })
                .collect::<Vec<_>>()
        })
        .await;

        let bodies = match bodies {
            Ok(bodies) => bodies,
            Err(e) => {
                warn!("Script refresh task failed: {}", e);
                return 0;
            }
        };

        let mut events = Vec::new();
        for (id, path, digest, body) in bodies {
            let body = match body {
                Ok(Some(body)) => body,
                Ok(None) => {
                    debug!(script = %id, path = %path.display(), "Script body missing");
                    continue;
                }
                Err(e) => {
                    warn!(script = %id, path = %path.display(), "Failed to read script: {}", e);
                    continue;
                }
            };

            let deferred = self.deferred_refresh.lock().contains(&id);
            if !deferred && hash::digest(&body) == digest {
                continue;
            }
            if self.is_injecting(&id) {
                debug!(script = %id, "Script is executing, deferring refresh");
                self.deferred_refresh.lock().insert(id);
                continue;
            }
            self.deferred_refresh.lock().remove(&id);

            let parsed = match Script::parse(&body, None) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(script = %id, "Modified script no longer parses: {}", e);
                    continue;
                }
            };

            let mut registry = self.registry.lock();
            if let Some(script) = registry.scripts.iter_mut().find(|s| s.id == id) {
                script.merge_metadata(parsed);
                debug!(script = %id, "Refreshed modified script");
                events.push(ConfigEvent::new(
                    EventKind::Modified,
                    Some(script.clone()),
                    Value::Null,
                ));
            }
        }

        let refreshed = events.len();
        if refreshed > 0 {
            self.commit(events);
        }
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::fs::tests::CountingFs;
    use super::*;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    fn source(name: &str, extra: &str) -> String {
        format!(
            "// ==UserScript==\n// @name {}\n// @namespace test\n// @include http://example.com/*\n{}// ==/UserScript==\nvoid 0;\n",
            name, extra
        )
    }

    fn id(name: &str) -> ScriptId {
        ScriptId::new(format!("{}@test", name))
    }

    async fn open(dir: &Path) -> (Arc<ConfigStore>, Arc<CountingFs>) {
        let fs = Arc::new(CountingFs::default());
        let store = ConfigStore::load(ProfilePaths::new(dir), fs.clone())
            .await
            .unwrap();
        (store, fs)
    }

    fn record(store: &ConfigStore) -> Arc<Mutex<Vec<EventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(move |event| {
            sink.lock().push(event.kind);
            Ok(())
        });
        seen
    }

    fn ids_unique(store: &ConfigStore) -> bool {
        let scripts = store.scripts();
        let ids: HashSet<_> = scripts.iter().map(|s| &s.id).collect();
        ids.len() == scripts.len()
    }

    #[tokio::test]
    async fn test_install_update_edit_keep_ids_unique() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;
        let events = record(&store);

        store.install_source(&source("A", ""), None).await.unwrap();
        store.install_source(&source("B", ""), None).await.unwrap();
        store.set_enabled(&id("A"), false).unwrap();
        assert!(ids_unique(&store));

        let reinstalled = store
            .install_source(&source("A", "// @description newer\n"), None)
            .await
            .unwrap();
        assert_eq!(reinstalled.description, "newer");
        assert!(!reinstalled.enabled);
        assert_eq!(reinstalled.filename, "a.user.js");
        assert_eq!(store.scripts().len(), 2);
        assert!(ids_unique(&store));

        let edited = store
            .edit(&id("B"), &source("Renamed", "// @id other\n"))
            .await
            .unwrap();
        assert_eq!(edited.id, id("B"));
        assert_eq!(edited.name, "Renamed");
        assert!(ids_unique(&store));

        assert!(store.finalize_uninstall(&id("A")));
        assert!(ids_unique(&store));
        assert_eq!(
            *events.lock(),
            vec![
                EventKind::Installed,
                EventKind::Installed,
                EventKind::EditEnabled,
                EventKind::Updated,
                EventKind::Edited,
                EventKind::Removed,
            ]
        );
        store.flush().await;
    }

    #[tokio::test]
    async fn test_filenames_are_unique() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;

        let first = store
            .install_source(&source("Same Name", "// @id one\n"), None)
            .await
            .unwrap();
        let second = store
            .install_source(&source("Same Name", "// @id two\n"), None)
            .await
            .unwrap();

        assert_eq!(first.filename, "same_name.user.js");
        assert_eq!(second.filename, "same_name-2.user.js");
        assert_eq!(store.read_source(&second).unwrap(), source("Same Name", "// @id two\n"));
        store.flush().await;
    }

    #[tokio::test]
    async fn test_round_trip() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;

        store
            .install_source(
                &source("A", "// @priority 10\n// @delay 500\n// @run-at document-idle\n"),
                None,
            )
            .await
            .unwrap();
        store
            .install_source(
                &source("B", "// @noframes\n// @match *://*.example.org/*\n"),
                Some("http://userscripts.org/scripts/source/42.user.js"),
            )
            .await
            .unwrap();
        store.install_source(&source("C", ""), None).await.unwrap();
        store.apply_block_check(|s| s.name == "B");
        store.queue_uninstall(&id("C")).unwrap();
        store.add_exclude("http://bank.example/*").unwrap();
        store.add_exclude("/secret/i").unwrap();
        store.flush().await;

        let before = store.snapshot();
        let (reloaded, _) = open(temp.path()).await;
        assert_eq!(reloaded.snapshot(), before);
        assert!(reloaded.get(&id("B")).unwrap().blocked);
        assert!(reloaded.get(&id("C")).unwrap().needs_uninstall);
    }

    #[tokio::test]
    async fn test_finalize_twice_is_noop() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;
        store.install_source(&source("A", ""), None).await.unwrap();
        let events = record(&store);

        store.queue_uninstall(&id("A")).unwrap();
        assert!(store.finalize_uninstall(&id("A")));
        assert!(!store.finalize_uninstall(&id("A")));

        assert_eq!(
            *events.lock(),
            vec![EventKind::UninstallQueued, EventKind::Removed]
        );
        assert!(store.scripts().is_empty());
        store.flush().await;
    }

    #[tokio::test]
    async fn test_uninstall_cancel_restores_enabled() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;
        store.install_source(&source("A", ""), None).await.unwrap();
        store.install_source(&source("B", ""), None).await.unwrap();
        store.set_enabled(&id("B"), false).unwrap();

        store.queue_uninstall(&id("A")).unwrap();
        store.queue_uninstall(&id("B")).unwrap();
        assert!(!store.get(&id("A")).unwrap().enabled);
        assert!(store.matching_scripts("http://example.com/", true).is_empty());

        store.cancel_uninstall(&id("A")).unwrap();
        store.cancel_uninstall(&id("B")).unwrap();
        assert!(store.get(&id("A")).unwrap().enabled);
        assert!(!store.get(&id("B")).unwrap().enabled);

        store.queue_uninstall(&id("A")).unwrap();
        assert_eq!(store.finalize_pending_uninstalls(), 1);
        assert_eq!(store.scripts().len(), 1);
        store.flush().await;
    }

    #[tokio::test]
    async fn test_save_coalescing() {
        let temp = TempDir::new().unwrap();
        let (store, fs) = open(temp.path()).await;
        store.install_source(&source("A", ""), None).await.unwrap();
        store.flush().await;
        fs.writes.lock().clear();
        *fs.write_delay.lock() = Some(Duration::from_millis(50));

        store.set_enabled(&id("A"), false).unwrap();
        tokio::task::yield_now().await;
        for i in 0..5 {
            store.set_enabled(&id("A"), i % 2 == 0).unwrap();
        }
        assert_eq!(store.save_state(), SaveState::InFlightWithPending);

        store.flush().await;
        assert_eq!(store.save_state(), SaveState::Idle);
        assert_eq!(fs.writes_to(persist::REGISTRY_TMP_FILE), 2);

        let (reloaded, _) = open(temp.path()).await;
        assert_eq!(reloaded.snapshot(), store.snapshot());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_memory_and_retries() {
        let temp = TempDir::new().unwrap();
        let (store, fs) = open(temp.path()).await;
        store.install_source(&source("A", ""), None).await.unwrap();
        store.flush().await;

        fs.fail_writes.store(true, Ordering::SeqCst);
        store.set_enabled(&id("A"), false).unwrap();
        store.flush().await;
        assert!(!store.get(&id("A")).unwrap().enabled);

        fs.fail_writes.store(false, Ordering::SeqCst);
        store.add_exclude("http://x/*").unwrap();
        store.flush().await;

        let (reloaded, _) = open(temp.path()).await;
        assert!(!reloaded.get(&id("A")).unwrap().enabled);
        assert_eq!(reloaded.excludes().len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_xml_is_migrated() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(persist::LEGACY_XML_REGISTRY_FILE),
            r#"<UserScriptConfig>
  <Script name="Old" namespace="ns" filename="old.user.js" enabled="true">
    <Include>http://example.com/*</Include>
  </Script>
  <Exclude>http://bank.example/*</Exclude>
</UserScriptConfig>"#,
        )
        .unwrap();

        let (store, fs) = open(temp.path()).await;
        assert_eq!(store.scripts().len(), 1);
        assert_eq!(store.excludes().len(), 1);
        assert_ne!(store.save_state(), SaveState::Idle);

        store.flush().await;
        assert_eq!(fs.writes_to(persist::REGISTRY_TMP_FILE), 1);
        assert!(temp.path().join(persist::REGISTRY_FILE).exists());
    }

    #[tokio::test]
    async fn test_interrupted_save_is_recovered_without_writing() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(persist::REGISTRY_TMP_FILE),
            r#"{"excludes":["http://a/*"],"scripts":[]}"#,
        )
        .unwrap();

        let (store, fs) = open(temp.path()).await;
        assert_eq!(store.excludes().len(), 1);
        assert_eq!(store.save_state(), SaveState::Idle);
        assert_eq!(fs.write_count(), 0);
        assert_eq!(fs.renames.load(Ordering::SeqCst), 1);
        assert!(temp.path().join(persist::REGISTRY_FILE).exists());
    }

    #[tokio::test]
    async fn test_disabled_blocked_and_excluded_never_match() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;
        store.install_source(&source("A", ""), None).await.unwrap();
        store.install_source(&source("Top", "// @noframes\n"), None).await.unwrap();
        let url = "http://example.com/page";

        assert_eq!(store.matching_scripts(url, true).len(), 2);
        assert_eq!(store.matching_scripts(url, false).len(), 1);

        store.set_enabled(&id("A"), false).unwrap();
        assert!(!store.matches(&id("A"), url, true));

        store.set_enabled(&id("A"), true).unwrap();
        store.apply_block_check(|s| s.id == id("A"));
        assert!(!store.matches(&id("A"), url, true));
        assert!(store.matches(&id("Top"), url, true));

        store.add_exclude("http://example.com/*").unwrap();
        assert!(store.is_url_excluded(url));
        assert!(store.matching_scripts(url, true).is_empty());
        store.flush().await;
    }

    #[tokio::test]
    async fn test_bad_exclude_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;
        store.add_exclude("http://a/*").unwrap();

        assert!(matches!(store.add_exclude("/(/"), Err(KeeperError::Pattern(_))));
        assert!(store.set_excludes(["http://b/*", "/[/"]).is_err());
        assert_eq!(store.excludes().len(), 1);
        assert!(store.remove_exclude("http://a/*"));
        assert!(!store.remove_exclude("http://a/*"));
        store.flush().await;
    }

    #[tokio::test]
    async fn test_move_clamps_and_persists() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;
        store.install_source(&source("A", "// @priority 10\n"), None).await.unwrap();
        store.install_source(&source("B", "// @priority 5\n"), None).await.unwrap();
        store.install_source(&source("C", ""), None).await.unwrap();

        store.move_script(&id("C"), -10).unwrap();
        let order: Vec<_> = store.scripts().into_iter().map(|s| s.name).collect();
        assert_eq!(order, vec!["C", "A", "B"]);

        store.move_script(&id("A"), 10).unwrap();
        store.sort_scripts();
        let order: Vec<_> = store.scripts().into_iter().map(|s| s.name).collect();
        assert_eq!(order, vec!["C", "B", "A"]);
        store.flush().await;

        let (reloaded, _) = open(temp.path()).await;
        let order: Vec<_> = reloaded.scripts().into_iter().map(|s| s.name).collect();
        assert_eq!(order, vec!["C", "B", "A"]);
    }

    #[tokio::test]
    async fn test_move_by_extreme_deltas_saturates() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;
        store.install_source(&source("A", ""), None).await.unwrap();
        store.install_source(&source("B", ""), None).await.unwrap();

        store.move_script(&id("B"), isize::MAX).unwrap();
        let order: Vec<_> = store.scripts().into_iter().map(|s| s.name).collect();
        assert_eq!(order, vec!["A", "B"]);

        store.move_script(&id("B"), isize::MIN).unwrap();
        let order: Vec<_> = store.scripts().into_iter().map(|s| s.name).collect();
        assert_eq!(order, vec!["B", "A"]);

        store.move_script(&id("B"), isize::MIN).unwrap();
        store.move_script(&id("A"), isize::MIN).unwrap();
        let order: Vec<_> = store.scripts().into_iter().map(|s| s.name).collect();
        assert_eq!(order, vec!["A", "B"]);
        store.flush().await;
    }

    #[tokio::test]
    async fn test_modified_scripts_refresh_after_injection() {
        let temp = TempDir::new().unwrap();
        let (store, _) = open(temp.path()).await;
        let script = store.install_source(&source("A", ""), None).await.unwrap();
        let events = record(&store);

        assert_eq!(store.update_modified_scripts().await, 0);

        let guard = store.injection_guard(&script.id);
        std::fs::write(
            store.script_path(&script),
            source("A", "// @description changed\n"),
        )
        .unwrap();
        assert_eq!(store.update_modified_scripts().await, 0);
        drop(guard);

        assert_eq!(store.update_modified_scripts().await, 1);
        assert_eq!(store.get(&script.id).unwrap().description, "changed");
        assert_eq!(*events.lock(), vec![EventKind::Modified]);
        assert_eq!(store.update_modified_scripts().await, 0);
        store.flush().await;
    }
}
