//! Sandbox provisioning.
//!
//! Every injected script runs in its own [`Sandbox`]: a [`Scope`] chained
//! onto the page's global scope, holding the granted [`Capability`] functions
//! and an `unsafeWindow` reference back to the page. The page never sees the
//! sandbox's own bindings.
//!
//! Evaluation itself is delegated to a [`ScriptEngine`]. Errors and panics
//! from one script are caught and reported; the rest of the batch still runs.

pub mod api;
pub mod logger;
pub mod scope;
pub mod storage;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub use api::{Capability, GmApi, HeadlessHost, Host};
pub use logger::{LogLevel, LogLine, ScriptLogger};
pub use scope::{Binding, Scope};
pub use storage::ScriptStorage;

use crate::config::Settings;
use crate::error::{KeeperError, KeeperResult};
use crate::fetch::Fetcher;
use crate::injection::{still_wanted, DocumentLifetime};
use crate::script::{Script, ScriptId};
use crate::store::{ConfigStore, EventKind};

/// Name under which the page's own scope is reachable from a sandbox.
pub const UNSAFE_WINDOW: &str = "unsafeWindow";

/// Evaluates script bodies.
pub trait ScriptEngine: Send + Sync {
    /// Run `source` with `sandbox` as its global scope.
    fn evaluate(&self, sandbox: &Sandbox, source: &str) -> anyhow::Result<()>;
}

/// Engine that evaluates nothing; used where only scheduling matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunEngine;

impl ScriptEngine for DryRunEngine {
    fn evaluate(&self, sandbox: &Sandbox, source: &str) -> anyhow::Result<()> {
        debug!(script = %sandbox.script().id, bytes = source.len(), "Dry run");
        Ok(())
    }
}

/// Execution scope of one script in one document.
pub struct Sandbox {
    script: Script,
    scope: Arc<Scope>,
    page: Arc<Scope>,
    api: Arc<GmApi>,
}

impl Sandbox {
    pub fn new(script: &Script, page: &Arc<Scope>, api: Arc<GmApi>) -> Self {
        let scope = Scope::child(format!("sandbox:{}", script.id), page);
        for capability in Capability::ALL {
            scope.define(capability.name(), Binding::Capability(capability));
        }
        scope.define(UNSAFE_WINDOW, Binding::Scope(Arc::clone(page)));
        scope.set_value(
            "GM_info",
            json!({
                "script": {
                    "name": script.name,
                    "namespace": script.namespace,
                    "description": script.description,
                    "version": script.version,
                    "runAt": script.run_at.as_str(),
                }
            }),
        );

        Self {
            script: script.clone(),
            scope,
            page: Arc::clone(page),
            api,
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn page(&self) -> &Arc<Scope> {
        &self.page
    }

    pub fn api(&self) -> &GmApi {
        &self.api
    }

    pub fn lookup(&self, name: &str) -> Option<Binding> {
        self.scope.lookup(name)
    }

    /// Call the function bound to `name`.
    pub fn call(&self, name: &str, args: &[Value]) -> anyhow::Result<Value> {
        match self.scope.lookup(name) {
            Some(Binding::Capability(capability)) => self.api.invoke(capability, args),
            Some(_) => Err(anyhow!("{} is not a function", name)),
            None => Err(anyhow!("{} is not defined", name)),
        }
    }
}

/// Outcome of injecting a batch of scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub executed: Vec<ScriptId>,
    /// Scheduled behind a `@delay` timer.
    pub delayed: Vec<ScriptId>,
    pub failed: Vec<(ScriptId, String)>,
}

impl BatchReport {
    pub fn merge(&mut self, other: BatchReport) {
        self.executed.extend(other.executed);
        self.delayed.extend(other.delayed);
        self.failed.extend(other.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.executed.is_empty() && self.delayed.is_empty() && self.failed.is_empty()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "script panicked".to_string())
}

/// Builds sandboxes and runs scripts in them.
pub struct Provisioner {
    store: Arc<ConfigStore>,
    settings: Arc<Settings>,
    engine: Arc<dyn ScriptEngine>,
    fetcher: Arc<dyn Fetcher>,
    host: Arc<dyn Host>,
    storages: Mutex<HashMap<ScriptId, Arc<Mutex<ScriptStorage>>>>,
    loggers: Mutex<HashMap<ScriptId, ScriptLogger>>,
}

impl Provisioner {
    pub fn new(
        store: Arc<ConfigStore>,
        settings: Arc<Settings>,
        engine: Arc<dyn ScriptEngine>,
        fetcher: Arc<dyn Fetcher>,
        host: Arc<dyn Host>,
    ) -> Arc<Self> {
        let provisioner = Arc::new(Self {
            store: Arc::clone(&store),
            settings,
            engine,
            fetcher,
            host,
            storages: Mutex::default(),
            loggers: Mutex::default(),
        });

        let weak = Arc::downgrade(&provisioner);
        store.subscribe(move |event| {
            if let (EventKind::Removed, Some(script)) = (event.kind, &event.script) {
                if let Some(provisioner) = weak.upgrade() {
                    provisioner.forget(&script.id);
                }
            }
            Ok(())
        });
        provisioner
    }

    /// Logger of a script that has run at least once.
    pub fn logger(&self, id: &ScriptId) -> Option<ScriptLogger> {
        self.loggers.lock().get(id).cloned()
    }

    /// Drop the storage handle and logger kept for `id`.
    pub fn forget(&self, id: &ScriptId) {
        let storage = self.storages.lock().remove(id);
        let logger = self.loggers.lock().remove(id);
        if storage.is_some() || logger.is_some() {
            debug!(script = %id, "Released sandbox state");
        }
    }

    /// Number of scripts with open storage.
    pub fn open_storages(&self) -> usize {
        self.storages.lock().len()
    }

    fn open_storage(&self, id: &ScriptId) -> ScriptStorage {
        ScriptStorage::new(id, self.store.paths().storage.clone(), self.store.file_system())
    }

    /// Read the bodies and open the storage of `scripts` ahead of execution.
    ///
    /// File access happens on the blocking pool. Bodies are kept on
    /// `lifetime`; anything missed here is read when the script runs.
    pub async fn prepare(self: &Arc<Self>, lifetime: &DocumentLifetime, scripts: &[Script]) {
        if scripts.is_empty() {
            return;
        }

        for (id, source) in self.store.read_sources(scripts.to_vec()).await {
            match source {
                Ok(source) => lifetime.cache_source(id, Arc::from(source)),
                Err(e) => debug!(script = %id, "Body not read ahead: {}", e),
            }
        }

        let unopened: Vec<ScriptId> = {
            let storages = self.storages.lock();
            scripts
                .iter()
                .filter(|s| !storages.contains_key(&s.id))
                .map(|s| s.id.clone())
                .collect()
        };
        if unopened.is_empty() {
            return;
        }
        let provisioner = Arc::clone(self);
        let opened = tokio::task::spawn_blocking(move || {
            unopened
                .into_iter()
                .map(|id| {
                    let storage = provisioner.open_storage(&id);
                    (id, storage)
                })
                .collect::<Vec<_>>()
        })
        .await;
        match opened {
            Ok(opened) => {
                let mut storages = self.storages.lock();
                for (id, storage) in opened {
                    storages
                        .entry(id)
                        .or_insert_with(|| Arc::new(Mutex::new(storage)));
                }
            }
            Err(e) => warn!("Storage open task failed: {}", e),
        }
    }

    fn api_for(&self, script: &Script) -> GmApi {
        let storage = self
            .storages
            .lock()
            .entry(script.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(self.open_storage(&script.id))))
            .clone();
        let logger = self
            .loggers
            .lock()
            .entry(script.id.clone())
            .or_insert_with(|| ScriptLogger::new(script))
            .clone();

        GmApi::new(
            script.id.clone(),
            logger,
            self.settings.get().injection.log_to_console,
            storage,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.host),
        )
    }

    /// Build a sandbox for `script` on `page`.
    pub fn sandbox(&self, script: &Script, page: &Arc<Scope>) -> Sandbox {
        Sandbox::new(script, page, Arc::new(self.api_for(script)))
    }

    /// Run one script now.
    ///
    /// The sandbox is emptied when the document is torn down.
    pub fn execute(
        &self,
        lifetime: &DocumentLifetime,
        page: &Arc<Scope>,
        script: &Script,
    ) -> KeeperResult<()> {
        let _running = self.store.injection_guard(&script.id);
        let source = match lifetime.cached_source(&script.id) {
            Some(source) => source,
            None => Arc::from(self.store.read_source(script)?),
        };
        let sandbox = self.sandbox(script, page);

        let scope = Arc::clone(sandbox.scope());
        lifetime.add_unloader(move || scope.clear());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine.evaluate(&sandbox, &source)
        }));

        let message = match outcome {
            Ok(Ok(())) => {
                debug!(script = %script.id, document = ?lifetime.id(), "Executed script");
                return Ok(());
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => panic_message(payload),
        };
        sandbox.api().logger().error(&message);
        Err(KeeperError::Execution {
            script: script.id.to_string(),
            message,
        })
    }

    /// Run `scripts` in order, each in its own sandbox.
    ///
    /// Scripts with a delay are put on a timer owned by `lifetime` and are
    /// checked again when it fires.
    pub fn inject(
        self: &Arc<Self>,
        lifetime: &Arc<DocumentLifetime>,
        page: &Arc<Scope>,
        scripts: &[Script],
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for script in scripts {
            if let Some(delay) = script.delay_ms {
                let provisioner = Arc::clone(self);
                let document = Arc::clone(lifetime);
                let page = Arc::clone(page);
                let script = script.clone();
                report.delayed.push(script.id.clone());

                lifetime.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let (store, settings) = (&provisioner.store, &provisioner.settings);
                    if !still_wanted(store, settings, &document, &script) {
                        return;
                    }
                    if let Err(e) = provisioner.execute(&document, &page, &script) {
                        warn!(script = %script.id, document = ?document.id(), "{}", e);
                    }
                });
                continue;
            }

            match self.execute(lifetime, page, script) {
                Ok(()) => report.executed.push(script.id.clone()),
                Err(e) => {
                    warn!(script = %script.id, document = ?lifetime.id(), "{}", e);
                    report.failed.push((script.id.clone(), e.to_string()));
                }
            }
        }

        report
    }
}
