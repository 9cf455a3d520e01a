//! Per-document state: timers, unloaders and pending run-at buckets.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::{DocumentId, ReadyState};
use crate::sandbox::Scope;
use crate::script::{RunAt, Script, ScriptId};

type Unloader = Box<dyn FnOnce() + Send>;

/// Owns everything registered for one document.
///
/// Timers are aborted and unloaders run exactly once, on the first
/// [`teardown`](Self::teardown). Anything registered after that is cancelled
/// (or run) on the spot.
pub struct DocumentLifetime {
    id: DocumentId,
    url: RwLock<String>,
    is_top_level: bool,
    runtime: Handle,
    closed: AtomicBool,
    timers: Mutex<Vec<AbortHandle>>,
    unloaders: Mutex<Vec<Unloader>>,
    /// Bodies read ahead for the scripts matched to this document.
    sources: Mutex<HashMap<ScriptId, Arc<str>>>,
}

impl DocumentLifetime {
    pub fn new(id: DocumentId, url: String, is_top_level: bool, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            id,
            url: RwLock::new(url),
            is_top_level,
            runtime,
            closed: AtomicBool::new(false),
            timers: Mutex::default(),
            unloaders: Mutex::default(),
            sources: Mutex::default(),
        })
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Effective URL, following redirects.
    pub fn url(&self) -> String {
        self.url.read().clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.write() = url.into();
    }

    pub fn is_top_level(&self) -> bool {
        self.is_top_level
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run `task` on the runtime until it finishes or the document closes.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock();
        if self.is_closed() {
            return;
        }
        timers.retain(|t| !t.is_finished());
        timers.push(self.runtime.spawn(task).abort_handle());
    }

    pub fn cache_source(&self, id: ScriptId, source: Arc<str>) {
        if !self.is_closed() {
            self.sources.lock().insert(id, source);
        }
    }

    pub fn cached_source(&self, id: &ScriptId) -> Option<Arc<str>> {
        self.sources.lock().get(id).cloned()
    }

    /// Timers that have neither finished nor been aborted.
    pub fn pending_tasks(&self) -> usize {
        self.timers.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Register `unload` to run at teardown.
    pub fn add_unloader(&self, unload: impl FnOnce() + Send + 'static) {
        let mut unloaders = self.unloaders.lock();
        if !self.is_closed() {
            unloaders.push(Box::new(unload));
            return;
        }
        drop(unloaders);
        unload();
    }

    /// Cancel timers and run unloaders, newest first.
    ///
    /// Returns `false` if the document was already torn down.
    pub fn teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let timers = std::mem::take(&mut *self.timers.lock());
        for timer in &timers {
            timer.abort();
        }

        self.sources.lock().clear();

        let unloaders = std::mem::take(&mut *self.unloaders.lock());
        for unload in unloaders.into_iter().rev() {
            if panic::catch_unwind(AssertUnwindSafe(unload)).is_err() {
                warn!(document = ?self.id, "Unloader panicked");
            }
        }

        debug!(document = ?self.id, timers = timers.len(), "Document torn down");
        true
    }
}

impl std::fmt::Debug for DocumentLifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentLifetime")
            .field("id", &self.id)
            .field("url", &*self.url.read())
            .field("is_top_level", &self.is_top_level)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Matched scripts waiting for their milestone, in priority order.
#[derive(Debug, Default)]
pub(crate) struct Buckets {
    pub start: Vec<Script>,
    pub end: Vec<Script>,
    pub idle: Vec<Script>,
    pub load: Vec<Script>,
}

impl Buckets {
    pub fn partition(scripts: Vec<Script>) -> Self {
        let mut buckets = Self::default();
        for script in scripts {
            match script.run_at {
                RunAt::DocumentStart => buckets.start.push(script),
                RunAt::DocumentEnd => buckets.end.push(script),
                RunAt::DocumentIdle => buckets.idle.push(script),
                RunAt::WindowLoad => buckets.load.push(script),
            }
        }
        buckets
    }
}

pub(crate) struct DocumentContext {
    pub lifetime: Arc<DocumentLifetime>,
    pub page: Arc<Scope>,
    /// Furthest milestone the document has reported.
    pub ready: ReadyState,
    /// Set once matching is done and `buckets` is filled.
    pub armed: bool,
    pub buckets: Buckets,
}

impl DocumentContext {
    pub fn new(lifetime: Arc<DocumentLifetime>, page: Arc<Scope>, ready: ReadyState) -> Self {
        Self {
            lifetime,
            page,
            ready,
            armed: false,
            buckets: Buckets::default(),
        }
    }

    pub fn advance(&mut self, ready: ReadyState) {
        self.ready = self.ready.max(ready);
    }
}
