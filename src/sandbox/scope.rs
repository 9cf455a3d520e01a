//! Name scopes with a configurable lookup chain.
//!
//! A page's global scope is a root [`Scope`]. Each sandbox is a child of it:
//! lookups that miss the sandbox fall through to the live page, while names
//! defined on the sandbox are invisible from the page.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::api::Capability;

/// What a name is bound to.
#[derive(Clone)]
pub enum Binding {
    Value(Value),
    /// A granted capability function.
    Capability(Capability),
    /// Another scope, e.g. `unsafeWindow`.
    Scope(Arc<Scope>),
}

impl Binding {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Binding::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Binding::Capability(capability) => {
                f.debug_tuple("Capability").field(capability).finish()
            }
            Binding::Scope(scope) => f.debug_tuple("Scope").field(&scope.label).finish(),
        }
    }
}

pub struct Scope {
    label: String,
    bindings: RwLock<HashMap<String, Binding>>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    /// A root scope, such as a page's global object.
    pub fn root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            bindings: RwLock::default(),
            parent: None,
        })
    }

    /// A new, empty scope that falls back to `parent` on lookup.
    pub fn child(label: impl Into<String>, parent: &Arc<Scope>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            bindings: RwLock::default(),
            parent: Some(Arc::clone(parent)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    /// Bind `name` on this scope, shadowing any binding further up the chain.
    pub fn define(&self, name: impl Into<String>, binding: Binding) {
        self.bindings.write().insert(name.into(), binding);
    }

    pub fn set_value(&self, name: impl Into<String>, value: Value) {
        self.define(name, Binding::Value(value));
    }

    pub fn remove(&self, name: &str) -> Option<Binding> {
        self.bindings.write().remove(name)
    }

    /// Resolve `name` along the chain.
    pub fn lookup(&self, name: &str) -> Option<Binding> {
        if let Some(binding) = self.bindings.read().get(name) {
            return Some(binding.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    pub fn lookup_own(&self, name: &str) -> Option<Binding> {
        self.bindings.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn own_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every own binding.
    pub fn clear(&self) {
        self.bindings.write().clear();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("label", &self.label)
            .field("names", &self.own_names())
            .field("parent", &self.parent.as_ref().map(|p| p.label.clone()))
            .finish()
    }
}
