//! Scriptkeeper - userscript registry, injection scheduler and sandbox
//! provisioner.
//!
//! Scriptkeeper decides which installed userscripts apply to a navigated
//! document, when in the document's load they run, and what isolated scope
//! they run in. It also keeps the script registry on disk, saving it
//! atomically however many changes arrive at once.
//!
//! # Architecture
//!
//! The library is organized into these main modules:
//!
//! - [`store`] - The script registry, its persistence and change events
//! - [`injection`] - Per-document scheduling of run-at buckets
//! - [`sandbox`] - Isolated scopes and the capabilities granted to scripts
//! - [`blocklist`] - Remote list of known-bad scripts
//! - [`catalog`] - userscripts.org metadata for catalog scripts
//! - [`script`] and [`pattern`] - Script metadata and URL matching
//! - [`service`] - Everything above wired together for a browser host
//!
//! Script evaluation, tabs, files and the network are reached through the
//! [`ScriptEngine`], [`Host`], [`FileSystem`](store::FileSystem) and
//! [`Fetcher`] traits.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use scriptkeeper::{DocumentId, KeeperConfig, Navigation, Scriptkeeper, Settings};
//!
//! let settings = Arc::new(Settings::load(scriptkeeper::Preferences::config_path()));
//! let keeper = Scriptkeeper::start(KeeperConfig::new(settings)).await?;
//!
//! keeper.document_ready(Navigation::new(DocumentId(1), "https://example.com/")).await;
//! keeper.content_loaded(DocumentId(1));
//! ```

pub mod blocklist;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod injection;
pub mod pattern;
pub mod sandbox;
pub mod script;
pub mod service;
pub mod store;

#[cfg(feature = "cli")]
pub mod cli;

// Re-export commonly used types for convenience
pub use config::{Preferences, Settings};
pub use error::{KeeperError, KeeperResult};
pub use fetch::{Fetcher, HttpFetcher};
pub use injection::{DocumentId, Injector, Navigation, ReadyState};
pub use sandbox::{BatchReport, Host, Sandbox, ScriptEngine};
pub use script::{RunAt, Script, ScriptId};
pub use service::{KeeperConfig, Scriptkeeper};
pub use store::{ConfigEvent, ConfigStore, EventKind};
