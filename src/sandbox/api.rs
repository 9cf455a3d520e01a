//! The capability surface granted to scripts.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::logger::{LogLevel, ScriptLogger};
use super::storage::ScriptStorage;
use crate::fetch::{FetchError, Fetcher, HttpRequest, HttpResponse};
use crate::script::ScriptId;

/// Browser-side operations a script may ask the host for.
pub trait Host: Send + Sync {
    /// Open `url` in a new tab.
    fn open_in_tab(&self, url: &str, background: bool) -> Result<(), String>;
}

/// A [`Host`] without tabs; requests are logged and refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessHost;

impl Host for HeadlessHost {
    fn open_in_tab(&self, url: &str, _background: bool) -> Result<(), String> {
        tracing::info!(url, "Tab request ignored by headless host");
        Err("no tabs available".to_string())
    }
}

/// Every function a sandbox exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Log,
    Console,
    GetValue,
    SetValue,
    DeleteValue,
    ListValues,
    OpenInTab,
    XmlHttpRequest,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Log,
        Capability::Console,
        Capability::GetValue,
        Capability::SetValue,
        Capability::DeleteValue,
        Capability::ListValues,
        Capability::OpenInTab,
        Capability::XmlHttpRequest,
    ];

    /// Name the capability is bound under.
    pub fn name(self) -> &'static str {
        match self {
            Capability::Log => "GM_log",
            Capability::Console => "console",
            Capability::GetValue => "GM_getValue",
            Capability::SetValue => "GM_setValue",
            Capability::DeleteValue => "GM_deleteValue",
            Capability::ListValues => "GM_listValues",
            Capability::OpenInTab => "GM_openInTab",
            Capability::XmlHttpRequest => "GM_xmlhttpRequest",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn arg_str<'a>(args: &'a [Value], index: usize, capability: Capability) -> anyhow::Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("{} expects a string argument {}", capability, index + 1))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Capability implementations for one script in one document.
pub struct GmApi {
    script: ScriptId,
    logger: ScriptLogger,
    log_to_console: bool,
    storage: Arc<Mutex<ScriptStorage>>,
    fetcher: Arc<dyn Fetcher>,
    host: Arc<dyn Host>,
}

impl GmApi {
    pub fn new(
        script: ScriptId,
        logger: ScriptLogger,
        log_to_console: bool,
        storage: Arc<Mutex<ScriptStorage>>,
        fetcher: Arc<dyn Fetcher>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            script,
            logger,
            log_to_console,
            storage,
            fetcher,
            host,
        }
    }

    pub fn logger(&self) -> &ScriptLogger {
        &self.logger
    }

    /// `GM_log`. Always kept in the script's history; mirrored to the
    /// console only when console logging is on.
    pub fn log(&self, message: &str) {
        if self.log_to_console {
            self.logger.info(message);
        } else {
            self.logger.record(LogLevel::Info, message);
        }
    }

    pub fn console(&self, level: LogLevel, message: &str) {
        self.logger.log(level, message);
    }

    pub fn get_value(&self, key: &str, default: Option<Value>) -> Option<Value> {
        self.storage.lock().get(key).or(default)
    }

    pub fn set_value(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.storage.lock().set(key, value)
    }

    pub fn delete_value(&self, key: &str) -> anyhow::Result<()> {
        self.storage.lock().remove(key)
    }

    pub fn list_values(&self) -> Vec<String> {
        self.storage.lock().keys()
    }

    pub fn open_in_tab(&self, url: &str, background: bool) -> anyhow::Result<()> {
        self.host
            .open_in_tab(url, background)
            .map_err(|e| anyhow!("GM_openInTab from '{}' failed: {}", self.script, e))
    }

    /// `GM_xmlhttpRequest`. Cross-origin requests are allowed.
    pub async fn xmlhttp_request(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        self.fetcher.request(request).await
    }

    /// Call a synchronous capability with JSON arguments.
    pub fn invoke(&self, capability: Capability, args: &[Value]) -> anyhow::Result<Value> {
        match capability {
            Capability::Log => {
                let message: Vec<String> = args.iter().map(render).collect();
                self.log(&message.join(" "));
                Ok(Value::Null)
            }
            Capability::Console => {
                let level = match args.first().and_then(Value::as_str) {
                    Some("debug") => LogLevel::Debug,
                    Some("warn") => LogLevel::Warn,
                    Some("error") => LogLevel::Error,
                    _ => LogLevel::Info,
                };
                let message: Vec<String> = args.iter().skip(1).map(render).collect();
                self.console(level, &message.join(" "));
                Ok(Value::Null)
            }
            Capability::GetValue => {
                let key = arg_str(args, 0, capability)?;
                Ok(self
                    .get_value(key, args.get(1).cloned())
                    .unwrap_or(Value::Null))
            }
            Capability::SetValue => {
                let key = arg_str(args, 0, capability)?;
                self.set_value(key, args.get(1).cloned().unwrap_or(Value::Null))?;
                Ok(Value::Null)
            }
            Capability::DeleteValue => {
                self.delete_value(arg_str(args, 0, capability)?)?;
                Ok(Value::Null)
            }
            Capability::ListValues => Ok(json!(self.list_values())),
            Capability::OpenInTab => {
                let url = arg_str(args, 0, capability)?;
                let background = args.get(1).and_then(Value::as_bool).unwrap_or(false);
                self.open_in_tab(url, background)?;
                Ok(Value::Null)
            }
            Capability::XmlHttpRequest => {
                bail!("GM_xmlhttpRequest is asynchronous and cannot be invoked synchronously")
            }
        }
    }
}
