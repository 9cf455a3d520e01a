//! Log lines written by scripts.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::script::{Script, ScriptId};

const HISTORY_LIMIT: usize = 200;

const TARGET: &str = "scriptkeeper::script";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Logger tagged with one script's identity.
///
/// Lines go to `tracing` on the `scriptkeeper::script` target and into a
/// short history shared by every clone.
#[derive(Debug, Clone)]
pub struct ScriptLogger {
    script: ScriptId,
    name: String,
    history: Arc<Mutex<VecDeque<LogLine>>>,
}

impl ScriptLogger {
    pub fn new(script: &Script) -> Self {
        Self {
            script: script.id.clone(),
            name: script.name.clone(),
            history: Arc::default(),
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let (script, name) = (&self.script, &self.name);
        match level {
            LogLevel::Debug => debug!(target: TARGET, %script, %name, "{}", message),
            LogLevel::Info => info!(target: TARGET, %script, %name, "{}", message),
            LogLevel::Warn => warn!(target: TARGET, %script, %name, "{}", message),
            LogLevel::Error => error!(target: TARGET, %script, %name, "{}", message),
        }
        self.record(level, message);
    }

    /// Keep a line in the history without emitting it.
    pub fn record(&self, level: LogLevel, message: &str) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(LogLine {
            at: Utc::now(),
            level,
            message: message.to_string(),
        });
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Most recent lines, oldest first.
    pub fn history(&self) -> Vec<LogLine> {
        self.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::tests::test_script;

    #[test]
    fn test_history_is_bounded() {
        let logger = ScriptLogger::new(&test_script("a", "*"));
        for i in 0..HISTORY_LIMIT + 5 {
            logger.info(&format!("line {}", i));
        }
        let history = logger.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].message, "line 5");
    }

    #[test]
    fn test_record_only_touches_history() {
        let logger = ScriptLogger::new(&test_script("a", "*"));
        logger.record(LogLevel::Warn, "quiet");
        let history = logger.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].level, LogLevel::Warn);
        assert_eq!(history[0].message, "quiet");
    }
}
