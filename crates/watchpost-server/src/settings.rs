use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::debug;

/// Application settings as seen by the control plane. The desktop application
/// owns the data; the server reads sections and applies partial updates.
pub trait SettingsStore: Send + Sync {
    /// Returns one top-level section, or `None` if it is absent.
    fn section(&self, name: &str) -> Result<Option<Value>>;

    /// Returns the whole settings document.
    fn snapshot(&self) -> Result<Value>;

    /// Merges `patch` into the document, replacing top-level keys.
    fn update(&self, patch: Map<String, Value>) -> Result<()>;
}

/// Settings persisted as a single pretty-printed JSON object on disk.
/// A missing file reads as an empty object.
pub struct JsonSettingsStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "settings file absent, using empty document");
            return Ok(Map::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read settings file {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str(&raw).context("parse settings file")? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("settings root must be a JSON object, found {}", kind(&other)),
        }
    }
}

impl SettingsStore for JsonSettingsStore {
    fn section(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.read_document()?.remove(name))
    }

    fn snapshot(&self) -> Result<Value> {
        Ok(Value::Object(self.read_document()?))
    }

    fn update(&self, patch: Map<String, Value>) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        let mut doc = self.read_document()?;
        for (k, v) in patch {
            doc.insert(k, v);
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("create settings dir")?;
            }
        }
        let body = serde_json::to_string_pretty(&Value::Object(doc)).context("encode settings")?;
        std::fs::write(&self.path, body)
            .with_context(|| format!("write settings file {}", self.path.display()))
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
