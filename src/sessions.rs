//! Session-record persistence.
//!
//! One small JSON object `{channel: session_id}` on disk. It is read once at
//! daemon start to seed resume attempts and rewritten in full after every
//! captured identifier. Missing or corrupt content is tolerated as empty; a
//! failed write is logged and never propagated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Shared map of channel → last captured agent session identifier.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    map: RwLock<HashMap<String, String>>,
}

impl SessionStore {
    /// Load the record file, treating a missing or unparsable file as empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(map) => map,
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "session record unparsable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            inner: Arc::new(Inner {
                path,
                map: RwLock::new(map),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn get(&self, channel: &str) -> Option<String> {
        self.inner
            .map
            .read()
            .ok()
            .and_then(|map| map.get(channel).cloned())
    }

    /// Every channel with a persisted identifier.
    pub fn channels(&self) -> Vec<String> {
        self.inner
            .map
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Record an identifier and rewrite the file. Best effort: a write
    /// failure is logged, the in-memory map is still updated.
    pub fn set(&self, channel: &str, session_id: &str) {
        {
            let Ok(mut map) = self.inner.map.write() else {
                return;
            };
            if map.get(channel).map(String::as_str) == Some(session_id) {
                return;
            }
            map.insert(channel.to_string(), session_id.to_string());
        }
        if let Err(error) = self.persist() {
            tracing::warn!(path = %self.inner.path.display(), %error, "failed to persist session record");
        }
    }

    /// Write the full document to a sibling temp file and atomically rename,
    /// so a torn write cannot lose the prior contents.
    fn persist(&self) -> std::io::Result<()> {
        let json = {
            let map = self
                .inner
                .map
                .read()
                .map_err(|_| std::io::Error::other("session map poisoned"))?;
            serde_json::to_string_pretty(&*map)?
        };

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.inner.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.inner.path)
    }
}
