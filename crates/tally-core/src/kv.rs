//! Small string key/value store persisted as one JSON document.
//!
//! One instance is installed per process with [`KvStore::install`] and then
//! handed to whoever needs it; the auth session of the REST backend lives
//! here, and the `kv` command exposes it directly.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::error::KvError;

static SHARED: OnceLock<Arc<KvStore>> = OnceLock::new();

#[derive(Debug)]
pub struct KvStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    /// Installs the process-wide store backed by `path`. Later calls return
    /// the instance from the first successful call and ignore their argument.
    pub fn install(path: &Path) -> Result<Arc<KvStore>, KvError> {
        if let Some(existing) = SHARED.get() {
            debug!(path = ?existing.path, "key/value store already installed");
            return Ok(Arc::clone(existing));
        }

        let opened = Arc::new(KvStore::open(path)?);
        Ok(Arc::clone(SHARED.get_or_init(|| opened)))
    }

    #[tracing::instrument(skip(path))]
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let entries = if path.exists() {
            let raw = fs::read_to_string(path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                match serde_json::from_str(&raw) {
                    Ok(entries) => entries,
                    Err(err) => {
                        let aside = path.with_extension("json.corrupt");
                        warn!(
                            path = %path.display(),
                            moved_to = %aside.display(),
                            error = %err,
                            "key/value file is not valid json; starting empty"
                        );
                        if let Err(err) = fs::rename(path, &aside) {
                            warn!(error = %err, "failed to move unreadable key/value file aside");
                        }
                        BTreeMap::new()
                    }
                }
            }
        } else {
            BTreeMap::new()
        };

        info!(
            path = %path.display(),
            entries = entries.len(),
            "opened key/value store"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: Mutex::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Unreadable state reads as absent.
    pub async fn get(&self, key: &str) -> Option<String> {
        let value = self.entries.lock().get(key).cloned();
        debug!(key, found = value.is_some(), "kv get");
        value
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(err) = self.persist(&entries) {
            error!(key, error = %err, "kv set failed");
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(err) = self.persist(&entries) {
            error!(key, error = %err, "kv delete failed");
            entries.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), KvError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        debug!(file = %path.display(), count = entries.len(), "saving key/value file atomically");

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, entries)?;
        temp.flush()?;
        temp.persist(path)
            .map_err(|err| KvError::Persist(format!("{}: {}", path.display(), err)))?;
        Ok(())
    }
}
