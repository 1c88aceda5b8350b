use std::{fs, io, path::PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::Site;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache file {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persists the last fetched site collection and when it was refreshed.
pub trait SiteStore: Send + Sync {
    fn load_sites(&self) -> Result<Option<Vec<Site>>, StoreError>;

    /// Stores `sites` and records the current time as the refresh time.
    fn save_sites(&self, sites: &[Site]) -> Result<(), StoreError>;

    fn last_refreshed(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    refreshed_at: Option<DateTime<Utc>>,
    sites: Vec<Site>,
}

/// Stores the collection as one JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<Option<CacheDocument>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SiteStore for JsonFileStore {
    fn load_sites(&self) -> Result<Option<Vec<Site>>, StoreError> {
        Ok(self.read()?.map(|doc| doc.sites))
    }

    fn save_sites(&self, sites: &[Site]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let doc = CacheDocument {
            refreshed_at: Some(Utc::now()),
            sites: sites.to_vec(),
        };
        let json = serde_json::to_string_pretty(&doc).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        // Write then rename so a crash never leaves a half-written cache behind.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        Ok(())
    }

    fn last_refreshed(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.read()?.and_then(|doc| doc.refreshed_at))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sites: Option<Vec<Site>>,
    refreshed_at: Option<DateTime<Utc>>,
    saves: usize,
}

/// In-process store, handy for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store already holding `sites`, refreshed at `refreshed_at`.
    pub fn seeded(sites: Vec<Site>, refreshed_at: Option<DateTime<Utc>>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                sites: Some(sites),
                refreshed_at,
                saves: 0,
            }),
        }
    }

    /// How many times `save_sites` has been called.
    pub fn save_count(&self) -> usize {
        self.state.lock().saves
    }
}

impl SiteStore for MemoryStore {
    fn load_sites(&self) -> Result<Option<Vec<Site>>, StoreError> {
        Ok(self.state.lock().sites.clone())
    }

    fn save_sites(&self, sites: &[Site]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.sites = Some(sites.to_vec());
        state.refreshed_at = Some(Utc::now());
        state.saves += 1;
        Ok(())
    }

    fn last_refreshed(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state.lock().refreshed_at)
    }
}
