//! Restart marker persistence backends.
//!
//! The [`MarkerStore`] trait is a key/value contract: one opaque string per
//! task key. Implementations:
//!
//! - **PostgreSQL**: `PgMarkerStore` in `db.rs`, a row per task in Tier1
//! - **File**: [`FileMarkerStore`], one file per task
//! - **Memory**: [`MemoryMarkerStore`], for tests and single-shot runs

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, TierError};

/// Trait for restart marker persistence backends.
///
/// Implementations must be `Send + Sync` so a store can be shared between the
/// mover and receiver tasks.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Read the stored marker for `task`, or `None` if never written.
    async fn load(&self, task: &str) -> Result<Option<String>>;

    /// Replace the stored marker for `task`.
    async fn save(&self, task: &str, marker: &str) -> Result<()>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// Markers stored as `<dir>/<task>.marker`.
pub struct FileMarkerStore {
    dir: PathBuf,
}

impl FileMarkerStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, task: &str) -> Result<PathBuf> {
        if task.is_empty() || task.contains(['/', '\\', '.']) {
            return Err(TierError::Marker(format!("Invalid task key: {:?}", task)));
        }
        Ok(self.dir.join(format!("{}.marker", task)))
    }
}

#[async_trait]
impl MarkerStore for FileMarkerStore {
    async fn load(&self, task: &str) -> Result<Option<String>> {
        let path = self.path_for(task)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, task: &str, marker: &str) -> Result<()> {
        let path = self.path_for(task)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, marker).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

/// Markers held in process memory only.
#[derive(Default)]
pub struct MemoryMarkerStore {
    markers: Mutex<HashMap<String, String>>,
    fail_saves: std::sync::atomic::AtomicUsize,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail.
    pub fn fail_next_saves(&self, n: usize) {
        self.fail_saves
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.markers
            .lock()
            .map_err(|_| TierError::Marker("marker map poisoned".into()))
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn load(&self, task: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(task).cloned())
    }

    async fn save(&self, task: &str, marker: &str) -> Result<()> {
        use std::sync::atomic::Ordering;
        let remaining = self.fail_saves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_saves.store(remaining - 1, Ordering::SeqCst);
            return Err(TierError::Marker("injected save failure".into()));
        }
        self.lock()?.insert(task.to_string(), marker.to_string());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
