//! Directory-backed rendezvous store
//!
//! One file `<dir>/<name>.endpoint` per shared name, holding the JSON
//! [`EndpointRecord`]. Every read, publish and clear runs under an exclusive
//! advisory lock on `<dir>/<name>.lock`, so check-then-act sequences are
//! atomic across processes. Records are written to a unique temporary file
//! and renamed into place; a process dying mid-write never leaves a partial
//! record, and its lock is released by the OS.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fd_lock::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EndpointRecord, Publish, Rendezvous, RendezvousError};

/// File-based implementation of [`Rendezvous`]
///
/// Works across every process that can see `dir` and honors `flock`-style
/// advisory locks on it (local file systems).
#[derive(Debug, Clone)]
pub struct FileRendezvous {
    dir: PathBuf,
}

impl FileRendezvous {
    /// Store records under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store records under `THROTTLE_RENDEZVOUS_DIR`, or the system temp dir
    pub fn from_env() -> Self {
        match std::env::var_os("THROTTLE_RENDEZVOUS_DIR") {
            Some(dir) => Self::new(dir),
            None => Self::new(std::env::temp_dir()),
        }
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `name`
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.endpoint"))
    }

    /// Path of the lock file guarding the record for `name`
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Run `op` on the blocking pool while holding the lock for `name`
    async fn locked<T, F>(&self, name: &str, op: F) -> Result<T, RendezvousError>
    where
        T: Send + 'static,
        F: FnOnce(&Slot) -> Result<T, RendezvousError> + Send + 'static,
    {
        let dir = self.dir.clone();
        let slot = Slot {
            name: name.to_string(),
            record: self.record_path(name),
            lock: self.lock_path(name),
        };

        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&slot.lock)?;
            let mut lock = RwLock::new(file);
            let _guard = lock.write()?;
            op(&slot)
        })
        .await
        .map_err(|e| RendezvousError::Io(io::Error::other(e)))?
    }
}

/// Paths of one shared name; only touched with its lock held
struct Slot {
    name: String,
    record: PathBuf,
    lock: PathBuf,
}

impl Slot {
    /// Read and parse the record; a corrupt file is removed
    fn load(&self) -> Result<Option<EndpointRecord>, RendezvousError> {
        let contents = match fs::read_to_string(&self.record) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %self.record.display(), error = %e, "Removing corrupt rendezvous record");
                remove_if_present(&self.record)?;
                Ok(None)
            }
        }
    }

    /// Write `record` to a staged file, then rename it over the record
    fn store(&self, record: &EndpointRecord) -> Result<(), RendezvousError> {
        let contents = serde_json::to_vec(record)
            .map_err(|e| RendezvousError::Serialization(e.to_string()))?;
        let staged = self
            .record
            .with_file_name(format!(".{}.{}.tmp", self.name, Uuid::now_v7()));

        fs::write(&staged, contents)?;
        if let Err(e) = fs::rename(&staged, &self.record) {
            if let Err(cleanup) = remove_if_present(&staged) {
                warn!(path = %staged.display(), error = %cleanup, "Failed to remove staged record");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Rendezvous for FileRendezvous {
    async fn read(&self, name: &str) -> Result<Option<EndpointRecord>, RendezvousError> {
        self.locked(name, Slot::load).await
    }

    async fn publish_if_absent(
        &self,
        name: &str,
        record: &EndpointRecord,
    ) -> Result<Publish, RendezvousError> {
        let record = record.clone();
        self.locked(name, move |slot| {
            if let Some(existing) = slot.load()? {
                debug!(name = %slot.name, addr = %existing.addr, "Endpoint record already present");
                return Ok(Publish::Occupied(existing));
            }
            slot.store(&record)?;
            debug!(name = %slot.name, addr = %record.addr, "Published endpoint record");
            Ok(Publish::Published)
        })
        .await
    }

    async fn clear_if(
        &self,
        name: &str,
        expected: &EndpointRecord,
    ) -> Result<bool, RendezvousError> {
        let expected = expected.clone();
        self.locked(name, move |slot| match slot.load()? {
            Some(current) if current == expected => {
                remove_if_present(&slot.record)?;
                debug!(name = %slot.name, addr = %expected.addr, "Cleared endpoint record");
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
