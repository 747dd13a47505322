// Lease store client
// A JSON file mapping namespace handles to allocated addresses. Every
// mutating call takes an exclusive flock on a sibling lock file for the
// duration of that call only, so concurrent invocations for distinct
// containers serialize cleanly without holding the lock across kernel work.

use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid datastore path")]
    InvalidPath,
    #[error("locking datastore: {0}")]
    Lock(String),
    #[error("reading datastore: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding datastore: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One lease: the address allocated to a handle plus opaque metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaseRecord {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

pub struct Store;

impl Store {
    /// Record a handle -> address association. Overwrites any existing
    /// record for the handle; a handle maps to at most one lease.
    pub fn add(
        &self,
        datastore: &str,
        handle: &str,
        ip: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        validate(datastore, handle)?;
        let _lock = FileLock::exclusive(datastore)?;

        let mut leases = read_leases(datastore)?;
        leases.insert(
            handle.to_string(),
            LeaseRecord {
                ip: ip.to_string(),
                metadata,
            },
        );
        write_leases(datastore, &leases)
    }

    /// Remove the record for a handle. Returns whether a record existed;
    /// deleting an absent handle is not an error.
    pub fn delete(&self, datastore: &str, handle: &str) -> Result<bool, StoreError> {
        validate(datastore, handle)?;
        let _lock = FileLock::exclusive(datastore)?;

        let mut leases = read_leases(datastore)?;
        let removed = leases.remove(handle).is_some();
        if removed {
            write_leases(datastore, &leases)?;
        }
        Ok(removed)
    }

    /// Look up the record for a handle, shared-locked.
    pub fn get(&self, datastore: &str, handle: &str) -> Result<Option<LeaseRecord>, StoreError> {
        validate(datastore, handle)?;
        let _lock = FileLock::shared(datastore)?;
        Ok(read_leases(datastore)?.remove(handle))
    }
}

fn validate(datastore: &str, handle: &str) -> Result<(), StoreError> {
    if datastore.is_empty() {
        return Err(StoreError::InvalidPath);
    }
    if handle.is_empty() {
        return Err(StoreError::InvalidHandle);
    }
    Ok(())
}

fn read_leases(datastore: &str) -> Result<HashMap<String, LeaseRecord>, StoreError> {
    match std::fs::read(datastore) {
        Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

fn write_leases(datastore: &str, leases: &HashMap<String, LeaseRecord>) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(leases)?;
    std::fs::write(datastore, bytes)?;
    Ok(())
}

/// Exclusive advisory lock on `<datastore>.lock`, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(datastore: &str) -> Result<Self, StoreError> {
        Self::acquire(datastore, FlockArg::LockExclusive)
    }

    fn shared(datastore: &str) -> Result<Self, StoreError> {
        Self::acquire(datastore, FlockArg::LockShared)
    }

    fn acquire(datastore: &str, arg: FlockArg) -> Result<Self, StoreError> {
        let lock_path = format!("{}.lock", datastore);
        if let Some(parent) = Path::new(&lock_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        flock(file.as_raw_fd(), arg).map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path(dir: &tempfile::TempDir) -> String {
        dir.path().join("store.json").to_str().unwrap().to_string()
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        Store
            .add(&path, "cni-4f12", "10.255.30.2", None)
            .unwrap();

        let record = Store.get(&path, "cni-4f12").unwrap().unwrap();
        assert_eq!(record.ip, "10.255.30.2");
        assert!(record.metadata.is_none());
    }

    #[test]
    fn add_overwrites_an_existing_lease() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        Store.add(&path, "cni-4f12", "10.255.30.2", None).unwrap();
        Store.add(&path, "cni-4f12", "10.255.30.9", None).unwrap();

        let record = Store.get(&path, "cni-4f12").unwrap().unwrap();
        assert_eq!(record.ip, "10.255.30.9");
    }

    #[test]
    fn delete_reports_whether_a_lease_existed() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        Store.add(&path, "cni-4f12", "10.255.30.2", None).unwrap();

        assert!(Store.delete(&path, "cni-4f12").unwrap());
        assert!(!Store.delete(&path, "cni-4f12").unwrap());
        assert!(Store.get(&path, "cni-4f12").unwrap().is_none());
    }

    #[test]
    fn delete_against_a_missing_datastore_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        assert!(!Store.delete(&path, "cni-4f12").unwrap());
    }

    #[test]
    fn empty_handle_and_path_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        assert!(matches!(
            Store.add(&path, "", "10.255.30.2", None),
            Err(StoreError::InvalidHandle)
        ));
        assert!(matches!(
            Store.add("", "cni-4f12", "10.255.30.2", None),
            Err(StoreError::InvalidPath)
        ));
    }

    #[test]
    fn metadata_survives_the_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        Store
            .add(
                &path,
                "cni-4f12",
                "10.255.30.2",
                Some(serde_json::json!({"app": "apricot"})),
            )
            .unwrap();

        let record = Store.get(&path, "cni-4f12").unwrap().unwrap();
        assert_eq!(record.metadata, Some(serde_json::json!({"app": "apricot"})));
    }

    #[test]
    fn concurrent_writers_do_not_corrupt_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let mut threads = Vec::new();
        for worker in 0..8 {
            let path = path.clone();
            threads.push(std::thread::spawn(move || {
                for round in 0..25 {
                    let handle = format!("cni-{}-{}", worker, round);
                    let ip = format!("10.255.30.{}", worker);
                    Store.add(&path, &handle, &ip, None).unwrap();
                    assert!(Store.delete(&path, &handle).unwrap());
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        // Every worker removed what it added; the file must parse and be
        // empty.
        for worker in 0..8 {
            for round in 0..25 {
                let handle = format!("cni-{}-{}", worker, round);
                assert!(Store.get(&path, &handle).unwrap().is_none());
            }
        }
    }
}
