//! Disk-backed overflow queue for transmissions.
//!
//! Every transmission is one file named after its id. Files are written under
//! the temporary extension and renamed once closed; a reader claims a file by
//! renaming it back to the temporary extension, so a successful rename is the
//! only ownership a process or thread ever holds over a file.

use std::{
    collections::VecDeque,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{Transmission, TransmissionId};
use crate::{
    config::DEFAULT_STORAGE_CAPACITY,
    diagnostics::{DiagnosticEvent, SharedDiagnostics},
    platform::FolderProvider,
};

pub const PERMANENT_EXTENSION: &str = "trn";
pub const TEMPORARY_EXTENSION: &str = "tmp";
/// Stored transmissions older than this are deleted instead of sent.
pub const RETENTION: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed encoding transmission: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Serialize, Deserialize)]
struct StoredTransmission {
    id: TransmissionId,
    endpoint: String,
    content_type: String,
    content_encoding: String,
    created_at: DateTime<Utc>,
    content: Vec<u8>,
}

impl From<&Transmission> for StoredTransmission {
    fn from(transmission: &Transmission) -> Self {
        Self {
            id: transmission.id(),
            endpoint: transmission.endpoint().to_owned(),
            content_type: transmission.content_type().to_owned(),
            content_encoding: transmission.content_encoding().to_owned(),
            created_at: transmission.created_at(),
            content: transmission.content().to_vec(),
        }
    }
}

impl From<StoredTransmission> for Transmission {
    fn from(stored: StoredTransmission) -> Self {
        Transmission::from_parts(
            stored.id,
            stored.endpoint,
            Bytes::from(stored.content),
            stored.content_type,
            stored.content_encoding,
            stored.created_at,
        )
    }
}

pub struct TransmissionStorage {
    folder_provider: Arc<dyn FolderProvider>,
    capacity: AtomicU64,
    size: OnceLock<AtomicU64>,
    listing: Mutex<VecDeque<PathBuf>>,
    diagnostics: SharedDiagnostics,
}

impl TransmissionStorage {
    pub fn new(folder_provider: Arc<dyn FolderProvider>, diagnostics: SharedDiagnostics) -> Self {
        Self {
            folder_provider,
            capacity: AtomicU64::new(DEFAULT_STORAGE_CAPACITY),
            size: OnceLock::new(),
            listing: Mutex::new(VecDeque::new()),
            diagnostics,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    /// Bytes currently stored. Computed from the folder on first use.
    pub fn size(&self) -> u64 {
        match self.folder_provider.folder() {
            Some(folder) => self.size_counter(&folder).load(Ordering::SeqCst),
            None => 0,
        }
    }

    fn size_counter(&self, folder: &Path) -> &AtomicU64 {
        self.size
            .get_or_init(|| AtomicU64::new(folder_size(folder)))
    }

    fn release(&self, bytes: u64) {
        if let Some(size) = self.size.get() {
            let _ = size.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
        }
    }

    /// Persists the transmission the factory produces.
    ///
    /// Returns `false` when the folder is unavailable, the storage is full or
    /// the write fails. The factory is not invoked when the storage is
    /// already full.
    pub fn enqueue<F>(&self, factory: F) -> bool
    where
        F: FnOnce() -> Option<Transmission>,
    {
        let Some(folder) = self.folder_provider.folder() else {
            self.diagnostics.report(DiagnosticEvent::StorageUnavailable);
            return false;
        };
        let size = self.size_counter(&folder);
        let capacity = self.capacity();
        let current = size.load(Ordering::SeqCst);
        if current >= capacity {
            self.diagnostics.report(DiagnosticEvent::StorageFull {
                capacity,
                size: current,
            });
            return false;
        }

        let Some(transmission) = factory() else {
            return false;
        };
        let encoded = match bincode::serialize(&StoredTransmission::from(&transmission)) {
            Ok(encoded) => encoded,
            Err(error) => {
                self.diagnostics.report(DiagnosticEvent::StorageWriteFailed {
                    error: error.to_string(),
                });
                return false;
            }
        };

        let length = encoded.len() as u64;
        let reserved = size.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            current
                .checked_add(length)
                .filter(|total| *total <= capacity)
        });
        if let Err(current) = reserved {
            self.diagnostics.report(DiagnosticEvent::StorageFull {
                capacity,
                size: current,
            });
            return false;
        }

        match write_file(&folder, transmission.id(), &encoded) {
            Ok(path) => {
                tracing::trace!(?path, bytes = length, "Stored transmission");
                true
            }
            Err(error) => {
                self.release(length);
                self.diagnostics.report(DiagnosticEvent::StorageWriteFailed {
                    error: error.to_string(),
                });
                false
            }
        }
    }

    /// Loads and removes the oldest stored transmission.
    pub fn dequeue(&self) -> Option<Transmission> {
        let folder = self.folder_provider.folder()?;
        self.size_counter(&folder);

        let mut refreshed = false;
        loop {
            let candidate = self.listing.lock().pop_front();
            let path = match candidate {
                Some(path) => path,
                None if refreshed => return None,
                None => {
                    refreshed = true;
                    match self.scan(&folder) {
                        Ok(listing) => {
                            *self.listing.lock() = listing;
                            continue;
                        }
                        Err(error) => {
                            tracing::warn!(?folder, %error, "Failed listing transmission folder");
                            self.diagnostics.report(DiagnosticEvent::StorageUnavailable);
                            return None;
                        }
                    }
                }
            };

            if let Some(transmission) = self.load(&path) {
                return Some(transmission);
            }
        }
    }

    /// Claims, reads and deletes one file. `None` when the file was taken by
    /// someone else, could not be read or could not be decoded. Unreadable
    /// files are handed back under their permanent name.
    fn load(&self, path: &Path) -> Option<Transmission> {
        let claimed = path.with_extension(TEMPORARY_EXTENSION);
        if let Err(error) = fs::rename(path, &claimed) {
            match error.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {}
                _ => tracing::debug!(?path, %error, "Failed claiming transmission file"),
            }
            return None;
        }

        let contents = match fs::read(&claimed) {
            Ok(contents) => contents,
            Err(error) => {
                if let Err(error) = fs::rename(&claimed, path) {
                    tracing::error!(path = ?claimed, %error, "Failed releasing transmission file");
                }
                self.diagnostics.report(DiagnosticEvent::StorageReadFailed {
                    path: path.to_path_buf(),
                    error: error.to_string(),
                });
                return None;
            }
        };
        if let Err(error) = fs::remove_file(&claimed) {
            tracing::warn!(path = ?claimed, %error, "Failed deleting claimed transmission file");
        }
        self.release(contents.len() as u64);

        match bincode::deserialize::<StoredTransmission>(&contents) {
            Ok(stored) if !stored.content.is_empty() => Some(stored.into()),
            Ok(_) => None,
            Err(error) => {
                self.diagnostics.report(DiagnosticEvent::StorageFileCorrupt {
                    path: path.to_path_buf(),
                    error: error.to_string(),
                });
                None
            }
        }
    }

    /// Deliverable files, oldest first. Expired files are deleted on the way.
    fn scan(&self, folder: &Path) -> io::Result<VecDeque<PathBuf>> {
        let now = SystemTime::now();
        let mut files = Vec::new();
        for entry in fs::read_dir(folder)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(error) => {
                    tracing::debug!(%error, "Skipping unreadable folder entry");
                    continue;
                }
            };
            if path.extension().and_then(|ext| ext.to_str()) != Some(PERMANENT_EXTENSION) {
                continue;
            }
            let Some(created) = creation_time(&path) else {
                continue;
            };
            if now.duration_since(created).unwrap_or_default() > RETENTION {
                self.delete_expired(&path);
                continue;
            }
            files.push((created, path));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    fn delete_expired(&self, path: &Path) {
        let claimed = path.with_extension(TEMPORARY_EXTENSION);
        if fs::rename(path, &claimed).is_err() {
            return;
        }
        let length = fs::metadata(&claimed).map(|m| m.len()).unwrap_or_default();
        if fs::remove_file(&claimed).is_ok() {
            self.release(length);
            self.diagnostics.report(DiagnosticEvent::StorageFileExpired {
                path: path.to_path_buf(),
            });
        }
    }
}

fn file_path(folder: &Path, id: TransmissionId, extension: &str) -> PathBuf {
    folder.join(format!("{id}.{extension}"))
}

fn write_file(folder: &Path, id: TransmissionId, encoded: &[u8]) -> Result<PathBuf, StorageError> {
    let temporary = file_path(folder, id, TEMPORARY_EXTENSION);
    let permanent = file_path(folder, id, PERMANENT_EXTENSION);
    let written = (|| -> Result<(), StorageError> {
        let mut file = fs::File::create(&temporary)?;
        file.write_all(encoded)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temporary, &permanent)?;
        Ok(())
    })();
    if let Err(error) = written {
        let _ = fs::remove_file(&temporary);
        return Err(error);
    }
    Ok(permanent)
}

/// Creation time from the id in the file name, else the file's mtime.
fn creation_time(path: &Path) -> Option<SystemTime> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| Ulid::from_string(stem).ok())
        .map(|id| id.datetime())
        .or_else(|| fs::metadata(path).and_then(|m| m.modified()).ok())
}

fn folder_size(folder: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(folder) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.path().extension().and_then(|ext| ext.to_str()) == Some(PERMANENT_EXTENSION)
        })
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;
    use crate::{
        diagnostics::test::RecordingDiagnostics, platform::DirectoryFolderProvider,
        transmission::test_transmission,
    };

    struct NoFolder;

    impl FolderProvider for NoFolder {
        fn folder(&self) -> Option<PathBuf> {
            None
        }
    }

    fn storage_in(dir: &Path) -> (TransmissionStorage, Arc<RecordingDiagnostics>) {
        let diagnostics = RecordingDiagnostics::shared();
        let storage = TransmissionStorage::new(
            Arc::new(DirectoryFolderProvider::new(dir)),
            diagnostics.clone(),
        );
        (storage, diagnostics)
    }

    #[test]
    fn test_enqueue_dequeue_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage_in(dir.path());
        let transmission = test_transmission("{\"name\":\"a\"}");

        assert!(storage.enqueue(|| Some(transmission.clone())));
        assert!(storage.size() > 0);

        let loaded = storage.dequeue().unwrap();
        assert_eq!(loaded.endpoint(), transmission.endpoint());
        assert_eq!(loaded, transmission);
        assert_eq!(storage.size(), 0);
        assert!(storage.dequeue().is_none());
    }

    #[test]
    fn test_dequeue_returns_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage_in(dir.path());
        let first = test_transmission("first");
        std::thread::sleep(Duration::from_millis(2));
        let second = test_transmission("second");

        assert!(storage.enqueue(|| Some(second.clone())));
        assert!(storage.enqueue(|| Some(first.clone())));

        assert_eq!(storage.dequeue().unwrap().id(), first.id());
        assert_eq!(storage.dequeue().unwrap().id(), second.id());
    }

    #[test]
    fn test_oversized_transmission_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, diagnostics) = storage_in(dir.path());
        storage.set_capacity(64);

        let large = test_transmission(
            "{\"name\":\"a transmission that does not fit into sixty four bytes\"}",
        );
        assert!(!storage.enqueue(|| Some(large.clone())));
        assert_eq!(storage.size(), 0);
        assert_eq!(diagnostics.count("storage_full"), 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_full_storage_does_not_invoke_factory() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage_in(dir.path());
        assert!(storage.enqueue(|| Some(test_transmission("payload"))));
        let stored = storage.size();
        storage.set_capacity(stored);

        let invoked = AtomicBool::new(false);
        assert!(!storage.enqueue(|| {
            invoked.store(true, Ordering::SeqCst);
            Some(test_transmission("more"))
        }));
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(storage.size(), stored);
    }

    #[test]
    fn test_unavailable_folder() {
        let diagnostics = RecordingDiagnostics::shared();
        let storage = TransmissionStorage::new(Arc::new(NoFolder), diagnostics.clone());
        assert!(!storage.enqueue(|| Some(test_transmission("x"))));
        assert!(storage.dequeue().is_none());
        assert_eq!(storage.size(), 0);
        assert_eq!(diagnostics.count("storage_unavailable"), 1);
    }

    #[test]
    fn test_corrupt_file_is_deleted_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let corrupt = dir
            .path()
            .join(format!("{}.{PERMANENT_EXTENSION}", Ulid::new()));
        fs::write(&corrupt, b"definitely not bincode").unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let (storage, diagnostics) = storage_in(dir.path());
        let valid = test_transmission("valid");
        assert!(storage.enqueue(|| Some(valid.clone())));

        assert_eq!(storage.dequeue().unwrap().id(), valid.id());
        assert!(!corrupt.exists());
        assert_eq!(diagnostics.count("storage_file_corrupt"), 1);
        assert_eq!(storage.size(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_kept_for_later() {
        let dir = tempfile::tempdir().unwrap();
        // A directory claims fine but fails to read.
        let unreadable = dir
            .path()
            .join(format!("{}.{PERMANENT_EXTENSION}", Ulid::new()));
        fs::create_dir(&unreadable).unwrap();

        let (storage, diagnostics) = storage_in(dir.path());
        assert!(storage.dequeue().is_none());
        assert!(unreadable.is_dir());
        assert!(!unreadable.with_extension(TEMPORARY_EXTENSION).exists());
        assert_eq!(diagnostics.count("storage_read_failed"), 1);
        assert_eq!(diagnostics.count("storage_file_corrupt"), 0);
    }

    #[test]
    fn test_concurrent_enqueue_and_dequeue_keep_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage_in(dir.path());
        let one = bincode::serialize(&StoredTransmission::from(&test_transmission("payload")))
            .unwrap()
            .len() as u64;
        let capacity = 4 * one;
        storage.set_capacity(capacity);
        assert_eq!(storage.size(), 0);

        let producers = AtomicUsize::new(4);
        let stored = Mutex::new(Vec::new());
        let loaded = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let transmission = test_transmission("payload");
                        if storage.enqueue(|| Some(transmission.clone())) {
                            stored.lock().push(transmission.id());
                        }
                        assert!(storage.size() <= capacity);
                    }
                    producers.fetch_sub(1, Ordering::SeqCst);
                });
            }
            for _ in 0..2 {
                scope.spawn(|| loop {
                    match storage.dequeue() {
                        Some(transmission) => loaded.lock().push(transmission.id()),
                        None if producers.load(Ordering::SeqCst) == 0 => break,
                        None => std::thread::yield_now(),
                    }
                    assert!(storage.size() <= capacity);
                });
            }
        });
        while let Some(transmission) = storage.dequeue() {
            loaded.lock().push(transmission.id());
        }

        let mut stored = stored.into_inner();
        let mut loaded = loaded.into_inner();
        assert!(!stored.is_empty());
        stored.sort();
        loaded.sort();
        assert_eq!(loaded, stored);
        assert_eq!(storage.size(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_expired_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let old = SystemTime::now() - RETENTION - Duration::from_secs(60);
        let expired = dir.path().join(format!(
            "{}.{PERMANENT_EXTENSION}",
            Ulid::from_datetime(old)
        ));
        let encoded = bincode::serialize(&StoredTransmission::from(&test_transmission("old"))).unwrap();
        fs::write(&expired, encoded).unwrap();

        let (storage, diagnostics) = storage_in(dir.path());
        assert!(storage.size() > 0);
        assert!(storage.dequeue().is_none());
        assert!(!expired.exists());
        assert_eq!(storage.size(), 0);
        assert_eq!(diagnostics.count("storage_file_expired"), 1);
    }

    #[test]
    fn test_file_claimed_by_another_reader_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage_in(dir.path());
        let first = test_transmission("first");
        std::thread::sleep(Duration::from_millis(2));
        let second = test_transmission("second");
        assert!(storage.enqueue(|| Some(first.clone())));
        assert!(storage.enqueue(|| Some(second.clone())));

        // Fill the listing cache, then let a competing reader take the oldest.
        let (other, _) = storage_in(dir.path());
        *storage.listing.lock() = storage.scan(dir.path()).unwrap();
        assert_eq!(other.dequeue().unwrap().id(), first.id());

        assert_eq!(storage.dequeue().unwrap().id(), second.id());
        assert!(storage.dequeue().is_none());
    }

    #[test]
    fn test_existing_files_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (storage, _) = storage_in(dir.path());
            assert!(storage.enqueue(|| Some(test_transmission("persisted"))));
        }
        let (reopened, _) = storage_in(dir.path());
        assert!(reopened.size() > 0);
        assert!(reopened.dequeue().is_some());
    }
}
