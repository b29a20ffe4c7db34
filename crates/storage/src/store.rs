use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::blob::{BlobStore, FileBlobStore, MemoryBlobStore};
use crate::document::UserDocument;
use crate::StoreError;

pub type ListenerId = u64;
type Listener = Arc<dyn Fn(&UserDocument) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    entries: Vec<(ListenerId, Listener)>,
}

/// Whole-document store for user state.
///
/// Every read parses the backing blob afresh and every write replaces it, so
/// callers merge their change into a freshly read document (last write
/// wins). Subscribers hear about this store's own writes and, once
/// [`UserStateStore::watch_external_changes`] is running, about writes made
/// by other processes.
pub struct UserStateStore {
    blob: Box<dyn BlobStore>,
    listeners: Mutex<Listeners>,
    /// Bytes last written or observed, to tell external writes from our own.
    last_seen: Mutex<Option<Vec<u8>>>,
}

impl UserStateStore {
    pub fn new(blob: impl BlobStore + 'static) -> Self {
        Self {
            blob: Box::new(blob),
            listeners: Mutex::new(Listeners::default()),
            last_seen: Mutex::new(None),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(FileBlobStore::new(path))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBlobStore::new())
    }

    pub fn path(&self) -> Option<&Path> {
        self.blob.path()
    }

    pub fn read(&self) -> Result<UserDocument, StoreError> {
        Ok(self
            .blob
            .load()?
            .map(|bytes| UserDocument::parse_or_default(&bytes))
            .unwrap_or_default())
    }

    pub fn write(&self, document: &UserDocument) -> Result<(), StoreError> {
        let bytes = document.to_json()?;
        self.blob.save(&bytes)?;
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes);
        tracing::debug!("User state written");
        self.notify(document);
        Ok(())
    }

    /// Read-modify-write in one call. The closure's result is passed back.
    pub fn update<R>(&self, change: impl FnOnce(&mut UserDocument) -> R) -> Result<R, StoreError> {
        let mut document = self.read()?;
        let result = change(&mut document);
        self.write(&document)?;
        Ok(result)
    }

    /// Drops all persisted user state.
    pub fn reset(&self) -> Result<(), StoreError> {
        self.blob.clear()?;
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::info!("User state reset");
        self.notify(&UserDocument::default());
        Ok(())
    }

    pub fn subscribe(&self, listener: impl Fn(&UserDocument) + Send + Sync + 'static) -> ListenerId {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry_id, _)| *entry_id != id);
        listeners.entries.len() != before
    }

    /// Re-reads the blob and notifies subscribers if its content differs from
    /// what this store last wrote or saw. Returns whether it did.
    pub fn reload_if_changed(&self) -> Result<bool, StoreError> {
        let bytes = self.blob.load()?;
        {
            let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
            if *last_seen == bytes {
                return Ok(false);
            }
            *last_seen = bytes.clone();
        }
        tracing::info!("User state changed outside this process");
        let document = bytes
            .map(|b| UserDocument::parse_or_default(&b))
            .unwrap_or_default();
        self.notify(&document);
        Ok(true)
    }

    /// Watches the backing file's directory and reloads on changes to it.
    /// The returned watcher must be kept alive for watching to continue.
    pub fn watch_external_changes(self: &Arc<Self>) -> Result<impl notify::Watcher, StoreError> {
        use notify::{EventKind, RecursiveMode, Watcher};

        let path = self.path().map(Path::to_path_buf).ok_or(StoreError::NotWatchable)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let store = Arc::downgrade(self);
        let target = path.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(ev) = event else { return };
            if !matches!(ev.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                return;
            }
            if !ev.paths.iter().any(|p| p.file_name() == target.file_name()) {
                return;
            }
            if let Some(store) = store.upgrade() {
                if let Err(e) = store.reload_if_changed() {
                    tracing::warn!("Failed to reload user state: {e}");
                }
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %path.display(), "Watching user state for external changes");
        Ok(watcher)
    }

    fn notify(&self, document: &UserDocument) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(document);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(store: &UserStateStore) -> (Arc<AtomicUsize>, ListenerId) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let id = store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, id)
    }

    #[test]
    fn read_of_empty_store_is_default() {
        let store = UserStateStore::in_memory();
        assert_eq!(store.read().unwrap(), UserDocument::default());
    }

    #[test]
    fn corrupt_blob_reads_as_default() {
        let store = UserStateStore::new(MemoryBlobStore::with_content("{{{"));
        assert_eq!(store.read().unwrap(), UserDocument::default());
    }

    #[test]
    fn update_is_read_modify_write() {
        let store = UserStateStore::in_memory();
        store
            .update(|doc| doc.import_notes.insert("amex-platinum".into(), "a".into()))
            .unwrap();
        store
            .update(|doc| doc.import_notes.insert("chase-sapphire-reserve".into(), "b".into()))
            .unwrap();
        let doc = store.read().unwrap();
        assert_eq!(doc.import_notes.len(), 2);
    }

    #[test]
    fn subscribers_hear_writes_until_unsubscribed() {
        let store = UserStateStore::in_memory();
        let (count, id) = counter(&store);
        store.write(&UserDocument::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.write(&UserDocument::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reload_only_notifies_on_foreign_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user-benefits.json");
        let store = UserStateStore::open(&path);
        let (count, _) = counter(&store);

        store.write(&UserDocument::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!store.reload_if_changed().unwrap());

        // Another process writes the file.
        let mut other = UserDocument::default();
        other.import_notes.insert("amex-platinum".into(), "from elsewhere".into());
        UserStateStore::open(&path).write(&other).unwrap();

        assert!(store.reload_if_changed().unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!store.reload_if_changed().unwrap());
        assert_eq!(store.read().unwrap(), other);
    }

    #[test]
    fn reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStateStore::open(dir.path().join("state.json"));
        store
            .update(|doc| doc.import_notes.insert("x".into(), "y".into()))
            .unwrap();
        store.reset().unwrap();
        assert_eq!(store.read().unwrap(), UserDocument::default());
    }

    #[test]
    fn memory_store_is_not_watchable() {
        let store = Arc::new(UserStateStore::in_memory());
        assert!(matches!(
            store.watch_external_changes(),
            Err(StoreError::NotWatchable)
        ));
    }

    #[test]
    fn watcher_picks_up_writes_from_another_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user-benefits.json");
        let store = Arc::new(UserStateStore::open(&path));
        store.write(&UserDocument::default()).unwrap();
        let (count, _) = counter(&store);
        let _watcher = store.watch_external_changes().unwrap();

        let mut other = UserDocument::default();
        other.import_notes.insert("amex-platinum".into(), "from elsewhere".into());
        UserStateStore::open(&path).write(&other).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(count.load(Ordering::SeqCst) >= 1);
        assert_eq!(store.read().unwrap(), other);
    }
}
