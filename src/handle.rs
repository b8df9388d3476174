//! Handle table for native-owned objects.
//!
//! Native objects are never handed to the host directly. The host holds an
//! opaque [`Handle`] whose lifetime is governed by an atomic reference count:
//! constructors create it with a count of one, `clone_handle` increments it
//! and `free` decrements it. When the count reaches zero the table drops its
//! reference and the object is destroyed as soon as native code releases any
//! reference it still holds.
//!
//! Handle ids are allocated from a monotonically increasing counter and are
//! never reused, so a stale handle can never alias a different object.

use crate::error::{BridgeError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Name of an exposed object type (e.g. `"Fetcher"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(pub &'static str);

impl TypeTag {
    /// The type name
    pub fn name(&self) -> &'static str {
        self.0
    }

    /// Name of the generated clone method for this type
    pub fn clone_method(&self) -> String {
        format!("clone_{}", self.0.to_ascii_lowercase())
    }

    /// Name of the generated free method for this type
    pub fn free_method(&self) -> String {
        format!("free_{}", self.0.to_ascii_lowercase())
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Opaque reference to a native object held by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    id: u64,
    tag: TypeTag,
}

impl Handle {
    /// Rebuild a handle from its parts, as received from the host
    pub fn new(id: u64, tag: TypeTag) -> Self {
        Self { id, tag }
    }

    /// Numeric id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Object type tag
    pub fn tag(&self) -> TypeTag {
        self.tag
    }
}

/// Snapshot of a live handle, used for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleInfo {
    /// Numeric id
    pub id: u64,
    /// Object type name
    pub type_name: String,
    /// Current reference count
    pub refcount: usize,
}

struct Slot {
    tag: TypeTag,
    refcount: AtomicUsize,
    object: Arc<dyn Any + Send + Sync>,
}

/// Refcounted table of native objects
pub struct HandleTable {
    slots: DashMap<u64, Slot>,
    next_id: AtomicU64,
}

impl HandleTable {
    /// Create an empty table; the first handle has id 1
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Store a newly constructed object with a reference count of one
    pub fn insert<T: Send + Sync + 'static>(&self, tag: TypeTag, object: Arc<T>) -> Handle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(
            id,
            Slot {
                tag,
                refcount: AtomicUsize::new(1),
                object,
            },
        );
        debug!(id, type_name = tag.name(), "Created handle");
        Handle { id, tag }
    }

    /// Increment the reference count; returns the same handle
    pub fn clone_handle(&self, handle: Handle) -> Result<Handle> {
        let slot = self.slot(handle)?;
        let count = slot.refcount.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(id = handle.id, refcount = count, "Cloned handle");
        Ok(handle)
    }

    /// Decrement the reference count.
    ///
    /// Returns `true` when this call released the last reference and the
    /// object was removed from the table.
    pub fn free(&self, handle: Handle) -> Result<bool> {
        // The entry holds the shard write lock, so no clone can race the removal.
        match self.slots.entry(handle.id) {
            Entry::Occupied(entry) => {
                if entry.get().tag != handle.tag {
                    return Err(type_mismatch(handle, entry.get().tag));
                }
                let previous = entry.get().refcount.fetch_sub(1, Ordering::AcqRel);
                if previous == 1 {
                    entry.remove();
                    debug!(id = handle.id, type_name = handle.tag.name(), "Destroyed handle");
                    Ok(true)
                } else {
                    trace!(id = handle.id, refcount = previous - 1, "Freed handle clone");
                    Ok(false)
                }
            }
            Entry::Vacant(_) => Err(BridgeError::invalid_handle(handle.id, "unknown or freed")),
        }
    }

    /// Lend the object to native code
    pub fn get<T: Send + Sync + 'static>(&self, handle: Handle) -> Result<Arc<T>> {
        let object = Arc::clone(&self.slot(handle)?.object);
        object.downcast::<T>().map_err(|_| {
            BridgeError::invalid_handle(handle.id, "object does not have the requested native type")
        })
    }

    /// Look up a handle by id alone
    pub fn lookup(&self, id: u64) -> Result<Handle> {
        self.slots
            .get(&id)
            .map(|slot| Handle { id, tag: slot.tag })
            .ok_or_else(|| BridgeError::invalid_handle(id, "unknown or freed"))
    }

    /// Current reference count, if the handle is live
    pub fn refcount(&self, handle: Handle) -> Option<usize> {
        self.slots
            .get(&handle.id)
            .filter(|slot| slot.tag == handle.tag)
            .map(|slot| slot.refcount.load(Ordering::Acquire))
    }

    /// Whether the handle is live
    pub fn contains(&self, handle: Handle) -> bool {
        self.refcount(handle).is_some()
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshot of all live handles
    pub fn snapshot(&self) -> Vec<HandleInfo> {
        let mut infos: Vec<HandleInfo> = self
            .slots
            .iter()
            .map(|entry| HandleInfo {
                id: *entry.key(),
                type_name: entry.tag.name().to_string(),
                refcount: entry.refcount.load(Ordering::Acquire),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    fn slot(&self, handle: Handle) -> Result<dashmap::mapref::one::Ref<'_, u64, Slot>> {
        let slot = self
            .slots
            .get(&handle.id)
            .ok_or_else(|| BridgeError::invalid_handle(handle.id, "unknown or freed"))?;
        if slot.tag != handle.tag {
            return Err(type_mismatch(handle, slot.tag));
        }
        Ok(slot)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

fn type_mismatch(handle: Handle, actual: TypeTag) -> BridgeError {
    BridgeError::invalid_handle(
        handle.id,
        format!("expected a {} but the handle refers to a {}", handle.tag, actual),
    )
}

/// Owned clone of a handle that is freed when dropped.
///
/// Host wrappers hold one of these so that garbage collection of the wrapper
/// releases its reference even if the host never calls `destroy`.
pub struct HandleGuard {
    table: Arc<HandleTable>,
    handle: Option<Handle>,
}

impl HandleGuard {
    /// Take a new reference to `handle`
    pub fn acquire(table: Arc<HandleTable>, handle: Handle) -> Result<Self> {
        let handle = table.clone_handle(handle)?;
        Ok(Self {
            table,
            handle: Some(handle),
        })
    }

    /// Adopt a reference the caller already owns (e.g. from a constructor)
    pub fn adopt(table: Arc<HandleTable>, handle: Handle) -> Self {
        Self {
            table,
            handle: Some(handle),
        }
    }

    /// The guarded handle, if not yet released
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    /// Release the reference now; later calls and the drop are no-ops
    pub fn release(&mut self) -> Result<bool> {
        match self.handle.take() {
            Some(handle) => self.table.free(handle),
            None => Ok(false),
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.table.free(handle) {
                debug!(id = handle.id, error = %e, "Handle already released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const FETCHER: TypeTag = TypeTag("Fetcher");
    const SERVICE: TypeTag = TypeTag("Service");

    struct Probe {
        dropped: Arc<AtomicBool>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn probe() -> (Arc<Probe>, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        (
            Arc::new(Probe {
                dropped: Arc::clone(&dropped),
            }),
            dropped,
        )
    }

    #[test]
    fn test_first_handle_is_one() {
        let table = HandleTable::new();
        let handle = table.insert(FETCHER, Arc::new(5u32));
        assert_eq!(handle.id(), 1);
        assert_eq!(table.refcount(handle), Some(1));
    }

    #[test]
    fn test_free_of_clone_restores_refcount() {
        let table = HandleTable::new();
        let handle = table.insert(FETCHER, Arc::new(5u32));
        table.clone_handle(handle).unwrap();
        table.clone_handle(handle).unwrap();
        let before = table.refcount(handle);

        let cloned = table.clone_handle(handle).unwrap();
        assert_eq!(cloned, handle);
        assert!(!table.free(cloned).unwrap());

        assert_eq!(table.refcount(handle), before);
    }

    #[test]
    fn test_object_destroyed_after_last_free() {
        let table = HandleTable::new();
        let (object, dropped) = probe();
        let handle = table.insert(FETCHER, object);
        table.clone_handle(handle).unwrap();

        assert!(!table.free(handle).unwrap());
        assert!(!dropped.load(Ordering::SeqCst));
        assert!(table.free(handle).unwrap());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_native_reference_outlives_free() {
        let table = HandleTable::new();
        let (object, dropped) = probe();
        let handle = table.insert(FETCHER, object);

        let lent = table.get::<Probe>(handle).unwrap();
        assert!(table.free(handle).unwrap());
        assert!(!dropped.load(Ordering::SeqCst));
        drop(lent);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_use_after_free_is_invalid_handle() {
        let table = HandleTable::new();
        let handle = table.insert(FETCHER, Arc::new(5u32));
        table.free(handle).unwrap();

        let err = table.get::<u32>(handle).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidHandle);
        assert_eq!(err.handle, Some(1));
        assert!(table.clone_handle(handle).is_err());
        assert!(table.free(handle).is_err());
    }

    #[test]
    fn test_ids_not_reused() {
        let table = HandleTable::new();
        let first = table.insert(FETCHER, Arc::new(1u32));
        table.free(first).unwrap();
        let second = table.insert(FETCHER, Arc::new(2u32));
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_type_tag_mismatch() {
        let table = HandleTable::new();
        let handle = table.insert(FETCHER, Arc::new(1u32));
        let forged = Handle::new(handle.id(), SERVICE);

        assert!(table.clone_handle(forged).is_err());
        assert!(table.free(forged).is_err());
        assert_eq!(table.refcount(handle), Some(1));
        assert!(table.get::<String>(handle).is_err());
    }

    #[test]
    fn test_lookup_and_snapshot() {
        let table = HandleTable::new();
        let handle = table.insert(SERVICE, Arc::new(1u32));
        assert_eq!(table.lookup(handle.id()).unwrap(), handle);
        assert!(table.lookup(99).is_err());

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].type_name, "Service");
    }

    #[test]
    fn test_guard_frees_on_drop() {
        let table = Arc::new(HandleTable::new());
        let handle = table.insert(FETCHER, Arc::new(1u32));
        {
            let _guard = HandleGuard::acquire(Arc::clone(&table), handle).unwrap();
            assert_eq!(table.refcount(handle), Some(2));
        }
        assert_eq!(table.refcount(handle), Some(1));

        let mut guard = HandleGuard::adopt(Arc::clone(&table), handle);
        assert!(guard.release().unwrap());
        assert!(!guard.release().unwrap());
        drop(guard);
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_clone_free() {
        let table = Arc::new(HandleTable::new());
        let handle = table.insert(FETCHER, Arc::new(1u32));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        table.clone_handle(handle).unwrap();
                        table.free(handle).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(table.refcount(handle), Some(1));
    }

    #[test]
    fn test_generated_method_names() {
        assert_eq!(FETCHER.clone_method(), "clone_fetcher");
        assert_eq!(FETCHER.free_method(), "free_fetcher");
    }
}
