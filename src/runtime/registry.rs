//! Handle registry for host objects referenced from script.
//!
//! Script code never holds a reference to host memory. Instead it holds an
//! opaque integer [`Handle`] that the registry resolves back to a host object.
//! The QuickJS collector never traces host objects and the host never traces
//! engine memory; the integer is the only link between the two.

use super::bridge::ClosureRecord;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// First handle value handed out by a registry. Values below are reserved.
pub const FIRST_HANDLE: u64 = 1000;

/// Opaque key referencing a host object stored in a [`HandleRegistry`].
///
/// A handle is a lookup key, not an owner: freeing it removes the entry but
/// does not otherwise affect the referenced object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u64);

impl Handle {
    /// The nil sentinel. Never resolves to an entry.
    pub const NIL: Handle = Handle(0);

    /// Rebuild a handle from its raw integer form (as seen by script).
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Discriminant recorded for every entry at insertion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A host closure exposed to script through the callback bridge.
    Closure,
    /// Any other host object.
    Object,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Closure => f.write_str("closure"),
            EntryKind::Object => f.write_str("object"),
        }
    }
}

/// A registry entry.
#[derive(Clone)]
pub enum Entry {
    Closure(ClosureRecord),
    Object(Arc<dyn Any + Send + Sync>),
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Closure(_) => EntryKind::Closure,
            Entry::Object(_) => EntryKind::Object,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Closure(record) => f.debug_tuple("Closure").field(record).finish(),
            Entry::Object(_) => f.debug_tuple("Object").finish_non_exhaustive(),
        }
    }
}

impl From<ClosureRecord> for Entry {
    fn from(record: ClosureRecord) -> Self {
        Entry::Closure(record)
    }
}

/// Lookup failures reported by the typed accessors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("handle {0} is not registered")]
    UnknownHandle(Handle),
    #[error("handle {handle} refers to a {found}, expected a {expected}")]
    WrongKind {
        handle: Handle,
        expected: EntryKind,
        found: EntryKind,
    },
    #[error("handle {handle} refers to an object that is not a {expected}")]
    WrongType {
        handle: Handle,
        expected: &'static str,
    },
}

struct RegistryInner {
    entries: HashMap<Handle, Entry>,
    next: u64,
}

/// Thread-safe table from [`Handle`] to host object.
///
/// Lookups take a shared lock; inserts and removals take the exclusive lock.
/// The counter and the map live under the same lock, so a handle value is
/// never minted twice.
pub struct HandleRegistry {
    inner: RwLock<RegistryInner>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                entries: HashMap::new(),
                next: FIRST_HANDLE,
            }),
        }
    }

    // A panic in another thread while holding the lock cannot leave the map
    // half-updated (every mutation is a single insert or remove), so poisoning
    // is ignored.
    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an entry under a freshly minted handle.
    pub fn put(&self, entry: impl Into<Entry>) -> Handle {
        let mut inner = self.write();
        let handle = Handle(inner.next);
        inner.next += 1;
        inner.entries.insert(handle, entry.into());
        handle
    }

    /// Insert an arbitrary host object.
    pub fn put_object<T: Any + Send + Sync>(&self, object: T) -> Handle {
        self.put_shared(Arc::new(object))
    }

    /// Insert a host object that the caller keeps sharing.
    pub fn put_shared<T: Any + Send + Sync>(&self, object: Arc<T>) -> Handle {
        self.put(Entry::Object(object))
    }

    pub fn put_closure(&self, record: ClosureRecord) -> Handle {
        self.put(Entry::Closure(record))
    }

    /// Resolve a handle. Returns `None` for the nil handle and for unknown or
    /// freed handles.
    pub fn get(&self, handle: Handle) -> Option<Entry> {
        if handle.is_nil() {
            return None;
        }
        self.read().entries.get(&handle).cloned()
    }

    /// Resolve a handle that must refer to a host object of type `T`.
    pub fn get_object<T: Any + Send + Sync>(
        &self,
        handle: Handle,
    ) -> Result<Arc<T>, RegistryError> {
        match self.get(handle) {
            Some(Entry::Object(object)) => {
                object.downcast::<T>().map_err(|_| RegistryError::WrongType {
                    handle,
                    expected: std::any::type_name::<T>(),
                })
            }
            Some(other) => Err(RegistryError::WrongKind {
                handle,
                expected: EntryKind::Object,
                found: other.kind(),
            }),
            None => Err(RegistryError::UnknownHandle(handle)),
        }
    }

    /// Resolve a handle that must refer to a closure record.
    pub fn get_closure(&self, handle: Handle) -> Result<ClosureRecord, RegistryError> {
        match self.get(handle) {
            Some(Entry::Closure(record)) => Ok(record),
            Some(other) => Err(RegistryError::WrongKind {
                handle,
                expected: EntryKind::Closure,
                found: other.kind(),
            }),
            None => Err(RegistryError::UnknownHandle(handle)),
        }
    }

    /// Remove the entry (if any) and reset `handle` to [`Handle::NIL`].
    ///
    /// Calling this again on the same variable is a no-op.
    pub fn free(&self, handle: &mut Handle) {
        if handle.is_nil() {
            return;
        }
        self.write().entries.remove(handle);
        *handle = Handle::NIL;
    }

    pub fn contains(&self, handle: Handle) -> bool {
        !handle.is_nil() && self.read().entries.contains_key(&handle)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        f.debug_struct("HandleRegistry")
            .field("live", &inner.entries.len())
            .field("next", &inner.next)
            .finish()
    }
}
