//! Kref - reference-counted handles to host-owned objects
//!
//! The host owns tasks, cgroups and cpumasks through [`ObjectTable`]s. A
//! policy that needs to keep one past the current callback takes a
//! [`Handle`]: acquiring increments the refcount, dropping (or
//! [`Handle::release`]) decrements it, and the object is freed when the last
//! reference goes away. Release consumes the handle, so releasing twice or
//! releasing a borrowed pointer does not compile.
//!
//! [`KptrSlot`] stores an owned handle in shared state and hands back the
//! previous occupant on exchange, so ownership is never duplicated.

use alloc::sync::Arc;
use core::fmt;
use core::hash::BuildHasher;
use core::ops::Deref;
use hashbrown::HashMap;
use siphasher::sip::SipHasher13;
use spin::{Mutex, RwLock};

/// Owned reference to a host object
pub struct Handle<T> {
    inner: Arc<T>,
}

impl<T> Handle<T> {
    /// Wrap a fresh object. The handle holds the only reference.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(value) }
    }

    pub(crate) fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }

    /// Take another reference to the same object
    #[inline]
    pub fn acquire(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }

    /// Drop this reference. Frees the object if it was the last one.
    #[inline]
    pub fn release(self) {
        drop(self);
    }

    /// Current number of references, for diagnostics only
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Both handles refer to the same object
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&*self.inner).finish()
    }
}

/// Fixed SipHash-1-3 keys for object tables
const SIP_K0: u64 = 0x5343_585f_5441_424c;
const SIP_K1: u64 = 0x6578_6f5f_7363_6864;

/// `BuildHasher` for the object tables
#[derive(Debug, Clone, Copy, Default)]
pub struct SipBuildHasher;

impl BuildHasher for SipBuildHasher {
    type Hasher = SipHasher13;

    fn build_hasher(&self) -> SipHasher13 {
        SipHasher13::new_with_keys(SIP_K0, SIP_K1)
    }
}

/// Id-keyed table of live host objects
pub struct ObjectTable<T> {
    objects: RwLock<HashMap<u64, Arc<T>, SipBuildHasher>>,
}

impl<T> ObjectTable<T> {
    pub fn new() -> Self {
        Self { objects: RwLock::new(HashMap::with_hasher(SipBuildHasher)) }
    }

    /// Publish `obj` under `id`. Returns false if the id is taken.
    pub fn insert(&self, id: u64, obj: Arc<T>) -> bool {
        let mut objects = self.objects.write();
        if objects.contains_key(&id) {
            return false;
        }
        objects.insert(id, obj);
        true
    }

    /// `acquire_by_id`: a new handle, or `None` if no live object has this id
    pub fn get(&self, id: u64) -> Option<Handle<T>> {
        self.objects.read().get(&id).cloned().map(Handle::from_arc)
    }

    /// Unpublish. Outstanding handles keep the object alive.
    pub fn remove(&self, id: u64) -> Option<Arc<T>> {
        self.objects.write().remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.objects.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Handles to every live object, in no particular order
    pub fn snapshot(&self) -> alloc::vec::Vec<Handle<T>> {
        self.objects.read().values().cloned().map(Handle::from_arc).collect()
    }
}

impl<T> Default for ObjectTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared slot holding at most one owned handle
pub struct KptrSlot<T> {
    slot: Mutex<Option<Handle<T>>>,
}

impl<T> KptrSlot<T> {
    pub const fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    /// Store `new` and return the previous occupant, which the caller now
    /// owns and must release.
    pub fn xchg(&self, new: Option<Handle<T>>) -> Option<Handle<T>> {
        core::mem::replace(&mut *self.slot.lock(), new)
    }

    /// Empty the slot
    pub fn take(&self) -> Option<Handle<T>> {
        self.xchg(None)
    }

    /// A new reference to the occupant, leaving it in place
    pub fn peek(&self) -> Option<Handle<T>> {
        self.slot.lock().as_ref().map(Handle::acquire)
    }
}

impl<T> Default for KptrSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter<'a>(&'a AtomicUsize);

    impl Drop for DropCounter<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_object_lives_until_last_release() {
        let drops = AtomicUsize::new(0);
        let table = ObjectTable::new();
        assert!(table.insert(7, Arc::new(DropCounter(&drops))));
        assert!(!table.insert(7, Arc::new(DropCounter(&drops))));
        // The rejected duplicate was dropped
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let a = table.get(7).unwrap();
        let b = a.acquire();
        assert_eq!(a.refcount(), 3);

        drop(table.remove(7));
        assert!(table.get(7).is_none());
        a.release();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(b.refcount(), 1);
        b.release();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_acquire_by_missing_id() {
        let table: ObjectTable<u32> = ObjectTable::new();
        assert!(table.get(1).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_kptr_xchg_transfers_ownership() {
        let slot = KptrSlot::new();
        let h = Handle::new(5u32);
        assert!(slot.xchg(Some(h.acquire())).is_none());
        assert_eq!(h.refcount(), 2);

        let peeked = slot.peek().unwrap();
        assert_eq!(*peeked, 5);
        assert_eq!(h.refcount(), 3);
        peeked.release();

        let old = slot.xchg(Some(Handle::new(6))).unwrap();
        assert!(Handle::ptr_eq(&old, &h));
        old.release();
        assert_eq!(h.refcount(), 1);
        assert_eq!(slot.take().map(|h| *h), Some(6));
        assert!(slot.peek().is_none());
    }
}
