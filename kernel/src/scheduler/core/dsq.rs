//! DSQ - dispatch queue storage
//!
//! A DSQ holds entries for runnable tasks, either in FIFO order or ordered
//! by vtime (ties in insertion order). One DSQ never mixes both: the mode is
//! decided by the entries currently queued.
//!
//! Entries are tagged with the task's queue sequence number at insertion.
//! Whoever pops an entry must re-check it under the task lock: a task that
//! was dequeued or re-dispatched in the meantime has a newer seq and the
//! entry is stale.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use super::collections::{List, RbLess, RbTree};
use super::error::{Result, ScxError};
use super::kref::SipBuildHasher;
use super::policy::SCX_DSQ_FLAG_BUILTIN;
use crate::scheduler::thread::TaskRef;

/// A queued task
pub struct DsqEntry {
    pub task: TaskRef,
    pub vtime: u64,
    pub seq: u64,
}

impl DsqEntry {
    pub fn is_for(&self, task: &TaskRef, seq: u64) -> bool {
        self.seq == seq && TaskRef::ptr_eq(&self.task, task)
    }
}

impl RbLess for DsqEntry {
    fn less(&self, other: &Self) -> bool {
        self.vtime < other.vtime
    }
}

impl fmt::Debug for DsqEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DsqEntry")
            .field("pid", &self.task.pid())
            .field("vtime", &self.vtime)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Why an insertion was refused. The entry is handed back.
pub enum InsertError {
    /// The DSQ was destroyed
    Dead(DsqEntry),
    /// FIFO insert while vtime-ordered entries are queued
    HasPriq(DsqEntry),
    /// vtime insert while FIFO entries are queued
    HasFifo(DsqEntry),
}

impl InsertError {
    pub fn into_entry(self) -> DsqEntry {
        match self {
            Self::Dead(e) | Self::HasPriq(e) | Self::HasFifo(e) => e,
        }
    }
}

struct DsqInner {
    fifo: List<DsqEntry>,
    priq: RbTree<DsqEntry>,
    dead: bool,
}

/// Dispatch queue
pub struct Dsq {
    id: u64,
    /// Locality hint given at creation
    node: i32,
    inner: Mutex<DsqInner>,
    nr: AtomicU32,
}

impl Dsq {
    pub fn new(id: u64, node: i32) -> Self {
        Self {
            id,
            node,
            inner: Mutex::new(DsqInner { fifo: List::new(), priq: RbTree::new(), dead: false }),
            nr: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> i32 {
        self.node
    }

    pub fn is_builtin(&self) -> bool {
        self.id & SCX_DSQ_FLAG_BUILTIN != 0
    }

    /// Racy length, for heuristics only
    #[inline]
    pub fn nr_queued(&self) -> u32 {
        self.nr.load(Ordering::Relaxed)
    }

    /// Queue `entry` in FIFO order, at the head if `head`
    pub fn insert_fifo(&self, entry: DsqEntry, head: bool) -> core::result::Result<(), InsertError> {
        let mut inner = self.inner.lock();
        if inner.dead {
            return Err(InsertError::Dead(entry));
        }
        if !inner.priq.is_empty() {
            return Err(InsertError::HasPriq(entry));
        }
        if head {
            inner.fifo.push_front(entry);
        } else {
            inner.fifo.push_back(entry);
        }
        self.nr.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue `entry` by `entry.vtime`
    pub fn insert_vtime(&self, entry: DsqEntry) -> core::result::Result<(), InsertError> {
        let mut inner = self.inner.lock();
        if inner.dead {
            return Err(InsertError::Dead(entry));
        }
        if !inner.fifo.is_empty() {
            return Err(InsertError::HasFifo(entry));
        }
        inner.priq.add(entry);
        self.nr.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Detach the first entry, in queue order, satisfying `pred`
    pub fn pop_first_where(&self, mut pred: impl FnMut(&DsqEntry) -> bool) -> Option<DsqEntry> {
        let mut inner = self.inner.lock();
        let entry = if inner.priq.is_empty() {
            inner.fifo.remove_where(&mut pred)
        } else {
            inner.priq.pop_first_where(&mut pred)
        }?;
        self.nr.fetch_sub(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Detach the head entry
    pub fn pop_first(&self) -> Option<DsqEntry> {
        self.pop_first_where(|_| true)
    }

    /// Detach the entry queued for `task` at `seq`. `vtime` locates it in a
    /// vtime-ordered queue.
    pub fn remove(&self, task: &TaskRef, seq: u64, vtime: u64) -> bool {
        let mut inner = self.inner.lock();
        let removed = if inner.priq.is_empty() {
            inner.fifo.remove_where(|e| e.is_for(task, seq))
        } else {
            let key = DsqEntry { task: task.acquire(), vtime, seq };
            match inner.priq.remove(&key, |e| e.is_for(task, seq)) {
                Some(e) => Some(e),
                // vtime changed under us, fall back to a scan
                None => inner.priq.pop_first_where(|e| e.is_for(task, seq)),
            }
        };
        if removed.is_some() {
            self.nr.fetch_sub(1, Ordering::Relaxed);
        }
        removed.is_some()
    }

    /// Pid at the head, if any
    pub fn first_pid(&self) -> Option<i32> {
        let inner = self.inner.lock();
        inner.priq.first().or_else(|| inner.fifo.front()).map(|e| e.task.pid())
    }

    /// Take every entry, in queue order
    pub fn drain(&self) -> Vec<DsqEntry> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.fifo.len() + inner.priq.len());
        while let Some(e) = inner.priq.pop_first() {
            out.push(e);
        }
        while let Some(e) = inner.fifo.pop_front() {
            out.push(e);
        }
        self.nr.store(0, Ordering::Relaxed);
        out
    }

    /// Mark dead if empty. Returns the number of queued entries otherwise.
    fn kill_if_empty(&self) -> core::result::Result<(), u32> {
        let mut inner = self.inner.lock();
        let nr = (inner.fifo.len() + inner.priq.len()) as u32;
        if nr != 0 {
            return Err(nr);
        }
        inner.dead = true;
        Ok(())
    }
}

impl fmt::Debug for Dsq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dsq").field("id", &format_args!("0x{:x}", self.id)).field("nr", &self.nr_queued()).finish()
    }
}

/// Outcome of [`DsqTable::destroy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    NotFound,
    /// Tasks still queued. Nothing was destroyed.
    Busy { nr: u32 },
}

/// User-created DSQs by id
pub struct DsqTable {
    dsqs: RwLock<HashMap<u64, Arc<Dsq>, SipBuildHasher>>,
    max: usize,
}

impl DsqTable {
    pub fn new(max: usize) -> Self {
        Self { dsqs: RwLock::new(HashMap::with_hasher(SipBuildHasher)), max }
    }

    pub fn create(&self, id: u64, node: i32) -> Result<Arc<Dsq>> {
        if id & SCX_DSQ_FLAG_BUILTIN != 0 {
            return Err(ScxError::DsqBuiltin { dsq_id: id });
        }
        let mut dsqs = self.dsqs.write();
        if dsqs.contains_key(&id) {
            return Err(ScxError::DsqExists { dsq_id: id });
        }
        if dsqs.len() >= self.max {
            return Err(ScxError::DsqLimit { current: dsqs.len(), max: self.max });
        }
        let dsq = Arc::new(Dsq::new(id, node));
        dsqs.insert(id, dsq.clone());
        Ok(dsq)
    }

    pub fn find(&self, id: u64) -> Option<Arc<Dsq>> {
        self.dsqs.read().get(&id).cloned()
    }

    /// Destroy an empty DSQ. Concurrent inserts into it fail with
    /// [`InsertError::Dead`] from here on.
    pub fn destroy(&self, id: u64) -> DestroyOutcome {
        let mut dsqs = self.dsqs.write();
        let Some(dsq) = dsqs.get(&id) else {
            return DestroyOutcome::NotFound;
        };
        if let Err(nr) = dsq.kill_if_empty() {
            return DestroyOutcome::Busy { nr };
        }
        dsqs.remove(&id);
        DestroyOutcome::Destroyed
    }

    /// Remove every DSQ, returning them so the caller can drain them
    pub fn clear(&self) -> Vec<Arc<Dsq>> {
        self.dsqs.write().drain().map(|(_, dsq)| dsq).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Dsq>> {
        self.dsqs.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.dsqs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dsqs.read().is_empty()
    }
}
