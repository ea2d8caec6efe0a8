//! RCU - read-side critical sections
//!
//! Readers never block writers. A writer that wants to reclaim something
//! readers may still see unpublishes it first, then calls
//! [`Rcu::synchronize`], which returns once every reader that was already
//! inside a critical section has left it.
//!
//! Two reader counters alternate between grace periods: `synchronize` flips
//! the active index and waits for the old one to drain. Must not be called
//! from inside a read-side section of the same domain.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// An RCU domain
pub struct Rcu {
    /// Grace period counter; its low bit selects the active reader slot
    gp: AtomicUsize,
    readers: [AtomicUsize; 2],
    /// Serializes writers
    writer: Mutex<()>,
}

impl Rcu {
    pub const fn new() -> Self {
        Self {
            gp: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writer: Mutex::new(()),
        }
    }

    /// Enter a read-side critical section. The section ends when the guard
    /// is dropped.
    pub fn read_lock(&self) -> RcuReadGuard<'_> {
        loop {
            let idx = self.gp.load(Ordering::Acquire) & 1;
            self.readers[idx].fetch_add(1, Ordering::AcqRel);
            // A writer may have flipped between the load and the increment
            if self.gp.load(Ordering::Acquire) & 1 == idx {
                return RcuReadGuard { rcu: self, idx };
            }
            self.readers[idx].fetch_sub(1, Ordering::Release);
        }
    }

    /// Wait for all pre-existing readers to finish
    pub fn synchronize(&self) {
        let _writer = self.writer.lock();
        let old = self.gp.fetch_add(1, Ordering::AcqRel) & 1;
        while self.readers[old].load(Ordering::Acquire) != 0 {
            spin_loop();
        }
        log::trace!("rcu: grace period {} complete", self.gp.load(Ordering::Relaxed));
    }

    /// Readers currently inside a section
    pub fn nr_readers(&self) -> usize {
        self.readers[0].load(Ordering::Relaxed) + self.readers[1].load(Ordering::Relaxed)
    }
}

impl Default for Rcu {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side critical section. No blocking while held.
pub struct RcuReadGuard<'a> {
    rcu: &'a Rcu,
    idx: usize,
}

impl Drop for RcuReadGuard<'_> {
    fn drop(&mut self) {
        self.rcu.readers[self.idx].fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_guard_counts() {
        let rcu = Rcu::new();
        {
            let _a = rcu.read_lock();
            let _b = rcu.read_lock();
            assert_eq!(rcu.nr_readers(), 2);
        }
        assert_eq!(rcu.nr_readers(), 0);
        rcu.synchronize();
    }

    #[test]
    fn test_synchronize_waits_for_reader() {
        let rcu = Arc::new(Rcu::new());
        let released = Arc::new(AtomicBool::new(false));
        let guard_held = Arc::new(AtomicBool::new(false));

        let reader = {
            let rcu = rcu.clone();
            let released = released.clone();
            let guard_held = guard_held.clone();
            std::thread::spawn(move || {
                let _g = rcu.read_lock();
                guard_held.store(true, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                released.store(true, Ordering::SeqCst);
            })
        };

        while !guard_held.load(Ordering::SeqCst) {
            spin_loop();
        }
        rcu.synchronize();
        assert!(released.load(Ordering::SeqCst));
        reader.join().unwrap();
    }
}
