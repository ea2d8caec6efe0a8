//! Cgroup - hierarchy node
//!
//! Each cgroup holds a reference on its parent, so the ancestors of a live
//! cgroup stay alive with it.

use core::fmt;

use crate::scheduler::core::kref::Handle;

/// Cgroup id
pub type CgroupId = u64;

pub struct Cgroup {
    id: CgroupId,
    /// Depth, 0 for the root
    level: u32,
    parent: Option<Handle<Cgroup>>,
}

impl Cgroup {
    pub const fn root(id: CgroupId) -> Self {
        Self { id, level: 0, parent: None }
    }

    pub fn child(id: CgroupId, parent: Handle<Cgroup>) -> Self {
        Self { id, level: parent.level + 1, parent: Some(parent) }
    }

    #[inline]
    pub fn id(&self) -> CgroupId {
        self.id
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn parent(&self) -> Option<Handle<Cgroup>> {
        self.parent.as_ref().map(Handle::acquire)
    }

    /// Ancestor at `level`; `self` is its own ancestor at its own level
    pub fn ancestor(this: &Handle<Cgroup>, level: u32) -> Option<Handle<Cgroup>> {
        if level > this.level {
            return None;
        }
        let mut cur = this.acquire();
        while cur.level > level {
            cur = cur.parent.as_ref()?.acquire();
        }
        Some(cur)
    }
}

impl fmt::Debug for Cgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cgroup").field("id", &self.id).field("level", &self.level).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestor_walk() {
        let root = Handle::new(Cgroup::root(1));
        let mid = Handle::new(Cgroup::child(2, root.acquire()));
        let leaf = Handle::new(Cgroup::child(3, mid.acquire()));
        assert_eq!(leaf.level(), 2);
        assert_eq!(Cgroup::ancestor(&leaf, 0).map(|c| c.id()), Some(1));
        assert_eq!(Cgroup::ancestor(&leaf, 1).map(|c| c.id()), Some(2));
        assert_eq!(Cgroup::ancestor(&leaf, 2).map(|c| c.id()), Some(3));
        assert!(Cgroup::ancestor(&leaf, 3).is_none());
        assert_eq!(leaf.parent().map(|c| c.id()), Some(2));
    }

    #[test]
    fn test_parent_outlives_table_refs() {
        let root = Handle::new(Cgroup::root(1));
        let child = Handle::new(Cgroup::child(2, root.acquire()));
        root.release();
        let anc = Cgroup::ancestor(&child, 0).unwrap();
        assert_eq!(anc.id(), 1);
        assert_eq!(anc.refcount(), 2);
    }
}
