//! Verified pointers - bounds-checked access into fixed-size regions
//!
//! Every access computes a byte offset, clamps it against the largest offset
//! at which the member still fits inside the region, and yields `None` past
//! that bound. The caller checks the `Option` immediately; there is no way to
//! obtain a reference past the region.
//!
//! Regions and members are plain data (`zerocopy`), so no `unsafe` is needed:
//! the bytes of the region are reinterpreted only after the bound and the
//! alignment have been checked.
//!
//! ```ignore
//! let slot: Option<&u64> = member_vptr!(stats, Stats, counters[i] as u64);
//! let Some(slot) = slot else { return };
//! ```

use alloc::vec::Vec;
use core::mem::{size_of, size_of_val};
use zerocopy::{AsBytes, FromBytes};

use crate::scheduler::core::error::{Result, ScxError};

/// Largest valid offset of an `M` inside `region_size` bytes
#[inline(always)]
fn max_offset<M>(region_size: usize) -> Option<usize> {
    region_size.checked_sub(size_of::<M>())
}

/// Member of type `M` at byte `offset` inside `base`.
///
/// `None` if `offset > size_of_val(base) - size_of::<M>()`, if `M` is larger
/// than the region, or if the resulting address is misaligned for `M`.
#[inline]
pub fn member_vptr<B, M>(base: &B, offset: usize) -> Option<&M>
where
    B: AsBytes + ?Sized,
    M: FromBytes,
{
    let max = max_offset::<M>(size_of_val(base))?;
    if offset > max {
        return None;
    }
    M::ref_from_prefix(&base.as_bytes()[offset..])
}

/// Mutable variant of [`member_vptr`]
#[inline]
pub fn member_vptr_mut<B, M>(base: &mut B, offset: usize) -> Option<&mut M>
where
    B: AsBytes + FromBytes + ?Sized,
    M: AsBytes + FromBytes,
{
    let max = max_offset::<M>(size_of_val(base))?;
    if offset > max {
        return None;
    }
    M::mut_from_prefix(&mut base.as_bytes_mut()[offset..])
}

/// Element `i` of an array whose live length is `n`.
///
/// The clamp uses `n`, not the compile-time length, so arrays grown at
/// setup time can be indexed up to their real size. `n` larger than the
/// backing slice still never reaches past it.
#[inline]
pub fn array_elem<T>(arr: &[T], i: usize, n: usize) -> Option<&T> {
    let max = size_of::<T>().checked_mul(n.checked_sub(1)?)?;
    let off = i.checked_mul(size_of::<T>())?;
    if off > max {
        return None;
    }
    arr.get(i)
}

/// Mutable variant of [`array_elem`]
#[inline]
pub fn array_elem_mut<T>(arr: &mut [T], i: usize, n: usize) -> Option<&mut T> {
    let max = size_of::<T>().checked_mul(n.checked_sub(1)?)?;
    let off = i.checked_mul(size_of::<T>())?;
    if off > max {
        return None;
    }
    arr.get_mut(i)
}

/// Bounds-checked member access by field path.
///
/// `member_vptr!(base, Type, field as M)` or
/// `member_vptr!(base, Type, field[idx] as M)`.
#[macro_export]
macro_rules! member_vptr {
    ($base:expr, $ty:ty, $field:ident as $m:ty) => {
        $crate::libutils::vptr::member_vptr::<_, $m>(&$base, ::core::mem::offset_of!($ty, $field))
    };
    ($base:expr, $ty:ty, $field:ident [ $idx:expr ] as $m:ty) => {
        (($idx) as usize)
            .checked_mul(::core::mem::size_of::<$m>())
            .and_then(|off| off.checked_add(::core::mem::offset_of!($ty, $field)))
            .and_then(|off| $crate::libutils::vptr::member_vptr::<_, $m>(&$base, off))
    };
}

/// Array declared with one element and grown before the scheduler is
/// enabled. Once sealed, its length is fixed and every access goes through
/// [`array_elem`] against the live length.
#[derive(Debug)]
pub struct ResizableArray<T> {
    data: Vec<T>,
    sealed: bool,
}

impl<T> ResizableArray<T> {
    pub fn new(first: T) -> Self {
        let mut data = Vec::with_capacity(1);
        data.push(first);
        Self { data, sealed: false }
    }

    /// Grow or shrink to `n` elements, filling new slots with `f(index)`
    pub fn resize_with(&mut self, n: usize, mut f: impl FnMut(usize) -> T) -> Result<()> {
        if self.sealed {
            return Err(ScxError::Busy { operation: "resize" });
        }
        if n == 0 {
            return Err(ScxError::InvalidConfig { field: "array length", value: 0 });
        }
        self.data.truncate(n);
        let start = self.data.len();
        self.data.extend((start..n).map(&mut f));
        Ok(())
    }

    /// Freeze the length
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<&T> {
        array_elem(&self.data, i, self.data.len())
    }

    #[inline]
    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        let n = self.data.len();
        array_elem_mut(&mut self.data, i, n)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.data.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::{AsBytes, FromBytes, FromZeroes};

    #[repr(C)]
    #[derive(FromZeroes, FromBytes, AsBytes, Default)]
    struct Region {
        head: u64,
        slots: [u64; 4],
        tail: u32,
        flags: u32,
    }

    static_assertions::const_assert_eq!(core::mem::size_of::<Region>(), 48);

    #[test]
    fn test_member_in_bounds_matches_field() {
        let mut r = Region::default();
        r.slots[2] = 0xdead;
        r.flags = 7;

        let slot: &u64 = member_vptr!(r, Region, slots[2] as u64).unwrap();
        assert_eq!(*slot, 0xdead);
        assert!(core::ptr::eq(slot, &r.slots[2]));

        let flags: &u32 = member_vptr!(r, Region, flags as u32).unwrap();
        assert_eq!(*flags, 7);
    }

    #[test]
    fn test_member_out_of_bounds_is_none() {
        let r = Region::default();
        // slots[4] lands on tail/flags, still inside the region
        assert!(member_vptr!(r, Region, slots[4] as u64).is_some());
        // slots[5] starts at 48, the end of the region
        assert!(member_vptr!(r, Region, slots[5] as u64).is_none());
        assert!(member_vptr!(r, Region, slots[6] as u64).is_none());
        assert!(member_vptr!(r, Region, slots[usize::MAX] as u64).is_none());
        assert!(member_vptr::<_, [u64; 7]>(&r, 0).is_none());
        // Last valid u32 offset is 44
        assert!(member_vptr::<_, u32>(&r, 44).is_some());
        assert!(member_vptr::<_, u32>(&r, 45).is_none());
    }

    #[test]
    fn test_member_mut_writes_through() {
        let mut r = Region::default();
        *member_vptr_mut::<_, u32>(&mut r, 40).unwrap() = 9;
        assert_eq!(r.tail, 9);
        assert!(member_vptr_mut::<_, u64>(&mut r, 41).is_none());
    }

    #[test]
    fn test_array_elem_uses_live_count() {
        let arr = [1u32, 2, 3, 4];
        assert_eq!(array_elem(&arr, 1, 2), Some(&2));
        assert_eq!(array_elem(&arr, 2, 2), None);
        assert_eq!(array_elem(&arr, 0, 0), None);
        // Count larger than backing storage never reaches past it
        assert_eq!(array_elem(&arr, 7, 100), None);
    }

    #[test]
    fn test_resizable_array() {
        let mut a = ResizableArray::new(0u64);
        assert_eq!(a.len(), 1);
        a.resize_with(4, |i| i as u64 * 10).unwrap();
        assert_eq!(a.get(3), Some(&30));
        assert_eq!(a.get(4), None);
        *a.get_mut(0).unwrap() = 5;
        a.seal();
        assert!(a.resize_with(8, |_| 0).is_err());
        assert_eq!(a.iter().sum::<u64>(), 5 + 10 + 20 + 30);
    }
}
