//! Cpumask - CPU bitset algebra
//!
//! Two flavours:
//! - [`CpuMask`]: a plain value, used for snapshots, affinity and scratch
//!   computations. All algebra is total over a well-formed mask.
//! - [`AtomicCpuMask`]: shared, mutated bit by bit with atomic RMW. Backs the
//!   idle masks and the masks policies obtain from `cpumask_create()`.
//!
//! Bits at or above `nr_cpus` are always zero.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::error::{Result, ScxError};

/// Maximum supported CPUs
pub const MAX_CPUS: usize = 512;

const BITS_PER_WORD: usize = 64;
const WORDS: usize = MAX_CPUS / BITS_PER_WORD;

/// Last CPU handed out by `any_distribute`. Shared by every mask, updated
/// without ordering: concurrent callers may observe each other's stale value.
static DISTRIBUTE_PREV: AtomicU32 = AtomicU32::new(0);

#[inline]
fn word_bit(cpu: u32) -> (usize, u64) {
    (cpu as usize / BITS_PER_WORD, 1u64 << (cpu as usize % BITS_PER_WORD))
}

/// Mask of the valid bits in word `idx` for a mask of `nr_cpus` bits
#[inline]
fn valid_bits(idx: usize, nr_cpus: u32) -> u64 {
    let lo = idx * BITS_PER_WORD;
    let nr = nr_cpus as usize;
    if nr >= lo + BITS_PER_WORD {
        u64::MAX
    } else if nr <= lo {
        0
    } else {
        (1u64 << (nr - lo)) - 1
    }
}

/// CPU bitset of `nr_cpus` bits
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMask {
    bits: [u64; WORDS],
    nr_cpus: u32,
}

impl CpuMask {
    /// Create an empty mask
    pub const fn new(nr_cpus: u32) -> Self {
        let nr_cpus = if nr_cpus as usize > MAX_CPUS { MAX_CPUS as u32 } else { nr_cpus };
        Self { bits: [0; WORDS], nr_cpus }
    }

    /// Create a mask with every CPU set
    pub fn all(nr_cpus: u32) -> Self {
        let mut mask = Self::new(nr_cpus);
        mask.setall();
        mask
    }

    /// Create a mask from a list of CPUs. Out-of-range CPUs are dropped.
    pub fn from_cpus<I: IntoIterator<Item = u32>>(nr_cpus: u32, cpus: I) -> Self {
        let mut mask = Self::new(nr_cpus);
        for cpu in cpus {
            mask.set_cpu(cpu);
        }
        mask
    }

    /// Parse a hexadecimal mask such as `0xff00_ff00`.
    ///
    /// Fails on non-hex characters and on bits at or above `nr_cpus`.
    pub fn from_hex(s: &str, nr_cpus: u32) -> Result<Self> {
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        let mut mask = Self::new(nr_cpus);
        let mut nibble_idx = 0u32;

        for c in digits.chars().rev() {
            if c == '_' {
                continue;
            }
            let v = c
                .to_digit(16)
                .ok_or(ScxError::InvalidCpumask { reason: "non-hex character" })?;
            for bit in 0..4 {
                if v & (1 << bit) == 0 {
                    continue;
                }
                let cpu = nibble_idx * 4 + bit;
                if cpu >= mask.nr_cpus {
                    return Err(ScxError::InvalidCpumask { reason: "cpu above nr_cpus" });
                }
                mask.set_cpu(cpu);
            }
            nibble_idx += 1;
        }

        if nibble_idx == 0 {
            return Err(ScxError::InvalidCpumask { reason: "empty string" });
        }
        Ok(mask)
    }

    /// Width of the mask
    #[inline]
    pub fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    /// Set CPU bit. Out-of-range CPUs are ignored.
    #[inline]
    pub fn set_cpu(&mut self, cpu: u32) {
        if cpu < self.nr_cpus {
            let (w, b) = word_bit(cpu);
            self.bits[w] |= b;
        }
    }

    /// Clear CPU bit
    #[inline]
    pub fn clear_cpu(&mut self, cpu: u32) {
        if cpu < self.nr_cpus {
            let (w, b) = word_bit(cpu);
            self.bits[w] &= !b;
        }
    }

    /// Check if CPU is set. Out-of-range CPUs read as clear.
    #[inline]
    pub fn test_cpu(&self, cpu: u32) -> bool {
        if cpu >= self.nr_cpus {
            return false;
        }
        let (w, b) = word_bit(cpu);
        self.bits[w] & b != 0
    }

    /// Set CPU bit, returning its previous value
    pub fn test_and_set_cpu(&mut self, cpu: u32) -> bool {
        let old = self.test_cpu(cpu);
        self.set_cpu(cpu);
        old
    }

    /// Clear CPU bit, returning its previous value
    pub fn test_and_clear_cpu(&mut self, cpu: u32) -> bool {
        let old = self.test_cpu(cpu);
        self.clear_cpu(cpu);
        old
    }

    /// Set every CPU
    pub fn setall(&mut self) {
        for (idx, w) in self.bits.iter_mut().enumerate() {
            *w = valid_bits(idx, self.nr_cpus);
        }
    }

    /// Clear every CPU
    pub fn clear(&mut self) {
        self.bits = [0; WORDS];
    }

    fn zip_with(&self, other: &Self, f: impl Fn(u64, u64) -> u64) -> Self {
        let mut out = Self::new(self.nr_cpus);
        for idx in 0..WORDS {
            out.bits[idx] = f(self.bits[idx], other.bits[idx]) & valid_bits(idx, self.nr_cpus);
        }
        out
    }

    /// Intersection
    pub fn and(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a & b)
    }

    /// Union
    pub fn or(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a | b)
    }

    /// Symmetric difference
    pub fn xor(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a ^ b)
    }

    /// `self & !other`
    pub fn andnot(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a & !b)
    }

    /// Complement within `nr_cpus`
    pub fn complement(&self) -> Self {
        self.zip_with(self, |a, _| !a)
    }

    /// Same set bits
    pub fn equal(&self, other: &Self) -> bool {
        self.bits == other.bits
    }

    /// At least one CPU in common
    pub fn intersects(&self, other: &Self) -> bool {
        self.bits.iter().zip(other.bits.iter()).any(|(a, b)| a & b != 0)
    }

    /// Every CPU of `self` is also in `other`
    pub fn subset(&self, other: &Self) -> bool {
        self.bits.iter().zip(other.bits.iter()).all(|(a, b)| a & !b == 0)
    }

    /// No CPU set
    pub fn empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Every CPU below `nr_cpus` set
    pub fn full(&self) -> bool {
        self.bits
            .iter()
            .enumerate()
            .all(|(idx, &w)| w == valid_bits(idx, self.nr_cpus))
    }

    /// Count set CPUs
    pub fn weight(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    /// First set CPU
    pub fn first(&self) -> Option<u32> {
        self.next_set(0)
    }

    /// First clear CPU
    pub fn first_zero(&self) -> Option<u32> {
        self.complement().first()
    }

    /// First set CPU at or after `from`
    pub fn next_set(&self, from: u32) -> Option<u32> {
        if from >= self.nr_cpus {
            return None;
        }
        let mut idx = from as usize / BITS_PER_WORD;
        let mut word = self.bits[idx] & (u64::MAX << (from as usize % BITS_PER_WORD));
        loop {
            if word != 0 {
                let cpu = (idx * BITS_PER_WORD) as u32 + word.trailing_zeros();
                return (cpu < self.nr_cpus).then_some(cpu);
            }
            idx += 1;
            if idx >= WORDS {
                return None;
            }
            word = self.bits[idx];
        }
    }

    /// First set CPU strictly after `prev`, wrapping around to the start
    pub fn next_wrap(&self, prev: u32) -> Option<u32> {
        let start = prev.saturating_add(1);
        self.next_set(start).or_else(|| self.first())
    }

    /// Pick a set CPU, rotating through the mask across calls.
    ///
    /// The start point is the CPU returned by the previous call (from any
    /// mask), so repeated calls on an unchanged mask with more than one CPU
    /// walk through its members instead of returning the same one.
    pub fn any_distribute(&self) -> Option<u32> {
        let prev = DISTRIBUTE_PREV.load(Ordering::Relaxed);
        let cpu = self.next_wrap(prev)?;
        DISTRIBUTE_PREV.store(cpu, Ordering::Relaxed);
        Some(cpu)
    }

    /// `any_distribute` over `self & other`
    pub fn any_and_distribute(&self, other: &Self) -> Option<u32> {
        self.and(other).any_distribute()
    }

    /// Iterate set CPUs in ascending order
    pub fn iter(&self) -> CpuMaskIter<'_> {
        CpuMaskIter { mask: self, next: 0 }
    }

    /// Raw words, least significant CPU first
    pub fn as_raw_slice(&self) -> &[u64] {
        let words = (self.nr_cpus as usize + BITS_PER_WORD - 1) / BITS_PER_WORD;
        &self.bits[..words]
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({})", self)
    }
}

/// `nr:<bits>`, highest CPU first
impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:<", self.nr_cpus)?;
        for cpu in (0..self.nr_cpus).rev() {
            f.write_str(if self.test_cpu(cpu) { "1" } else { "0" })?;
        }
        f.write_str(">")
    }
}

/// Iterator over the set CPUs of a mask
pub struct CpuMaskIter<'a> {
    mask: &'a CpuMask,
    next: u32,
}

impl Iterator for CpuMaskIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let cpu = self.mask.next_set(self.next)?;
        self.next = cpu + 1;
        Some(cpu)
    }
}

impl<'a> IntoIterator for &'a CpuMask {
    type Item = u32;
    type IntoIter = CpuMaskIter<'a>;

    fn into_iter(self) -> CpuMaskIter<'a> {
        self.iter()
    }
}

/// Shared CPU bitset with atomic bit operations
pub struct AtomicCpuMask {
    words: [AtomicU64; WORDS],
    nr_cpus: u32,
}

impl AtomicCpuMask {
    /// Create an empty mask
    pub const fn new(nr_cpus: u32) -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        let nr_cpus = if nr_cpus as usize > MAX_CPUS { MAX_CPUS as u32 } else { nr_cpus };
        Self { words: [ZERO; WORDS], nr_cpus }
    }

    /// Width of the mask
    #[inline]
    pub fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    #[inline]
    pub fn set_cpu(&self, cpu: u32) {
        if cpu < self.nr_cpus {
            let (w, b) = word_bit(cpu);
            self.words[w].fetch_or(b, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn clear_cpu(&self, cpu: u32) {
        if cpu < self.nr_cpus {
            let (w, b) = word_bit(cpu);
            self.words[w].fetch_and(!b, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn test_cpu(&self, cpu: u32) -> bool {
        if cpu >= self.nr_cpus {
            return false;
        }
        let (w, b) = word_bit(cpu);
        self.words[w].load(Ordering::Relaxed) & b != 0
    }

    /// Atomically set CPU bit, returning its previous value
    pub fn test_and_set_cpu(&self, cpu: u32) -> bool {
        if cpu >= self.nr_cpus {
            return false;
        }
        let (w, b) = word_bit(cpu);
        self.words[w].fetch_or(b, Ordering::AcqRel) & b != 0
    }

    /// Atomically clear CPU bit, returning its previous value.
    ///
    /// Exactly one of several racing callers sees `true` for a set bit.
    pub fn test_and_clear_cpu(&self, cpu: u32) -> bool {
        if cpu >= self.nr_cpus {
            return false;
        }
        let (w, b) = word_bit(cpu);
        self.words[w].fetch_and(!b, Ordering::AcqRel) & b != 0
    }

    pub fn setall(&self) {
        for (idx, w) in self.words.iter().enumerate() {
            w.store(valid_bits(idx, self.nr_cpus), Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Snapshot. Words are read one by one and may not be mutually consistent.
    pub fn load(&self) -> CpuMask {
        let mut mask = CpuMask::new(self.nr_cpus);
        for (dst, src) in mask.bits.iter_mut().zip(self.words.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        mask
    }

    /// Overwrite with `src`, truncated to this mask's width
    pub fn copy(&self, src: &CpuMask) {
        for (idx, w) in self.words.iter().enumerate() {
            w.store(src.bits[idx] & valid_bits(idx, self.nr_cpus), Ordering::Relaxed);
        }
    }

    /// `self = a & b`. Returns whether the result is non-empty.
    pub fn and(&self, a: &CpuMask, b: &CpuMask) -> bool {
        let res = a.and(b);
        self.copy(&res);
        !res.empty()
    }

    /// `self = a | b`
    pub fn or(&self, a: &CpuMask, b: &CpuMask) {
        self.copy(&a.or(b));
    }

    /// `self = a ^ b`
    pub fn xor(&self, a: &CpuMask, b: &CpuMask) {
        self.copy(&a.xor(b));
    }
}

impl fmt::Debug for AtomicCpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicCpuMask({})", self.load())
    }
}
