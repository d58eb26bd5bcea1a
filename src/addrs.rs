//! Guest address types and the address-keyed containers used across the backend

use serde::{Deserialize, Serialize};

use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasherDefault, Hasher};

/// Size of a guest page
pub const PAGE_SIZE: usize = 0x1000;

/// Mask of the in-page offset bits of an address
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// The contents of one guest physical page
pub type Page = [u8; PAGE_SIZE];

/// A guest physical address
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gpa(pub u64);

impl Gpa {
    /// Return a [`Gpa`] `offset` bytes away from `self`
    ///
    /// Example:
    ///
    /// ```
    /// # use snapemu::Gpa;
    /// let page = Gpa(0xdead_0000);
    /// let entry = page.offset(0x1234);
    /// assert!(entry.0 == 0xdead_1234);
    /// ```
    #[must_use]
    pub const fn offset(self, offset: u64) -> Gpa {
        Gpa(self.0.wrapping_add(offset))
    }

    /// Return the page that contains this [`Gpa`]
    ///
    /// Example:
    ///
    /// ```
    /// # use snapemu::Gpa;
    /// let addr = Gpa(0xdead_1234);
    /// assert!(addr.page().0 == 0xdead_1000);
    /// ```
    #[must_use]
    pub const fn page(self) -> Gpa {
        Gpa(self.0 & !PAGE_MASK)
    }

    /// Offset of this address inside of its page
    #[must_use]
    pub const fn page_offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }
}

impl std::ops::Deref for Gpa {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for Gpa {
    fn from(val: u64) -> Gpa {
        Gpa(val)
    }
}

/// A guest virtual address
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gva(pub u64);

impl From<u64> for Gva {
    fn from(val: u64) -> Gva {
        Gva(val)
    }
}

impl Gva {
    /// Return a [`Gva`] `offset` bytes away from `self`
    #[must_use]
    pub const fn offset(self, offset: u64) -> Gva {
        Gva(self.0.wrapping_add(offset))
    }

    /// Get the 4 page table indexes that this [`Gva`] uses when translating via a
    /// 4-level page table
    #[must_use]
    pub const fn table_indexes(self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1ff) as usize,
            ((self.0 >> 30) & 0x1ff) as usize,
            ((self.0 >> 21) & 0x1ff) as usize,
            ((self.0 >> 12) & 0x1ff) as usize,
        ]
    }

    /// Return the page that contains this [`Gva`]
    #[must_use]
    pub const fn page(self) -> Gva {
        Gva(self.0 & !PAGE_MASK)
    }
}

impl std::ops::Deref for Gva {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::str::FromStr for Gva {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let no_prefix = s.trim_start_matches("0x");

        // Attempt to parse the hex digit
        Ok(Gva(u64::from_str_radix(no_prefix, 16)?))
    }
}

/// A wrapper around the cr3, the root of the guest page tables
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cr3(pub u64);

impl Cr3 {
    /// Physical address of the top level page table, without the PCID and flag bits
    #[must_use]
    pub const fn table(self) -> Gpa {
        Gpa(self.0 & 0x000f_ffff_ffff_f000)
    }
}

impl std::ops::Deref for Cr3 {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Split `[addr, addr + len)` into `(addr, len)` chunks that never straddle a page
/// boundary. Guest pages that are contiguous virtually are not necessarily
/// contiguous physically, so every access larger than a byte goes through this.
pub fn page_chunks(addr: u64, len: usize) -> impl Iterator<Item = (u64, usize)> {
    let mut curr = addr;
    let mut left = len;

    std::iter::from_fn(move || {
        if left == 0 {
            return None;
        }

        let to_end_of_page = PAGE_SIZE - (curr & PAGE_MASK) as usize;
        let size = to_end_of_page.min(left);
        let chunk = (curr, size);

        curr = curr.wrapping_add(size as u64);
        left -= size;

        Some(chunk)
    })
}

/// Hasher that hands the key back untouched.
///
/// Guest addresses are already well distributed at page granularity, so mixing
/// them only costs time on every memory access. The value is rotated so the page
/// frame number lands in the low bits the table uses for bucket selection and the
/// in-page offset lands in the high bits. Correctness of the maps never depends
/// on the quality of this hash, only their performance does.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0.rotate_right(12)
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 = (self.0 << 8) | u64::from(*byte);
        }
    }

    #[inline]
    fn write_u64(&mut self, val: u64) {
        self.0 = val;
    }
}

/// Builder for [`IdentityHasher`]
pub type IdentityBuildHasher = BuildHasherDefault<IdentityHasher>;

/// Map keyed by guest physical address
pub type GpaMap<V> = HashMap<Gpa, V, IdentityBuildHasher>;

/// Set of guest physical addresses
pub type GpaSet = HashSet<Gpa, IdentityBuildHasher>;

/// Map keyed by guest virtual address
pub type GvaMap<V> = HashMap<Gva, V, IdentityBuildHasher>;

/// Set of guest virtual addresses
pub type GvaSet = HashSet<Gva, IdentityBuildHasher>;
