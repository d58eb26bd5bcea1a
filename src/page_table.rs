//! Utilities to help walk an Intel 4-level page table

use bitflags::bitflags;
use x86_64::structures::paging::PageTableFlags;

use crate::addrs::{Cr3, Gpa, Gva};
use crate::memory::GuestMemory;

/// Mask of the physical address bits in a page table entry
const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// What a translation must allow for it to succeed. An empty set only requires
    /// the address to be present and ignores protections.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemoryValidate: u8 {
        /// The page must be readable
        const READ = 1 << 0;

        /// The page must be writable
        const WRITE = 1 << 1;

        /// The page must be executable
        const EXECUTE = 1 << 2;
    }
}

/// Reasons a translation can fail
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// No present entry at some level of the walk
    #[error("NotPresent_{gva:x?}_level{level}")]
    NotPresent {
        /// The address being translated
        gva: Gva,

        /// Level of the walk (0 is the top level table) that was not present
        level: usize,
    },

    /// The mapping exists but doesn't allow the requested access
    #[error("ProtectionViolation_{gva:x?}_{validate:?}")]
    ProtectionViolation {
        /// The address being translated
        gva: Gva,

        /// The access that was refused
        validate: MemoryValidate,
    },
}

/// A page table entry
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Entry(pub u64);

impl From<u64> for Entry {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl Entry {
    /// Create an entry pointing at `addr` with the given `flags`
    #[must_use]
    pub fn new(addr: Gpa, flags: PageTableFlags) -> Entry {
        Entry((addr.0 & ADDRESS_MASK) | flags.bits())
    }

    /// Get the [`PageTableFlags`] for this [`Entry`]
    #[inline]
    #[must_use]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Get the [`Gpa`] address for this [`Entry`]
    #[inline]
    #[must_use]
    pub fn address(self) -> Gpa {
        Gpa(self.0 & ADDRESS_MASK)
    }

    /// Returns `true` if the present bit is set
    #[inline]
    #[must_use]
    pub fn present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    /// Returns `true` if the page size bit is set
    #[inline]
    #[must_use]
    pub fn page_size(self) -> bool {
        self.flags().contains(PageTableFlags::HUGE_PAGE)
    }
}

/// The size of the memory containing the translated address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageSize {
    /// A page with 1 gigabyte (1GiB)
    Size1G,

    /// A page with 2 megabytes (2MiB)
    Size2M,

    /// A page with 4 kilobytes (4KiB)
    Size4K,
}

impl PageSize {
    /// Number of bytes covered by a page of this size
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size1G => 1024 * 1024 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4K => 4 * 1024,
        }
    }
}

/// The permissions for a translated address. Each bit is the AND of that bit across
/// every level of the walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Permissions {
    /// The page is writable
    pub writable: bool,

    /// The page is executable
    pub executable: bool,

    /// The page is accessible from ring 3
    pub user: bool,
}

impl Permissions {
    /// Check that these permissions allow every access in `validate`
    #[must_use]
    pub fn allows(self, validate: MemoryValidate) -> bool {
        if validate.contains(MemoryValidate::WRITE) && !self.writable {
            return false;
        }

        if validate.contains(MemoryValidate::EXECUTE) && !self.executable {
            return false;
        }

        true
    }
}

/// The result of a successful virtual address translation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    /// The virtual address for this translation
    pub gva: Gva,

    /// The physical address the virtual address translated to
    pub gpa: Gpa,

    /// The size of the translation page
    pub page_size: PageSize,

    /// Effective [`Permissions`] of the mapping
    pub perms: Permissions,

    /// Physical address and value of every entry read during the walk
    pub entries: [Option<(Gpa, Entry)>; 4],
}

/// Read the page table entry at `index` of the table at `table`
fn read_entry<M: GuestMemory + ?Sized>(mem: &mut M, table: Gpa, index: usize) -> (Gpa, Entry) {
    let entry_addr = table.offset((index * std::mem::size_of::<u64>()) as u64);
    let offset = entry_addr.page_offset();

    let page = mem.page(entry_addr.page());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&page[offset..offset + 8]);

    (entry_addr, Entry(u64::from_le_bytes(bytes)))
}

/// Translate `gva` through the page tables rooted at `cr3`, requiring the mapping
/// to allow every access in `validate`.
///
/// Page tables are read through `mem`, which populates them on demand.
///
/// # Errors
///
/// * [`TranslateError::NotPresent`] if an entry of the walk is not present
/// * [`TranslateError::ProtectionViolation`] if the mapping refuses `validate`
pub fn translate<M: GuestMemory + ?Sized>(
    mem: &mut M,
    cr3: Cr3,
    gva: Gva,
    validate: MemoryValidate,
) -> Result<Translation, TranslateError> {
    let mut table = cr3.table();

    let mut perms = Permissions {
        writable: true,
        executable: true,
        user: true,
    };

    // Get the offsets into the table for each page table level
    //
    // Each offset is 9 bits
    // Gva: 0baaaa_aaaa_abbb_bbbb_bbcc_cccc_cccd_dddd_dddd_0000_0000_0000
    //        [Lvl1index][Lvl2index][Lvl3index][Lvl4index]
    let table_indexes = gva.table_indexes();

    let mut entries = [None; 4];

    for (level, index) in table_indexes.iter().enumerate() {
        let (entry_addr, entry) = read_entry(mem, table, *index);
        entries[level] = Some((entry_addr, entry));

        if !entry.present() {
            return Err(TranslateError::NotPresent { gva, level });
        }

        let flags = entry.flags();
        perms.writable &= flags.contains(PageTableFlags::WRITABLE);
        perms.executable &= !flags.contains(PageTableFlags::NO_EXECUTE);
        perms.user &= flags.contains(PageTableFlags::USER_ACCESSIBLE);

        // The page size bit only means something in the PDPT and PD
        let page_size = match (level, entry.page_size()) {
            (1, true) => Some(PageSize::Size1G),
            (2, true) => Some(PageSize::Size2M),
            (3, _) => Some(PageSize::Size4K),
            _ => None,
        };

        if let Some(page_size) = page_size {
            if !perms.allows(validate) {
                return Err(TranslateError::ProtectionViolation { gva, validate });
            }

            let mask = page_size.bytes() - 1;
            let base = entry.address().0 & !mask;

            return Ok(Translation {
                gva,
                gpa: Gpa(base | (gva.0 & mask)),
                page_size,
                perms,
                entries,
            });
        }

        table = entry.address();
    }

    unreachable!("level 3 always terminates the walk")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{GpaMap, Page, PAGE_SIZE};

    /// Physical memory made of zero pages allocated on first touch
    #[derive(Default)]
    struct Sparse(GpaMap<Box<Page>>);

    impl GuestMemory for Sparse {
        fn page(&mut self, gpa: Gpa) -> &mut Page {
            self.0
                .entry(gpa.page())
                .or_insert_with(|| Box::new([0; PAGE_SIZE]))
        }
    }

    impl Sparse {
        fn set_entry(&mut self, table: u64, index: usize, entry: Entry) {
            let off = index * 8;
            self.page(Gpa(table))[off..off + 8].copy_from_slice(&entry.0.to_le_bytes());
        }
    }

    const RW: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

    /// Map `gva` -> `gpa` as a 4K page using tables at 0x1000..0x4000
    fn sparse_4k(gva: Gva, gpa: u64, leaf: PageTableFlags) -> Sparse {
        let mut mem = Sparse::default();
        let [a, b, c, d] = gva.table_indexes();
        mem.set_entry(0x1000, a, Entry::new(Gpa(0x2000), RW));
        mem.set_entry(0x2000, b, Entry::new(Gpa(0x3000), RW));
        mem.set_entry(0x3000, c, Entry::new(Gpa(0x4000), RW));
        mem.set_entry(0x4000, d, Entry::new(Gpa(gpa), leaf));
        mem
    }

    #[test]
    fn translate_4k() {
        let gva = Gva(0x7fff_1234_5678);
        let mut mem = sparse_4k(gva, 0x55_5000, RW);

        let tr = translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::READ).unwrap();
        assert_eq!(tr.gpa, Gpa(0x55_5678));
        assert_eq!(tr.page_size, PageSize::Size4K);
        assert!(tr.perms.writable);
        assert!(tr.entries.iter().all(Option::is_some));
    }

    #[test]
    fn cr3_flag_bits_are_ignored() {
        let gva = Gva(0x40_0000);
        let mut mem = sparse_4k(gva, 0x9000, RW);
        let tr = translate(&mut mem, Cr3(0x1018), gva, MemoryValidate::empty()).unwrap();
        assert_eq!(tr.gpa, Gpa(0x9000));
    }

    #[test]
    fn not_present_reports_the_level() {
        let mut mem = Sparse::default();
        let err = translate(&mut mem, Cr3(0x1000), Gva(0x1000), MemoryValidate::READ).unwrap_err();
        assert_eq!(
            err,
            TranslateError::NotPresent {
                gva: Gva(0x1000),
                level: 0
            }
        );

        let gva = Gva(0x40_0000);
        let mut mem = sparse_4k(gva, 0x9000, PageTableFlags::WRITABLE);
        let err = translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::READ).unwrap_err();
        assert!(matches!(err, TranslateError::NotPresent { level: 3, .. }));
    }

    #[test]
    fn protections_are_checked_only_when_requested() {
        let gva = Gva(0x40_0000);
        let read_only = PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE;
        let mut mem = sparse_4k(gva, 0x9000, read_only);

        assert!(translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::READ).is_ok());
        assert!(translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::empty()).is_ok());

        let err = translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::WRITE).unwrap_err();
        assert!(matches!(err, TranslateError::ProtectionViolation { .. }));

        let err = translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::EXECUTE).unwrap_err();
        assert!(matches!(err, TranslateError::ProtectionViolation { .. }));
    }

    #[test]
    fn read_only_upper_level_wins() {
        let gva = Gva(0x40_0000);
        let mut mem = sparse_4k(gva, 0x9000, RW);
        let [a, ..] = gva.table_indexes();
        mem.set_entry(0x1000, a, Entry::new(Gpa(0x2000), PageTableFlags::PRESENT));

        let err = translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::WRITE).unwrap_err();
        assert!(matches!(err, TranslateError::ProtectionViolation { .. }));
    }

    #[test]
    fn large_pages() {
        let huge = RW | PageTableFlags::HUGE_PAGE;

        // 2MiB page in the PD, with the PAT bit (bit 12) set in the entry
        let gva = Gva(0x4012_3456);
        let mut mem = Sparse::default();
        let [a, b, c, _] = gva.table_indexes();
        mem.set_entry(0x1000, a, Entry::new(Gpa(0x2000), RW));
        mem.set_entry(0x2000, b, Entry::new(Gpa(0x3000), RW));
        mem.set_entry(0x3000, c, Entry(0x80_0000 | 0x1000 | huge.bits()));

        let tr = translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::READ).unwrap();
        assert_eq!(tr.page_size, PageSize::Size2M);
        assert_eq!(tr.gpa, Gpa(0x80_0000 | (gva.0 & 0x1f_ffff)));

        // 1GiB page in the PDPT
        let mut mem = Sparse::default();
        mem.set_entry(0x1000, a, Entry::new(Gpa(0x2000), RW));
        mem.set_entry(0x2000, b, Entry::new(Gpa(0x4000_0000), huge));
        let tr = translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::READ).unwrap();
        assert_eq!(tr.page_size, PageSize::Size1G);
        assert_eq!(tr.gpa, Gpa(0x4000_0000 | (gva.0 & 0x3fff_ffff)));
    }

    #[test]
    fn page_size_bit_in_pml4_is_a_table_pointer() {
        let gva = Gva(0x40_0000);
        let mut mem = sparse_4k(gva, 0x9000, RW);
        let [a, ..] = gva.table_indexes();
        mem.set_entry(
            0x1000,
            a,
            Entry::new(Gpa(0x2000), RW | PageTableFlags::HUGE_PAGE),
        );
        let tr = translate(&mut mem, Cr3(0x1000), gva, MemoryValidate::READ).unwrap();
        assert_eq!(tr.gpa, Gpa(0x9000));
    }
}
