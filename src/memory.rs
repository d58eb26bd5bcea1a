//! Physical memory store: a sparse cache of guest pages populated from the snapshot
//! on first touch, plus the set of pages written since the last restore

use anyhow::{ensure, Context, Result};

use crate::addrs::{page_chunks, Cr3, Gpa, GpaMap, GpaSet, Gva, Page, PAGE_SIZE};
use crate::page_table::{translate, MemoryValidate, TranslateError, Translation};
use crate::snapshot::SnapshotSource;

/// Anything that can hand out mutable guest physical pages by address
pub trait GuestMemory {
    /// The page containing `gpa`, populated if needed
    fn page(&mut self, gpa: Gpa) -> &mut Page;
}

/// Custom errors [`PhysMemory`] can throw
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Attempted to write to an unmapped virtual address
    #[error("WriteToUnmappedVirtualAddress_{0:x?}_{1:x?}")]
    WriteToUnmappedVirtualAddress(Gva, Cr3),

    /// Attempted to read from an unmapped virtual address
    #[error("ReadFromUnmappedVirtualAddress_{0:x?}_{1:x?}")]
    ReadFromUnmappedVirtualAddress(Gva, Cr3),

    /// The access wraps around the end of the address space
    #[error("AddressOverflow_{0:#x}_{1:#x}")]
    AddressOverflow(u64, usize),
}

/// Determines if a write should add the written physical pages to the dirty list
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteMem {
    /// The write for this memory should add the physical page to the dirty list
    Dirty,

    /// The write for this memory should not add the physical page to the dirty list
    NotDirty,
}

/// Lazily populated guest physical memory backed by a [`SnapshotSource`]
pub struct PhysMemory<S> {
    /// The read-only baseline
    snapshot: S,

    /// Pages touched so far. A page absent from the snapshot is cached as zeros.
    pages: GpaMap<Box<Page>>,

    /// Pages written since the last [`PhysMemory::restore`]
    dirty: GpaSet,
}

impl<S: SnapshotSource> PhysMemory<S> {
    /// Create an empty store over `snapshot`
    pub fn new(snapshot: S) -> Self {
        Self {
            snapshot,
            pages: GpaMap::default(),
            dirty: GpaSet::default(),
        }
    }

    /// The baseline this store restores to
    pub fn snapshot(&self) -> &S {
        &self.snapshot
    }

    /// Copy the baseline contents of the page at `gpa` into `page`
    fn copy_baseline(snapshot: &S, gpa: Gpa, page: &mut Page) {
        match snapshot.page(gpa) {
            Some(baseline) => page.copy_from_slice(baseline),
            None => page.fill(0),
        }
    }

    /// Get the cached page containing `gpa`, copying it from the snapshot on first
    /// access
    fn populate(&mut self, gpa: Gpa) -> &mut Page {
        let page = gpa.page();
        let snapshot = &self.snapshot;

        self.pages.entry(page).or_insert_with(|| {
            log::debug!("Populating page {:#x}", page.0);
            let mut new_page = Box::new([0_u8; PAGE_SIZE]);
            Self::copy_baseline(snapshot, page, &mut new_page);
            new_page
        })
    }

    /// Returns `true` if the page containing `gpa` has been populated
    pub fn is_populated(&self, gpa: Gpa) -> bool {
        self.pages.contains_key(&gpa.page())
    }

    /// Number of populated pages
    pub fn populated_pages(&self) -> usize {
        self.pages.len()
    }

    /// Read-only view of the page containing `gpa`: the cached copy if populated,
    /// otherwise the baseline. `None` if neither exists.
    pub fn raw_page(&self, gpa: Gpa) -> Option<&Page> {
        self.pages
            .get(&gpa.page())
            .map(|page| &**page)
            .or_else(|| self.snapshot.page(gpa))
    }

    /// Mutable view of the page containing `gpa`, populating it if it exists in the
    /// snapshot. `None` if the page is neither populated nor in the snapshot.
    ///
    /// Writes through this view are not tracked; call [`PhysMemory::mark_dirty`]
    /// for any page modified here.
    pub fn raw_page_mut(&mut self, gpa: Gpa) -> Option<&mut Page> {
        if !self.is_populated(gpa) && self.snapshot.page(gpa).is_none() {
            return None;
        }

        Some(self.populate(gpa))
    }

    /// Add the page containing `gpa` to the dirty set. Returns `true` if the page
    /// was not already dirty.
    pub fn mark_dirty(&mut self, gpa: Gpa) -> bool {
        // A dirty page is always a populated page
        self.populate(gpa);
        self.dirty.insert(gpa.page())
    }

    /// Add every page spanned by `[gpa, gpa + len)` to the dirty set
    pub fn mark_dirty_range(&mut self, gpa: Gpa, len: usize) {
        for (addr, _) in page_chunks(gpa.0, len) {
            self.mark_dirty(Gpa(addr));
        }
    }

    /// Returns `true` if the page containing `gpa` is dirty
    pub fn is_dirty(&self, gpa: Gpa) -> bool {
        self.dirty.contains(&gpa.page())
    }

    /// Pages written since the last restore
    pub fn dirty_pages(&self) -> &GpaSet {
        &self.dirty
    }

    /// Reset every dirty page to its baseline contents and clear the dirty set.
    /// Returns the number of pages restored.
    pub fn restore(&mut self) -> usize {
        let restored = self.dirty.len();

        for gpa in self.dirty.drain() {
            if let Some(page) = self.pages.get_mut(&gpa) {
                Self::copy_baseline(&self.snapshot, gpa, page);
            }
        }

        log::debug!("Restored {restored} dirty pages");
        restored
    }

    /// Read `buf.len()` bytes of physical memory starting at `gpa`
    pub fn read_phys(&mut self, gpa: Gpa, buf: &mut [u8]) -> Result<()> {
        ensure!(
            gpa.0.checked_add(buf.len() as u64).is_some(),
            Error::AddressOverflow(gpa.0, buf.len())
        );

        let mut offset = 0;
        for (addr, size) in page_chunks(gpa.0, buf.len()) {
            let addr = Gpa(addr);
            let start = addr.page_offset();
            let page = self.populate(addr);
            buf[offset..offset + size].copy_from_slice(&page[start..start + size]);
            offset += size;
        }

        Ok(())
    }

    /// Write `buf` to physical memory starting at `gpa`
    pub fn write_phys(&mut self, gpa: Gpa, buf: &[u8], dirty: WriteMem) -> Result<()> {
        ensure!(
            gpa.0.checked_add(buf.len() as u64).is_some(),
            Error::AddressOverflow(gpa.0, buf.len())
        );

        let mut offset = 0;
        for (addr, size) in page_chunks(gpa.0, buf.len()) {
            let addr = Gpa(addr);
            let start = addr.page_offset();
            let page = self.populate(addr);
            page[start..start + size].copy_from_slice(&buf[offset..offset + size]);
            offset += size;

            if dirty == WriteMem::Dirty {
                self.dirty.insert(addr.page());
            }
        }

        Ok(())
    }

    /// Translate `gva` using the page tables rooted at `cr3`
    ///
    /// # Errors
    ///
    /// * See [`crate::page_table::translate`]
    pub fn translate(
        &mut self,
        cr3: Cr3,
        gva: Gva,
        validate: MemoryValidate,
    ) -> Result<Translation, TranslateError> {
        translate(self, cr3, gva, validate)
    }

    /// Read `buf.len()` bytes starting at `gva`. Each page of the range is
    /// translated separately since contiguous virtual pages need not be contiguous
    /// physically.
    ///
    /// # Errors
    ///
    /// * A page of the range is not mapped
    pub fn read_virt(&mut self, cr3: Cr3, gva: Gva, buf: &mut [u8]) -> Result<()> {
        ensure!(
            gva.0.checked_add(buf.len() as u64).is_some(),
            Error::AddressOverflow(gva.0, buf.len())
        );

        let mut offset = 0;
        for (addr, size) in page_chunks(gva.0, buf.len()) {
            let addr = Gva(addr);
            let gpa = self
                .translate(cr3, addr, MemoryValidate::empty())
                .with_context(|| Error::ReadFromUnmappedVirtualAddress(addr, cr3))?
                .gpa;

            self.read_phys(gpa, &mut buf[offset..offset + size])?;
            offset += size;
        }

        Ok(())
    }

    /// Write `buf` starting at `gva`
    ///
    /// # Errors
    ///
    /// * A page of the range is not mapped. Pages before it have already been
    ///   written.
    pub fn write_virt(&mut self, cr3: Cr3, gva: Gva, buf: &[u8], dirty: WriteMem) -> Result<()> {
        ensure!(
            gva.0.checked_add(buf.len() as u64).is_some(),
            Error::AddressOverflow(gva.0, buf.len())
        );

        let mut offset = 0;
        for (addr, size) in page_chunks(gva.0, buf.len()) {
            let addr = Gva(addr);
            let gpa = self
                .translate(cr3, addr, MemoryValidate::empty())
                .with_context(|| Error::WriteToUnmappedVirtualAddress(addr, cr3))?
                .gpa;

            self.write_phys(gpa, &buf[offset..offset + size], dirty)?;
            offset += size;
        }

        Ok(())
    }

    /// Read a little endian `u64` at `gva`
    ///
    /// # Errors
    ///
    /// * The address is not mapped
    pub fn read_virt_u64(&mut self, cr3: Cr3, gva: Gva) -> Result<u64> {
        let mut bytes = [0_u8; 8];
        self.read_virt(cr3, gva, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

impl<S: SnapshotSource> GuestMemory for PhysMemory<S> {
    fn page(&mut self, gpa: Gpa) -> &mut Page {
        self.populate(gpa)
    }
}
