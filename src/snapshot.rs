//! Read-only sources of the baseline machine state: registers and physical pages

use anyhow::{ensure, Context, Result};
use x86_64::structures::paging::PageTableFlags;

use crate::addrs::{page_chunks, Cr3, Gpa, Gva, Page, PAGE_SIZE};
use crate::memory::GuestMemory;
use crate::page_table::Entry;
use crate::regs::CpuState;

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Address to start the page table allocations made by [`MemorySnapshot::map_4k`]
const START_CUSTOM_MAPPING: Gpa = Gpa(0x1000_0000);

/// Errors while loading a snapshot
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Register state (.regs file) missing from snapshot dir
    #[error("Register state (.regs file) missing from snapshot dir")]
    RegisterStateMissing,

    /// Physical memory (.physmem file) missing from snapshot dir
    #[error("Physical memory (.physmem file) missing from snapshot dir")]
    PhysicalMemoryMissing,

    /// The physical memory image is empty
    #[error("EmptyPhysicalMemory_{0:?}")]
    EmptyPhysicalMemory(PathBuf),

    /// mmap of the physical memory image failed
    #[error("MmapFailed_{0:?}")]
    MmapFailed(PathBuf),

    /// A large page was found while building a 4K mapping
    #[error("LargePageInTheWay_{0:x?}")]
    LargePageInTheWay(Gva),
}

/// The baseline the backend restores to. Read-only for the lifetime of a backend.
pub trait SnapshotSource {
    /// Contents of the physical page containing `gpa`, or `None` if the snapshot
    /// does not contain that page
    fn page(&self, gpa: Gpa) -> Option<&Page>;

    /// Register state at the time of the snapshot
    fn registers(&self) -> &CpuState;
}

impl<S: SnapshotSource + ?Sized> SnapshotSource for Box<S> {
    fn page(&self, gpa: Gpa) -> Option<&Page> {
        (**self).page(gpa)
    }

    fn registers(&self) -> &CpuState {
        (**self).registers()
    }
}

/// A snapshot held entirely in memory, mostly useful for building small guests by
/// hand
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    /// Physical pages present in the snapshot
    pages: BTreeMap<Gpa, Box<Page>>,

    /// Baseline registers
    registers: CpuState,

    /// Next physical page handed out for page tables by [`MemorySnapshot::map_4k`]
    next_table: Gpa,
}

impl Default for MemorySnapshot {
    fn default() -> Self {
        MemorySnapshot::new(CpuState::default())
    }
}

impl MemorySnapshot {
    /// Create an empty snapshot with the given registers
    #[must_use]
    pub fn new(registers: CpuState) -> Self {
        Self {
            pages: BTreeMap::new(),
            registers,
            next_table: START_CUSTOM_MAPPING,
        }
    }

    /// Mutable access to the baseline registers
    pub fn registers_mut(&mut self) -> &mut CpuState {
        &mut self.registers
    }

    /// Number of pages in the snapshot
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if the snapshot has no pages
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Write `bytes` at `gpa`, creating zeroed pages as needed
    pub fn write(&mut self, gpa: Gpa, bytes: &[u8]) {
        let mut offset = 0;
        for (addr, size) in page_chunks(gpa.0, bytes.len()) {
            let addr = Gpa(addr);
            let start = addr.page_offset();
            let page = GuestMemory::page(self, addr);
            page[start..start + size].copy_from_slice(&bytes[offset..offset + size]);
            offset += size;
        }
    }

    /// Find a physical page for a new page table, skipping pages already in use
    fn allocate_table(&mut self) -> Gpa {
        while self.pages.contains_key(&self.next_table) {
            self.next_table = self.next_table.offset(PAGE_SIZE as u64);
        }

        let table = self.next_table;
        self.pages.insert(table, Box::new([0; PAGE_SIZE]));
        table
    }

    /// Map `gva` to `gpa` as a 4K page in the page tables rooted at `cr3`, with `flags`
    /// on the final entry. Missing intermediate tables are allocated starting at
    /// physical address `0x1000_0000` and are writable, user accessible and
    /// executable.
    ///
    /// # Errors
    ///
    /// * An intermediate entry on the way is a large page
    pub fn map_4k(&mut self, cr3: Cr3, gva: Gva, gpa: Gpa, flags: PageTableFlags) -> Result<()> {
        let table_flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        let mut table = cr3.table();
        let [a, b, c, d] = gva.table_indexes();

        for index in [a, b, c] {
            let entry_addr = table.offset((index * 8) as u64);
            let entry = Entry(self.read_u64(entry_addr));

            if entry.present() {
                ensure!(!entry.page_size(), Error::LargePageInTheWay(gva));
                table = entry.address();
                continue;
            }

            let new_table = self.allocate_table();
            self.write(entry_addr, &Entry::new(new_table, table_flags).0.to_le_bytes());
            table = new_table;
        }

        let leaf = Entry::new(gpa, flags | PageTableFlags::PRESENT);
        self.write(table.offset((d * 8) as u64), &leaf.0.to_le_bytes());

        Ok(())
    }

    /// Read a little endian u64 at `gpa`
    fn read_u64(&mut self, gpa: Gpa) -> u64 {
        let offset = gpa.page_offset();
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&GuestMemory::page(self, gpa)[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }
}

impl GuestMemory for MemorySnapshot {
    fn page(&mut self, gpa: Gpa) -> &mut Page {
        self.pages
            .entry(gpa.page())
            .or_insert_with(|| Box::new([0; PAGE_SIZE]))
    }
}

impl SnapshotSource for MemorySnapshot {
    fn page(&self, gpa: Gpa) -> Option<&Page> {
        self.pages.get(&gpa.page()).map(|page| &**page)
    }

    fn registers(&self) -> &CpuState {
        &self.registers
    }
}

/// A snapshot directory holding a flat physical memory image (`*.physmem`, file
/// offset == physical address) and its register state (`*.regs`, JSON)
#[derive(Debug)]
pub struct RawSnapshot {
    /// Address of the private mapping of the physical memory image
    backing: u64,

    /// Size of the mapping
    size: u64,

    /// Baseline registers
    registers: CpuState,
}

impl Drop for RawSnapshot {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.backing as *mut libc::c_void, self.size as usize);
        }
    }
}

impl RawSnapshot {
    /// Open the snapshot found in `dir`
    ///
    /// # Errors
    ///
    /// * `dir` can't be read
    /// * The `.regs` or `.physmem` file is missing or malformed
    /// * Mapping the physical memory image fails
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let mut physmem = None;
        let mut regs = None;

        // Read the snapshot directory looking for the specific file extensions
        for file in dir
            .read_dir()
            .with_context(|| format!("Failed to read snapshot dir {dir:?}"))?
        {
            let file = file?;
            match file.path().extension().and_then(|ext| ext.to_str()) {
                Some("physmem") => physmem = Some(file.path()),
                Some("regs") => regs = Some(file.path()),
                _ => {}
            }
        }

        let regs = regs.ok_or(Error::RegisterStateMissing)?;
        let physmem = physmem.ok_or(Error::PhysicalMemoryMissing)?;

        let data = std::fs::read_to_string(&regs)
            .with_context(|| format!("Failed to read register state {regs:?}"))?;
        let registers = CpuState::from_json(&data)
            .with_context(|| format!("Failed to parse register state {regs:?}"))?;

        let (backing, size) = Self::map(&physmem)?;
        log::info!("Mapped {physmem:?} ({size:#x} bytes)");

        Ok(Self {
            backing,
            size,
            registers,
        })
    }

    /// Privately map the physical memory image
    fn map(path: &Path) -> Result<(u64, u64)> {
        let file = File::open(path).with_context(|| format!("Failed to open {path:?}"))?;
        let size = file.metadata()?.len();
        ensure!(size > 0, Error::EmptyPhysicalMemory(path.to_path_buf()));

        let mem_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };

        // If mmap fails, return an error
        ensure!(
            mem_ptr != libc::MAP_FAILED,
            Error::MmapFailed(path.to_path_buf())
        );

        Ok((mem_ptr as u64, size))
    }

    /// Size of the physical memory image
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl SnapshotSource for RawSnapshot {
    fn page(&self, gpa: Gpa) -> Option<&Page> {
        let page = gpa.page().0;
        if page.checked_add(PAGE_SIZE as u64)? > self.size {
            return None;
        }

        // UNSAFE: the page lies entirely inside the mapping, which lives as long as self
        Some(unsafe { &*((self.backing + page) as *const Page) })
    }

    fn registers(&self) -> &CpuState {
        &self.registers
    }
}
