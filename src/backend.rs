//! The interface an execution backend exposes to the fuzzing loop and to hooks

use anyhow::Result;

use crate::addrs::{Cr3, Gpa, GvaSet, Gva, Page};
use crate::breakpoint::BreakpointHandler;
use crate::page_table::{MemoryValidate, TranslateError};
use crate::regs::{CpuState, Register};
use crate::stats::RunStats;
use crate::trace::TraceKind;
use crate::TestcaseResult;

use std::path::Path;

/// Guest inspection and modification, available both between runs and from hooks
/// during a run
pub trait GuestAccess {
    /// Read a register
    fn reg(&self, reg: Register) -> u64;

    /// Write a register, returning its previous value
    fn set_reg(&mut self, reg: Register, value: u64) -> u64;

    /// Next value of the deterministic `rdrand` generator
    fn rdrand(&mut self) -> u64;

    /// Translate `gva` with the current page table root
    ///
    /// # Errors
    ///
    /// * The address is not mapped or the mapping refuses `validate`
    fn translate(&mut self, gva: Gva, validate: MemoryValidate) -> Result<Gpa, TranslateError>;

    /// Direct access to the physical page containing `gpa`. `None` if the page is
    /// neither populated nor in the snapshot. Writes through it must be followed by
    /// [`GuestAccess::mark_dirty`].
    fn raw_page(&mut self, gpa: Gpa) -> Option<&mut Page>;

    /// Mark the page containing `gpa` as dirty
    fn mark_dirty(&mut self, gpa: Gpa);

    /// Mark every page in `[gpa, gpa + len)` as dirty
    fn mark_dirty_range(&mut self, gpa: Gpa, len: usize);

    /// Mark every physical page backing `[gva, gva + len)` as dirty
    ///
    /// # Errors
    ///
    /// * A page of the range is not mapped
    fn mark_dirty_virt_range(&mut self, gva: Gva, len: usize) -> Result<()>;

    /// Make sure `[gva, gva + len)` is backed by populated physical pages. If a page
    /// of the range isn't mapped, a page fault for it is injected into the guest and
    /// `true` is returned.
    ///
    /// # Errors
    ///
    /// * The range wraps around the address space
    fn ensure_mapped(&mut self, gva: Gva, len: usize) -> Result<bool>;

    /// Read guest virtual memory
    ///
    /// # Errors
    ///
    /// * A page of the range is not mapped
    fn virt_read(&mut self, gva: Gva, buf: &mut [u8]) -> Result<()>;

    /// Write guest virtual memory and mark the written pages dirty
    ///
    /// # Errors
    ///
    /// * A page of the range is not mapped
    fn virt_write_dirty(&mut self, gva: Gva, buf: &[u8]) -> Result<()>;

    /// Read guest physical memory
    ///
    /// # Errors
    ///
    /// * The range wraps around the address space
    fn phys_read(&mut self, gpa: Gpa, buf: &mut [u8]) -> Result<()>;

    /// Current page table root
    fn cr3(&self) -> Cr3 {
        Cr3(self.reg(Register::Cr3))
    }

    /// Current instruction pointer
    fn rip(&self) -> Gva {
        Gva(self.reg(Register::Rip))
    }

    /// Read a little endian `u64` from guest virtual memory
    ///
    /// # Errors
    ///
    /// * The address is not mapped
    fn virt_read_u64(&mut self, gva: Gva) -> Result<u64> {
        let mut bytes = [0_u8; 8];
        self.virt_read(gva, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Return from the current function as if it returned `value`: pop the return
    /// address into `rip` and set `rax`
    ///
    /// # Errors
    ///
    /// * The stack is not mapped
    fn simulate_return(&mut self, value: u64) -> Result<()> {
        let rsp = self.reg(Register::Rsp);
        let ret = self.virt_read_u64(Gva(rsp))?;

        self.set_reg(Register::Rip, ret);
        self.set_reg(Register::Rsp, rsp.wrapping_add(8));
        self.set_reg(Register::Rax, value);
        Ok(())
    }
}

/// What a breakpoint handler can do while the guest runs
pub trait HookContext: GuestAccess {
    /// End the run with `result` at the next instruction boundary. The first
    /// decision of a run sticks.
    fn stop(&mut self, result: TestcaseResult);

    /// The testcase of the current run
    fn testcase(&self) -> &[u8];

    /// Instructions retired so far in this run
    fn instructions_executed(&self) -> u64;

    /// Every address covered during the campaign, including this run
    fn aggregated_coverage(&self) -> &GvaSet;
}

/// An execution backend. Backends differ in how they execute the guest, not in
/// how the fuzzing loop drives them.
pub trait Backend: GuestAccess {
    /// Execute the snapshot against `testcase`
    ///
    /// # Panics
    ///
    /// * The previous run was not followed by [`Backend::restore`]
    fn run(&mut self, testcase: &[u8]) -> TestcaseResult;

    /// Reset memory and registers to the snapshot, using `state` as the register
    /// file
    ///
    /// # Errors
    ///
    /// * The backend failed to reset its execution engine
    fn restore(&mut self, state: &CpuState) -> Result<()>;

    /// Limit the number of instructions per run. `0` means no limit.
    fn set_limit(&mut self, limit: u64);

    /// Write `kind` trace records to `path`. A `None` path turns tracing off.
    ///
    /// # Errors
    ///
    /// * The trace file can't be created
    fn set_trace_sink(&mut self, path: Option<&Path>, kind: TraceKind) -> Result<()>;

    /// Call `handler` right before the instruction at `gva` executes
    ///
    /// # Errors
    ///
    /// * `gva` isn't mapped in the snapshot's address space
    fn set_breakpoint(&mut self, gva: Gva, handler: BreakpointHandler) -> Result<()>;

    /// Addresses first covered by the last run
    fn last_new_coverage(&self) -> &GvaSet;

    /// Forget the coverage the last run added. Returns the number of addresses
    /// removed.
    ///
    /// # Panics
    ///
    /// * Called twice for the same run, or before the run completed
    fn revoke_last_new_coverage(&mut self) -> usize;

    /// Statistics accumulated since creation or the last [`Backend::reset_stats`]
    fn stats(&self) -> &RunStats;

    /// Zero the run counters, see [`RunStats::reset`]
    fn reset_stats(&mut self);

    /// Print the statistics to stdout
    fn print_stats(&self) {
        self.stats().print();
    }
}
