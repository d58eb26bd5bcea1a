//! [`Backend`] driven by an instruction emulation [`Engine`]

use anyhow::{ensure, Context, Result};

use crate::addrs::{page_chunks, Cr3, Gpa, Gva, GvaSet, Page};
use crate::backend::{Backend, GuestAccess};
use crate::breakpoint::{BreakpointHandler, BreakpointTable};
use crate::config::{ContextSwitchPolicy, ExceptionPolicy, Options};
use crate::coverage::CoverageTracker;
use crate::engine::{CpuAccess, Engine, EngineGuard, GuestMemory};
use crate::hooks::Dispatcher;
use crate::memory::{PhysMemory, WriteMem};
use crate::page_table::{MemoryValidate, TranslateError};
use crate::regs::{CpuState, Register};
use crate::rng::Rng;
use crate::snapshot::{RawSnapshot, SnapshotSource};
use crate::stats::RunStats;
use crate::trace::{TraceKind, TraceSink};
use crate::{vectors, TestcaseResult};

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

/// Page fault error code bit: the access was a write
const PF_WRITE: u32 = 1 << 1;

/// Page fault error code bit: the access came from user mode
const PF_USER: u32 = 1 << 2;

/// Id handed to the next engine CPU
static NEXT_ENGINE_ID: AtomicU32 = AtomicU32::new(0);

/// Custom errors [`EmuBackend`] can throw
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Attempted to set a breakpoint on an address that doesn't translate
    #[error("BreakpointNotMapped_{0:x?}")]
    BreakpointNotMapped(Gva),

    /// The page table root of the baseline registers isn't in the snapshot
    #[error("MissingPageTableRoot_{0:x?}")]
    MissingPageTableRoot(Cr3),

    /// No snapshot directory was configured
    #[error("SnapshotPathMissing")]
    SnapshotPathMissing,
}

/// Lifecycle of the backend across run and restore
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RunState {
    /// Ready to run
    Idle,

    /// Executing a testcase
    Running,

    /// A run finished and the guest needs a restore
    Finished,
}

/// Everything the hooks act on during a run
pub(crate) struct BackendState<S> {
    /// Guest physical memory
    pub(crate) memory: PhysMemory<S>,

    /// Code coverage
    pub(crate) coverage: CoverageTracker,

    /// Breakpoint handlers
    pub(crate) breakpoints: BreakpointTable,

    /// Run statistics
    pub(crate) stats: RunStats,

    /// Trace records destination
    pub(crate) trace: TraceSink,

    /// Generator answering `rdrand`
    pub(crate) rng: Rng,

    /// Seed `rng` is reset to on restore
    pub(crate) seed: u64,

    /// Instructions per run, `0` for no limit
    pub(crate) limit: u64,

    /// Page table root of the snapshot
    pub(crate) initial_cr3: Cr3,

    /// Exceptions and interrupts that don't end a run
    pub(crate) exceptions: ExceptionPolicy,

    /// Reaction to a new page table root
    pub(crate) context_switch: ContextSwitchPolicy,
}

impl<S: SnapshotSource> BackendState<S> {
    /// Translate `gva` with the page table root currently loaded in `cpu`
    pub(crate) fn translate(
        &mut self,
        cpu: &dyn CpuAccess,
        gva: Gva,
        validate: MemoryValidate,
    ) -> Result<Gpa, TranslateError> {
        let cr3 = Cr3(cpu.reg(Register::Cr3));
        Ok(self.memory.translate(cr3, gva, validate)?.gpa)
    }

    /// Mark the physical pages behind `[gva, gva + len)` dirty
    pub(crate) fn mark_dirty_virt_range(
        &mut self,
        cpu: &dyn CpuAccess,
        gva: Gva,
        len: usize,
    ) -> Result<()> {
        for (addr, _) in page_chunks(gva.0, len) {
            let gpa = self.translate(cpu, Gva(addr), MemoryValidate::empty())?;
            self.memory.mark_dirty(gpa);
        }

        Ok(())
    }

    /// Populate the physical pages behind `[gva, gva + len)`, or inject a page
    /// fault for the first page that isn't mapped
    pub(crate) fn ensure_mapped(
        &mut self,
        cpu: &mut dyn CpuAccess,
        gva: Gva,
        len: usize,
    ) -> Result<bool> {
        ensure!(
            gva.0.checked_add(len as u64).is_some(),
            crate::memory::Error::AddressOverflow(gva.0, len)
        );

        for (addr, _) in page_chunks(gva.0, len) {
            let addr = Gva(addr);
            match self.translate(&*cpu, addr, MemoryValidate::empty()) {
                Ok(gpa) => {
                    self.memory.page(gpa);
                }
                Err(err) => {
                    log::debug!("Injecting #PF for {:#x}: {err}", addr.0);
                    cpu.set_reg(Register::Cr2, addr.page().0);
                    cpu.queue_exception(vectors::PAGE_FAULT, Some(PF_WRITE | PF_USER));
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Read guest virtual memory through the page tables loaded in `cpu`
    pub(crate) fn virt_read(&mut self, cpu: &dyn CpuAccess, gva: Gva, buf: &mut [u8]) -> Result<()> {
        let cr3 = Cr3(cpu.reg(Register::Cr3));
        self.memory.read_virt(cr3, gva, buf)
    }

    /// Write guest virtual memory through the page tables loaded in `cpu`, marking
    /// the written pages dirty
    pub(crate) fn virt_write_dirty(&mut self, cpu: &dyn CpuAccess, gva: Gva, buf: &[u8]) -> Result<()> {
        let cr3 = Cr3(cpu.reg(Register::Cr3));
        self.memory.write_virt(cr3, gva, buf, WriteMem::Dirty)
    }
}

/// The emulation backend: an [`Engine`] CPU over a [`SnapshotSource`]
pub struct EmuBackend<E: Engine + 'static, S> {
    /// The engine's CPU
    engine: E,

    /// Keeps the engine's process-wide state alive
    _guard: EngineGuard<E>,

    /// Memory, coverage, breakpoints and the rest of the run loop state
    state: BackendState<S>,

    /// Run lifecycle
    run_state: RunState,
}

impl<E: Engine + 'static> EmuBackend<E, RawSnapshot> {
    /// Open the snapshot at `options.snapshot_path` and create a backend over it,
    /// starting from the snapshot's registers
    ///
    /// # Errors
    ///
    /// * No snapshot path is configured or the snapshot fails to open
    /// * See [`EmuBackend::initialize`]
    pub fn from_options(options: &Options) -> Result<Self> {
        let path = options
            .snapshot_path
            .as_ref()
            .ok_or(Error::SnapshotPathMissing)?;

        let snapshot = RawSnapshot::open(path)?;
        let baseline = snapshot.registers().clone();
        Self::initialize(options, snapshot, &baseline)
    }
}

impl<E: Engine + 'static, S: SnapshotSource> EmuBackend<E, S> {
    /// Create a backend executing `snapshot`, with `baseline` loaded in the CPU
    ///
    /// # Errors
    ///
    /// * The engine fails to initialize or create a CPU
    /// * The page table root of `baseline` is not in the snapshot
    /// * The configured trace file can't be created
    pub fn initialize(options: &Options, snapshot: S, baseline: &CpuState) -> Result<Self> {
        let initial_cr3 = Cr3(baseline.cr3);
        ensure!(
            snapshot.page(initial_cr3.table()).is_some(),
            Error::MissingPageTableRoot(initial_cr3)
        );

        let guard = EngineGuard::<E>::acquire()?;
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let mut engine = E::create(id).context("Failed to create the engine CPU")?;
        engine.load_state(baseline);

        // Last fallible step: creating the trace file truncates it
        let trace = match &options.trace_path {
            Some(path) => TraceSink::open(path, options.trace_kind)?,
            None => TraceSink::disabled(),
        };

        log::info!(
            "Backend {id} ready: cr3 {:#x} rip {:#x} limit {}",
            baseline.cr3,
            baseline.rip,
            options.instruction_limit
        );

        Ok(Self {
            engine,
            _guard: guard,
            state: BackendState {
                memory: PhysMemory::new(snapshot),
                coverage: CoverageTracker::new(),
                breakpoints: BreakpointTable::default(),
                stats: RunStats::default(),
                trace,
                rng: Rng::from_seed(options.seed),
                seed: options.seed,
                limit: options.instruction_limit,
                initial_cr3,
                exceptions: options.exceptions.clone(),
                context_switch: options.context_switch,
            },
            run_state: RunState::Idle,
        })
    }

    /// Registers of the snapshot
    pub fn baseline(&self) -> &CpuState {
        self.state.memory.snapshot().registers()
    }

    /// Full register file of the CPU, for instance to store next to a crashing input
    pub fn cpu_state(&self) -> CpuState {
        self.engine.save_state()
    }

    /// The engine's CPU
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The engine's CPU, mutably
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Guest physical memory
    pub fn memory(&self) -> &PhysMemory<S> {
        &self.state.memory
    }

    /// Guest physical memory, mutably
    pub fn memory_mut(&mut self) -> &mut PhysMemory<S> {
        &mut self.state.memory
    }

    /// Coverage of the campaign
    pub fn coverage(&self) -> &CoverageTracker {
        &self.state.coverage
    }

    /// Current instruction limit
    pub fn limit(&self) -> u64 {
        self.state.limit
    }

    /// Returns `true` if a run finished and no restore happened since
    pub fn needs_restore(&self) -> bool {
        self.run_state == RunState::Finished
    }
}

impl<E: Engine + 'static, S: SnapshotSource> GuestAccess for EmuBackend<E, S> {
    fn reg(&self, reg: Register) -> u64 {
        self.engine.reg(reg)
    }

    fn set_reg(&mut self, reg: Register, value: u64) -> u64 {
        self.engine.set_reg(reg, value)
    }

    fn rdrand(&mut self) -> u64 {
        self.state.rng.next()
    }

    fn translate(&mut self, gva: Gva, validate: MemoryValidate) -> Result<Gpa, TranslateError> {
        self.state.translate(&self.engine, gva, validate)
    }

    fn raw_page(&mut self, gpa: Gpa) -> Option<&mut Page> {
        self.state.memory.raw_page_mut(gpa)
    }

    fn mark_dirty(&mut self, gpa: Gpa) {
        self.state.memory.mark_dirty(gpa);
    }

    fn mark_dirty_range(&mut self, gpa: Gpa, len: usize) {
        self.state.memory.mark_dirty_range(gpa, len);
    }

    fn mark_dirty_virt_range(&mut self, gva: Gva, len: usize) -> Result<()> {
        self.state.mark_dirty_virt_range(&self.engine, gva, len)
    }

    fn ensure_mapped(&mut self, gva: Gva, len: usize) -> Result<bool> {
        self.state.ensure_mapped(&mut self.engine, gva, len)
    }

    fn virt_read(&mut self, gva: Gva, buf: &mut [u8]) -> Result<()> {
        self.state.virt_read(&self.engine, gva, buf)
    }

    fn virt_write_dirty(&mut self, gva: Gva, buf: &[u8]) -> Result<()> {
        self.state.virt_write_dirty(&self.engine, gva, buf)
    }

    fn phys_read(&mut self, gpa: Gpa, buf: &mut [u8]) -> Result<()> {
        self.state.memory.read_phys(gpa, buf)
    }
}

impl<E: Engine + 'static, S: SnapshotSource> Backend for EmuBackend<E, S> {
    fn run(&mut self, testcase: &[u8]) -> TestcaseResult {
        assert!(
            self.run_state == RunState::Idle,
            "run called in state {:?}, restore the backend first",
            self.run_state
        );

        self.run_state = RunState::Running;
        self.state.coverage.begin_run();

        let (result, executed) = {
            let mut dispatcher = Dispatcher::new(&mut self.state, testcase);
            self.engine.run(&mut dispatcher);
            dispatcher.finish()
        };

        let result = result.unwrap_or(TestcaseResult::Unclassified);

        self.state.coverage.end_run();
        self.state.trace.flush();

        let stats = &mut self.state.stats;
        stats.aggregated_coverage = self.state.coverage.aggregated().len() as u64;
        stats.dirty_pages = self.state.memory.dirty_pages().len() as u64;
        stats.record_result(&result);

        log::debug!(
            "Run finished after {executed} instructions: {result} ({} new coverage)",
            self.state.coverage.new_coverage().len()
        );

        self.run_state = RunState::Finished;
        result
    }

    fn restore(&mut self, state: &CpuState) -> Result<()> {
        assert!(
            self.run_state != RunState::Running,
            "restore called during a run"
        );

        let restored = self.state.memory.restore();
        self.state.stats.restored_pages += restored as u64;

        self.engine.load_state(state);
        self.state.rng.reseed(self.state.seed);
        self.run_state = RunState::Idle;

        Ok(())
    }

    fn set_limit(&mut self, limit: u64) {
        self.state.limit = limit;
    }

    fn set_trace_sink(&mut self, path: Option<&Path>, kind: TraceKind) -> Result<()> {
        self.state.trace = match path {
            Some(path) => TraceSink::open(path, kind)?,
            None => TraceSink::disabled(),
        };

        Ok(())
    }

    fn set_breakpoint(&mut self, gva: Gva, handler: BreakpointHandler) -> Result<()> {
        let gpa = self
            .state
            .translate(&self.engine, gva, MemoryValidate::empty())
            .with_context(|| Error::BreakpointNotMapped(gva))?;

        // Keep the code page resident for the run loop
        self.state.memory.page(gpa);

        if self.state.breakpoints.set(gva, handler).is_some() {
            log::debug!("Replaced breakpoint at {:#x}", gva.0);
        }

        Ok(())
    }

    fn last_new_coverage(&self) -> &GvaSet {
        self.state.coverage.new_coverage()
    }

    fn revoke_last_new_coverage(&mut self) -> usize {
        let revoked = self.state.coverage.revoke();
        self.state.stats.aggregated_coverage = self.state.coverage.aggregated().len() as u64;
        revoked
    }

    fn stats(&self) -> &RunStats {
        &self.state.stats
    }

    fn reset_stats(&mut self) {
        self.state.stats.reset();
    }
}
