//! Hook dispatcher: turns engine events into dirty tracking, coverage, breakpoints
//! and the classification of a run

use anyhow::Result;

use crate::addrs::{page_chunks, Gpa, Gva, GvaSet, Page};
use crate::backend::{GuestAccess, HookContext};
use crate::breakpoint::BreakpointAction;
use crate::config::ContextSwitchPolicy;
use crate::emu::BackendState;
use crate::engine::{CpuAccess, EngineHooks, GuestMemory, MemAccess, TlbControl};
use crate::page_table::{MemoryValidate, TranslateError};
use crate::regs::Register;
use crate::snapshot::SnapshotSource;
use crate::{Cr3, Crash, TestcaseResult};

/// Maximum length of an x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;

/// State of the run in progress
pub(crate) struct RunFrame<'a> {
    /// The testcase being executed
    testcase: &'a [u8],

    /// Instructions retired so far
    executed: u64,

    /// The decision of the run, once one is made
    result: Option<TestcaseResult>,

    /// Opcode bytes of the instruction about to retire, for the instruction trace
    opcode: Option<(Gva, [u8; MAX_INSTRUCTION_LEN], usize)>,
}

impl<'a> RunFrame<'a> {
    /// Record `result` unless the run already has one
    fn stop(&mut self, result: TestcaseResult) {
        if self.result.is_none() {
            log::debug!("Stopping run: {result}");
            self.result = Some(result);
        }
    }
}

/// The [`EngineHooks`] handed to the engine for the duration of one run
pub(crate) struct Dispatcher<'a, S> {
    /// Backend state the events act on
    state: &'a mut BackendState<S>,

    /// The run in progress
    run: RunFrame<'a>,
}

impl<'a, S: SnapshotSource> Dispatcher<'a, S> {
    /// Start dispatching the events of a run of `testcase`
    pub(crate) fn new(state: &'a mut BackendState<S>, testcase: &'a [u8]) -> Self {
        Self {
            state,
            run: RunFrame {
                testcase,
                executed: 0,
                result: None,
                opcode: None,
            },
        }
    }

    /// Decision of the run, if anything made one, and the number of instructions
    /// retired
    pub(crate) fn finish(self) -> (Option<TestcaseResult>, u64) {
        (self.run.result, self.run.executed)
    }

    /// Count a memory access and keep the pages it touches populated, marking them
    /// dirty on writes
    fn memory_access(
        &mut self,
        cpu: &dyn CpuAccess,
        gva: Option<Gva>,
        gpa: Gpa,
        len: usize,
        access: MemAccess,
    ) {
        let stats = &mut self.state.stats;
        stats.memory_accesses += 1;
        if access.is_write() {
            stats.written_bytes += len as u64;
        } else {
            stats.read_bytes += len as u64;
        }

        self.state.trace.memory_access(gva, gpa, len, access);

        if access.is_write() {
            let Some(gva) = gva else {
                self.state.memory.mark_dirty_range(gpa, len);
                return;
            };

            // A linear access crossing a page is split by translation, not by
            // physical adjacency. Only a chunk that no longer translates falls back
            // to the engine's physical address.
            for (addr, size) in page_chunks(gva.0, len) {
                let target = match self.state.translate(cpu, Gva(addr), MemoryValidate::empty()) {
                    Ok(target) => target,
                    Err(err) => {
                        log::debug!("Dirtying {addr:#x} through the reported gpa: {err}");
                        gpa.offset(addr - gva.0)
                    }
                };

                self.state.memory.mark_dirty_range(target, size);
            }

            return;
        }

        for (addr, _) in page_chunks(gpa.0, len) {
            self.state.memory.page(Gpa(addr));
        }
    }

    /// Classify an exception or interrupt that the policy didn't allow
    fn crash(&mut self, cpu: &dyn CpuAccess, vector: u8, error_code: Option<u32>) {
        let rip = Gva(cpu.reg(Register::Rip));
        log::debug!("Unexpected vector {vector:#x} ({error_code:x?}) at {:#x}", rip.0);
        self.run
            .stop(TestcaseResult::Crash(Crash::exception(vector, error_code, rip)));
    }
}

impl<S: SnapshotSource> GuestMemory for Dispatcher<'_, S> {
    fn page(&mut self, gpa: Gpa) -> &mut Page {
        self.state.memory.page(gpa)
    }
}

impl<S: SnapshotSource> EngineHooks for Dispatcher<'_, S> {
    fn before_execution(&mut self, cpu: &mut dyn CpuAccess) {
        if self.run.result.is_some() {
            return;
        }

        // Out of instruction budget: the run completed
        let limit = self.state.limit;
        if limit > 0 && self.run.executed >= limit {
            self.run.stop(TestcaseResult::Ok);
            return;
        }

        let rip = Gva(cpu.reg(Register::Rip));
        let Some(handler) = self.state.breakpoints.lookup(rip) else {
            return;
        };

        log::debug!("Breakpoint hit at {:#x}", rip.0);

        let action = {
            let mut frame = HookFrame {
                cpu,
                state: &mut *self.state,
                run: &mut self.run,
            };
            handler(&mut frame, rip)
        };

        match action {
            BreakpointAction::Continue => {}
            BreakpointAction::StopOk => self.run.stop(TestcaseResult::Ok),
            BreakpointAction::Crash(crash) => self.run.stop(TestcaseResult::Crash(crash)),
        }
    }

    fn after_execution(&mut self, _cpu: &mut dyn CpuAccess, rip: Gva) {
        self.run.executed += 1;
        self.state.stats.instructions_executed += 1;
        self.state.coverage.record_hit(rip);

        if self.state.trace.is_enabled() {
            match self.run.opcode.take() {
                Some((addr, bytes, len)) if addr == rip => {
                    self.state.trace.instruction(rip, Some(&bytes[..len]));
                }
                _ => self.state.trace.instruction(rip, None),
            }
        }
    }

    fn opcode(&mut self, _cpu: &mut dyn CpuAccess, rip: Gva, bytes: &[u8]) {
        if !self.state.trace.is_enabled() {
            return;
        }

        let len = bytes.len().min(MAX_INSTRUCTION_LEN);
        let mut opcode = [0_u8; MAX_INSTRUCTION_LEN];
        opcode[..len].copy_from_slice(&bytes[..len]);
        self.run.opcode = Some((rip, opcode, len));
    }

    fn lin_access(
        &mut self,
        cpu: &mut dyn CpuAccess,
        gva: Gva,
        gpa: Gpa,
        len: usize,
        access: MemAccess,
    ) {
        self.memory_access(cpu, Some(gva), gpa, len, access);
    }

    fn phy_access(&mut self, cpu: &mut dyn CpuAccess, gpa: Gpa, len: usize, access: MemAccess) {
        self.memory_access(cpu, None, gpa, len, access);
    }

    fn tlb_control(&mut self, _cpu: &mut dyn CpuAccess, what: TlbControl, value: u64) {
        if what != TlbControl::MovCr3 {
            return;
        }

        let new_cr3 = Cr3(value);
        if new_cr3.table() == self.state.initial_cr3.table() {
            return;
        }

        self.state.stats.context_switches += 1;
        log::warn!(
            "Page table root changed from {:#x} to {:#x}",
            self.state.initial_cr3.0,
            new_cr3.0
        );

        if self.state.context_switch == ContextSwitchPolicy::Stop {
            self.run.stop(TestcaseResult::Cr3Change);
        }
    }

    fn interrupt(&mut self, cpu: &mut dyn CpuAccess, vector: u8) {
        if self.state.exceptions.allows_interrupt(vector) {
            self.state.stats.exceptions_passed += 1;
            return;
        }

        self.crash(cpu, vector, None);
    }

    fn exception(&mut self, cpu: &mut dyn CpuAccess, vector: u8, error_code: Option<u32>) {
        if self.state.exceptions.allows_exception(vector) {
            log::debug!("Passing through vector {vector:#x} ({error_code:x?})");
            self.state.stats.exceptions_passed += 1;
            return;
        }

        self.crash(cpu, vector, error_code);
    }

    fn rdrand(&mut self, _cpu: &mut dyn CpuAccess) -> u64 {
        self.state.rng.next()
    }

    fn stop_requested(&self) -> bool {
        self.run.result.is_some()
    }
}

/// The [`HookContext`] given to breakpoint handlers
struct HookFrame<'f, 'a, S> {
    /// The engine's CPU
    cpu: &'f mut dyn CpuAccess,

    /// Backend state
    state: &'f mut BackendState<S>,

    /// The run in progress
    run: &'f mut RunFrame<'a>,
}

impl<S: SnapshotSource> GuestAccess for HookFrame<'_, '_, S> {
    fn reg(&self, reg: Register) -> u64 {
        self.cpu.reg(reg)
    }

    fn set_reg(&mut self, reg: Register, value: u64) -> u64 {
        self.cpu.set_reg(reg, value)
    }

    fn rdrand(&mut self) -> u64 {
        self.state.rng.next()
    }

    fn translate(&mut self, gva: Gva, validate: MemoryValidate) -> Result<Gpa, TranslateError> {
        self.state.translate(&*self.cpu, gva, validate)
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
        self.state.mark_dirty_virt_range(&*self.cpu, gva, len)
    }

    fn ensure_mapped(&mut self, gva: Gva, len: usize) -> Result<bool> {
        self.state.ensure_mapped(&mut *self.cpu, gva, len)
    }

    fn virt_read(&mut self, gva: Gva, buf: &mut [u8]) -> Result<()> {
        self.state.virt_read(&*self.cpu, gva, buf)
    }

    fn virt_write_dirty(&mut self, gva: Gva, buf: &[u8]) -> Result<()> {
        self.state.virt_write_dirty(&*self.cpu, gva, buf)
    }

    fn phys_read(&mut self, gpa: Gpa, buf: &mut [u8]) -> Result<()> {
        self.state.memory.read_phys(gpa, buf)
    }
}

impl<S: SnapshotSource> HookContext for HookFrame<'_, '_, S> {
    fn stop(&mut self, result: TestcaseResult) {
        self.run.stop(result);
    }

    fn testcase(&self) -> &[u8] {
        self.run.testcase
    }

    fn instructions_executed(&self) -> u64 {
        self.run.executed
    }

    fn aggregated_coverage(&self) -> &GvaSet {
        self.state.coverage.aggregated()
    }
}
