//! A tiny instruction emulator used to drive the backend in tests
//!
//! Encoding (little endian immediates):
//!
//! | bytes                  | instruction                      |
//! |------------------------|----------------------------------|
//! | `90`                   | nop                              |
//! | `c6 <gva:8> <imm:1>`   | store `imm` at `gva`             |
//! | `c7 <gpa:8> <imm:1>`   | store `imm` at physical `gpa`    |
//! | `c8 <gva:8> <gpa:8> <len:1>` | store `len` bytes of `0x22` at `gva`, reported with the stale physical address `gpa` |
//! | `8a <gva:8>`           | load the byte at `gva` into rax  |
//! | `0f c7`                | rdrand rax                       |
//! | `22 <val:8>`           | mov cr3, `val`                   |
//! | `cd <n>`               | int `n`                          |
//! | `f4`                   | hlt                              |
//! | `eb <rel:1>`           | jmp rel8                         |
//!
//! Anything else raises #UD.
#![allow(dead_code)]

use snapemu::page_table::translate;
use snapemu::prelude::*;
use snapemu::{vectors, MemoryValidate, TlbControl, PAGE_SIZE};
use x86_64::structures::paging::PageTableFlags;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Page table root of the test guest
pub const CR3: u64 = 0x10_0000;

/// Code page
pub const CODE: u64 = 0x40_0000;
pub const CODE_GPA: u64 = 0x20_0000;

/// Writable data page, filled with `DATA_FILL`
pub const DATA: u64 = 0x60_0000;
pub const DATA_GPA: u64 = 0x1000;
pub const DATA_FILL: u8 = 0xaa;

/// Stack page
pub const STACK: u64 = 0x7fff_0000;
pub const STACK_GPA: u64 = 0x3000;

/// Number of times the toy engine was globally initialized
pub static GLOBAL_INITS: AtomicUsize = AtomicUsize::new(0);

/// Number of times the toy engine was globally torn down
pub static GLOBAL_TEARDOWNS: AtomicUsize = AtomicUsize::new(0);

/// Page fault error code for a user mode instruction fetch
const PF_FETCH: u32 = 0x14;

/// Page fault error code for a user mode write
const PF_WRITE: u32 = 0x6;

/// Page fault error code for a user mode read
const PF_READ: u32 = 0x4;

pub struct ToyCpu {
    regs: CpuState,
    pending: VecDeque<(u8, Option<u32>)>,
}

impl CpuAccess for ToyCpu {
    fn reg(&self, reg: Register) -> u64 {
        self.regs.reg(reg)
    }

    fn set_reg(&mut self, reg: Register, value: u64) -> u64 {
        self.regs.set_reg(reg, value)
    }

    fn queue_exception(&mut self, vector: u8, error_code: Option<u32>) {
        self.pending.push_back((vector, error_code));
    }
}

/// Outcome of executing one instruction
enum Step {
    /// Retired, continue at the given rip
    Next(u64),

    /// Retired and halted
    Halt,

    /// Faulted, the instruction did not retire
    Fault,
}

impl ToyCpu {
    /// Deliver the exceptions queued by hooks
    fn deliver_pending(&mut self, hooks: &mut dyn EngineHooks) {
        while let Some((vector, error_code)) = self.pending.pop_front() {
            hooks.exception(self, vector, error_code);
        }
    }

    /// Raise a page fault for `gva`
    fn page_fault(&mut self, hooks: &mut dyn EngineHooks, gva: u64, error_code: u32) {
        self.regs.cr2 = gva;
        hooks.exception(self, vectors::PAGE_FAULT, Some(error_code));
    }

    /// Translate `gva` through the guest page tables
    fn translate(
        &self,
        hooks: &mut dyn EngineHooks,
        gva: u64,
        validate: MemoryValidate,
    ) -> Option<Gpa> {
        translate(hooks, Cr3(self.regs.cr3), Gva(gva), validate)
            .ok()
            .map(|translation| translation.gpa)
    }

    /// Fetch up to 32 bytes at rip, never crossing the code page
    fn fetch(&self, hooks: &mut dyn EngineHooks, rip: u64) -> Option<Vec<u8>> {
        let gpa = self.translate(hooks, rip, MemoryValidate::EXECUTE)?;
        let offset = gpa.page_offset();
        let end = (offset + 32).min(PAGE_SIZE);
        Some(hooks.page(gpa)[offset..end].to_vec())
    }

    fn execute(&mut self, hooks: &mut dyn EngineHooks, rip: u64, bytes: &[u8]) -> Step {
        let imm64 = |start: usize| {
            let mut val = [0_u8; 8];
            val.copy_from_slice(&bytes[start..start + 8]);
            u64::from_le_bytes(val)
        };

        match bytes[0] {
            0x90 => Step::Next(rip + 1),
            0xc6 => {
                let gva = imm64(1);
                let Some(gpa) = self.translate(hooks, gva, MemoryValidate::WRITE) else {
                    self.page_fault(hooks, gva, PF_WRITE);
                    return Step::Fault;
                };

                hooks.lin_access(self, Gva(gva), gpa, 1, MemAccess::Write);
                hooks.page(gpa)[gpa.page_offset()] = bytes[9];
                Step::Next(rip + 10)
            }
            0xc7 => {
                let gpa = Gpa(imm64(1));
                hooks.phy_access(self, gpa, 1, MemAccess::Write);
                hooks.page(gpa)[gpa.page_offset()] = bytes[9];
                Step::Next(rip + 10)
            }
            0xc8 => {
                let gva = imm64(1);
                let gpa = imm64(9);
                let len = bytes[17];
                hooks.lin_access(self, Gva(gva), Gpa(gpa), usize::from(len), MemAccess::Write);

                // Bytes whose page is no longer mapped land where the engine's
                // cached translation points
                for i in 0..u64::from(len) {
                    let target = self
                        .translate(hooks, gva + i, MemoryValidate::empty())
                        .unwrap_or(Gpa(gpa + i));
                    hooks.page(target)[target.page_offset()] = 0x22;
                }

                Step::Next(rip + 18)
            }
            0x8a => {
                let gva = imm64(1);
                let Some(gpa) = self.translate(hooks, gva, MemoryValidate::READ) else {
                    self.page_fault(hooks, gva, PF_READ);
                    return Step::Fault;
                };

                hooks.lin_access(self, Gva(gva), gpa, 1, MemAccess::Read);
                self.regs.rax = u64::from(hooks.page(gpa)[gpa.page_offset()]);
                Step::Next(rip + 9)
            }
            0x0f if bytes[1] == 0xc7 => {
                self.regs.rax = hooks.rdrand(self);
                Step::Next(rip + 2)
            }
            0x22 => {
                let value = imm64(1);
                self.regs.cr3 = value;
                hooks.tlb_control(self, TlbControl::MovCr3, value);
                Step::Next(rip + 9)
            }
            0xcd => {
                hooks.interrupt(self, bytes[1]);
                Step::Next(rip + 2)
            }
            0xf4 => Step::Halt,
            0xeb => Step::Next(rip.wrapping_add(2).wrapping_add(bytes[1] as i8 as u64)),
            _ => {
                hooks.exception(self, vectors::INVALID_OPCODE, None);
                Step::Fault
            }
        }
    }
}

impl Engine for ToyCpu {
    fn create(_id: u32) -> Result<Self> {
        Ok(Self {
            regs: CpuState::default(),
            pending: VecDeque::new(),
        })
    }

    fn global_init() -> Result<()> {
        GLOBAL_INITS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn global_teardown() {
        GLOBAL_TEARDOWNS.fetch_add(1, Ordering::SeqCst);
    }

    fn load_state(&mut self, state: &CpuState) {
        self.regs = state.clone();
        self.pending.clear();
    }

    fn save_state(&self) -> CpuState {
        self.regs.clone()
    }

    fn run(&mut self, hooks: &mut dyn EngineHooks) {
        loop {
            hooks.before_execution(self);
            self.deliver_pending(hooks);
            if hooks.stop_requested() {
                return;
            }

            let rip = self.regs.rip;
            let Some(bytes) = self.fetch(hooks, rip) else {
                self.page_fault(hooks, rip, PF_FETCH);
                return;
            };

            hooks.opcode(self, Gva(rip), &bytes);

            match self.execute(hooks, rip, &bytes) {
                Step::Next(next) => {
                    self.regs.rip = next;
                    hooks.after_execution(self, Gva(rip));
                }
                Step::Halt => {
                    hooks.after_execution(self, Gva(rip));
                    return;
                }
                // No IDT in this machine: a fault that isn't fatal is skipped
                Step::Fault => {
                    if hooks.stop_requested() {
                        return;
                    }

                    self.regs.rip = rip + 1;
                }
            }
        }
    }
}

/// Assemble a store of `imm` to `gva`
pub fn store(gva: u64, imm: u8) -> Vec<u8> {
    let mut code = vec![0xc6];
    code.extend_from_slice(&gva.to_le_bytes());
    code.push(imm);
    code
}

/// Assemble a physical store of `imm` to `gpa`
pub fn phys_store(gpa: u64, imm: u8) -> Vec<u8> {
    let mut code = vec![0xc7];
    code.extend_from_slice(&gpa.to_le_bytes());
    code.push(imm);
    code
}

/// Assemble a store of `len` bytes at `gva` that the engine reports as going to
/// `gpa`, as if it used a translation cached before the page tables changed
pub fn stale_store(gva: u64, gpa: u64, len: u8) -> Vec<u8> {
    let mut code = vec![0xc8];
    code.extend_from_slice(&gva.to_le_bytes());
    code.extend_from_slice(&gpa.to_le_bytes());
    code.push(len);
    code
}

/// Assemble a load of the byte at `gva`
pub fn load(gva: u64) -> Vec<u8> {
    let mut code = vec![0x8a];
    code.extend_from_slice(&gva.to_le_bytes());
    code
}

/// Assemble a `mov cr3`
pub fn mov_cr3(value: u64) -> Vec<u8> {
    let mut code = vec![0x22];
    code.extend_from_slice(&value.to_le_bytes());
    code
}

/// Build a snapshot with `code` at `CODE`, a data page and a stack page
pub fn snapshot(code: &[u8]) -> MemorySnapshot {
    let mut regs = CpuState::default();
    regs.cr3 = CR3;
    regs.rip = CODE;
    regs.rsp = STACK + 0x800;

    let cr3 = Cr3(CR3);
    let rw = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    let mut snap = MemorySnapshot::new(regs);
    snap.map_4k(cr3, Gva(CODE), Gpa(CODE_GPA), PageTableFlags::USER_ACCESSIBLE)
        .unwrap();
    snap.map_4k(cr3, Gva(DATA), Gpa(DATA_GPA), rw).unwrap();
    snap.map_4k(cr3, Gva(STACK), Gpa(STACK_GPA), rw).unwrap();

    snap.write(Gpa(CODE_GPA), code);
    snap.write(Gpa(DATA_GPA), &[DATA_FILL; PAGE_SIZE]);
    snap
}

/// Create a backend over `snapshot(code)` with `options`
pub fn backend_with(code: &[u8], options: &Options) -> EmuBackend<ToyCpu, MemorySnapshot> {
    backend_from(snapshot(code), options)
}

/// Create a backend over `snap`, starting from its registers
pub fn backend_from(snap: MemorySnapshot, options: &Options) -> EmuBackend<ToyCpu, MemorySnapshot> {
    init_logging();
    let baseline = snap.registers().clone();
    EmuBackend::initialize(options, snap, &baseline).unwrap()
}

/// Create a backend over `snapshot(code)` with default options
pub fn backend(code: &[u8]) -> EmuBackend<ToyCpu, MemorySnapshot> {
    backend_with(code, &Options::default())
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
