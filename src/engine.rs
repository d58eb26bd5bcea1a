//! The contract between the backend and an instruction emulation engine
//!
//! The engine owns instruction semantics. The backend owns memory, coverage and
//! classification. During [`Engine::run`] the engine reports every event to an
//! [`EngineHooks`] implementation synchronously on the calling thread, and reads or
//! writes guest physical memory only through [`GuestMemory::page`] on that same
//! object.

use anyhow::Result;
use rustc_hash::FxHashMap;

use crate::addrs::{Gpa, Gva};
pub use crate::memory::GuestMemory;
use crate::regs::{CpuState, Register};

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::{Mutex, PoisonError};

/// Kind of a memory access reported to the hooks
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemAccess {
    /// Data read
    Read,

    /// Data write
    Write,

    /// Read-modify-write
    ReadWrite,

    /// Instruction fetch
    Execute,
}

impl MemAccess {
    /// Returns `true` if this access modifies memory
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, MemAccess::Write | MemAccess::ReadWrite)
    }
}

impl std::fmt::Display for MemAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MemAccess::Read => "R",
            MemAccess::Write => "W",
            MemAccess::ReadWrite => "RW",
            MemAccess::Execute => "X",
        };
        f.write_str(name)
    }
}

/// Why the engine flushed its TLB
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TlbControl {
    MovCr0,
    MovCr3,
    MovCr4,
    TaskSwitch,
    ContextSwitch,
    Invlpg,
    Invpcid,
}

/// Register access and event injection on the engine's CPU
pub trait CpuAccess {
    /// Read a register
    fn reg(&self, reg: Register) -> u64;

    /// Write a register, returning its previous value
    fn set_reg(&mut self, reg: Register, value: u64) -> u64;

    /// Deliver `vector` to the guest at the next instruction boundary
    fn queue_exception(&mut self, vector: u8, error_code: Option<u32>);
}

/// Event subscribers invoked by the engine while it runs. Memory hooks are called
/// before the access is performed.
#[allow(unused_variables)]
pub trait EngineHooks: GuestMemory {
    /// An instruction at `rip` is about to execute
    fn before_execution(&mut self, cpu: &mut dyn CpuAccess) {}

    /// The instruction at `rip` retired
    fn after_execution(&mut self, cpu: &mut dyn CpuAccess, rip: Gva) {}

    /// The instruction at `rip` was decoded from `bytes`
    fn opcode(&mut self, cpu: &mut dyn CpuAccess, rip: Gva, bytes: &[u8]) {}

    /// A linear memory access of `len` bytes at `gva`, translated to `gpa`
    fn lin_access(
        &mut self,
        cpu: &mut dyn CpuAccess,
        gva: Gva,
        gpa: Gpa,
        len: usize,
        access: MemAccess,
    ) {
    }

    /// A physical memory access of `len` bytes at `gpa` (page walks, DMA-like
    /// accesses)
    fn phy_access(&mut self, cpu: &mut dyn CpuAccess, gpa: Gpa, len: usize, access: MemAccess) {}

    /// The TLB was flushed. `value` is the new value of the written control
    /// register, if any.
    fn tlb_control(&mut self, cpu: &mut dyn CpuAccess, what: TlbControl, value: u64) {}

    /// A software or external interrupt is being delivered
    fn interrupt(&mut self, cpu: &mut dyn CpuAccess, vector: u8) {}

    /// An exception is being delivered
    fn exception(&mut self, cpu: &mut dyn CpuAccess, vector: u8, error_code: Option<u32>) {}

    /// The guest asked for a hardware random number
    fn rdrand(&mut self, cpu: &mut dyn CpuAccess) -> u64 {
        0
    }

    /// Checked by the engine at every instruction boundary. The engine returns from
    /// [`Engine::run`] as soon as this is `true`.
    fn stop_requested(&self) -> bool {
        false
    }
}

/// An instruction emulation engine
pub trait Engine: CpuAccess + Sized {
    /// Create a CPU. `id` distinguishes engines created by the same process.
    ///
    /// # Errors
    ///
    /// * The engine failed to allocate its CPU
    fn create(id: u32) -> Result<Self>;

    /// Process-wide setup, called once before the first CPU is created
    ///
    /// # Errors
    ///
    /// * The engine failed to initialize
    fn global_init() -> Result<()> {
        Ok(())
    }

    /// Process-wide teardown, called once after the last CPU is dropped
    fn global_teardown() {}

    /// Load the full register file into the CPU
    fn load_state(&mut self, state: &CpuState);

    /// Capture the full register file of the CPU
    fn save_state(&self) -> CpuState;

    /// Execute until `hooks.stop_requested()` or the guest halts
    fn run(&mut self, hooks: &mut dyn EngineHooks);
}

lazy_static::lazy_static! {
    /// Live [`EngineGuard`]s per engine type
    static ref LIVE_ENGINES: Mutex<FxHashMap<TypeId, usize>> = Mutex::new(FxHashMap::default());
}

/// Keeps the process-wide state of engine `E` alive. The first guard of an engine
/// type runs [`Engine::global_init`], dropping the last one runs
/// [`Engine::global_teardown`].
#[derive(Debug)]
pub struct EngineGuard<E: Engine + 'static> {
    /// The engine type this guard is for
    _engine: PhantomData<fn() -> E>,
}

impl<E: Engine + 'static> EngineGuard<E> {
    /// Take a reference on the process-wide state of `E`
    ///
    /// # Errors
    ///
    /// * This is the first guard and [`Engine::global_init`] failed
    pub fn acquire() -> Result<Self> {
        let mut live = LIVE_ENGINES
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let count = live.entry(TypeId::of::<E>()).or_insert(0);
        if *count == 0 {
            log::info!("Initializing engine {}", std::any::type_name::<E>());
            E::global_init()?;
        }

        *count += 1;

        Ok(Self {
            _engine: PhantomData,
        })
    }

    /// Number of live guards for engine `E`
    #[must_use]
    pub fn live() -> usize {
        LIVE_ENGINES
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .copied()
            .unwrap_or(0)
    }
}

impl<E: Engine + 'static> Drop for EngineGuard<E> {
    fn drop(&mut self) {
        let mut live = LIVE_ENGINES
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let id = TypeId::of::<E>();
        if let Some(count) = live.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                live.remove(&id);
                log::info!("Tearing down engine {}", std::any::type_name::<E>());
                E::global_teardown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INITS: AtomicUsize = AtomicUsize::new(0);
    static TEARDOWNS: AtomicUsize = AtomicUsize::new(0);

    struct Counting;

    impl CpuAccess for Counting {
        fn reg(&self, _reg: Register) -> u64 {
            0
        }
        fn set_reg(&mut self, _reg: Register, _value: u64) -> u64 {
            0
        }
        fn queue_exception(&mut self, _vector: u8, _error_code: Option<u32>) {}
    }

    impl Engine for Counting {
        fn create(_id: u32) -> Result<Self> {
            Ok(Counting)
        }
        fn global_init() -> Result<()> {
            INITS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn global_teardown() {
            TEARDOWNS.fetch_add(1, Ordering::SeqCst);
        }
        fn load_state(&mut self, _state: &CpuState) {}
        fn save_state(&self) -> CpuState {
            CpuState::default()
        }
        fn run(&mut self, _hooks: &mut dyn EngineHooks) {}
    }

    struct Failing;

    impl CpuAccess for Failing {
        fn reg(&self, _reg: Register) -> u64 {
            0
        }
        fn set_reg(&mut self, _reg: Register, _value: u64) -> u64 {
            0
        }
        fn queue_exception(&mut self, _vector: u8, _error_code: Option<u32>) {}
    }

    impl Engine for Failing {
        fn create(_id: u32) -> Result<Self> {
            Ok(Failing)
        }
        fn global_init() -> Result<()> {
            anyhow::bail!("no engine here")
        }
        fn load_state(&mut self, _state: &CpuState) {}
        fn save_state(&self) -> CpuState {
            CpuState::default()
        }
        fn run(&mut self, _hooks: &mut dyn EngineHooks) {}
    }

    #[test]
    fn global_init_runs_once_per_generation() {
        let a = EngineGuard::<Counting>::acquire().unwrap();
        let b = EngineGuard::<Counting>::acquire().unwrap();
        assert_eq!(INITS.load(Ordering::SeqCst), 1);
        assert_eq!(EngineGuard::<Counting>::live(), 2);

        drop(a);
        assert_eq!(TEARDOWNS.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(TEARDOWNS.load(Ordering::SeqCst), 1);
        assert_eq!(EngineGuard::<Counting>::live(), 0);

        let _c = EngineGuard::<Counting>::acquire().unwrap();
        assert_eq!(INITS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_init_leaves_no_guard() {
        assert!(EngineGuard::<Failing>::acquire().is_err());
        assert_eq!(EngineGuard::<Failing>::live(), 0);
    }

    #[test]
    fn write_accesses() {
        assert!(MemAccess::Write.is_write());
        assert!(MemAccess::ReadWrite.is_write());
        assert!(!MemAccess::Read.is_write());
        assert!(!MemAccess::Execute.is_write());
    }
}
