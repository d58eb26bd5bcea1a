//! # snapemu
//!
//! Execution backend for snapshot fuzzing driven by an instruction emulation engine
//!
//! A snapshot (registers and physical memory) is replayed against a testcase on an
//! emulated CPU. Every instruction, memory access, control register write, interrupt
//! and exception is observed through a hook dispatcher that tracks written pages,
//! records code coverage, runs breakpoint handlers and classifies the run. Between
//! runs the guest is reset by copying back only the pages that were written.
//!
//! ## Roadmap of the repo:
//!
//! * [`Backend`] - Interface the outer fuzzing loop drives:
//!     - [`Backend::run`]
//!     - [`Backend::restore`]
//!     - [`Backend::set_breakpoint`]
//!     - [`Backend::last_new_coverage`] / [`Backend::revoke_last_new_coverage`]
//! * [`EmuBackend`] - The [`Backend`] built on any [`Engine`]
//! * [`HookContext`] - What breakpoint handlers get to inspect and modify the guest
//!   while it runs, including [`HookContext::stop`]
//! * [`PhysMemory`] - Lazily populated physical memory and its dirty set
//! * [`SnapshotSource`] - The baseline: [`MemorySnapshot`] or [`RawSnapshot`]
//!
//! # Example:
//!
//! ```rust,ignore
//! let options = Options::from_file("snapshot/config.toml")?;
//! let mut backend = EmuBackend::<MyEngine, RawSnapshot>::from_options(&options)?;
//!
//! backend.set_breakpoint(
//!     Gva(0x1400_1234),
//!     breakpoint(|_ctx, rip| BreakpointAction::Crash(Crash::new("assert", rip))),
//! )?;
//!
//! let baseline = backend.baseline().clone();
//! for input in corpus {
//!     let result = backend.run(&input);
//!     if result.is_crash() {
//!         save_crash(&input, &result);
//!     }
//!     backend.restore(&baseline)?;
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;

pub mod addrs;
pub use addrs::{Cr3, Gpa, Gva, Page, PAGE_SIZE};

pub mod backend;
pub use backend::{Backend, GuestAccess, HookContext};

pub mod breakpoint;
pub use breakpoint::{breakpoint, BreakpointAction, BreakpointHandler};

pub mod config;
pub use config::{ContextSwitchPolicy, ExceptionPolicy, Options};

pub mod coverage;
pub use coverage::CoverageTracker;

pub mod emu;
pub use emu::EmuBackend;

pub mod engine;
pub use engine::{CpuAccess, Engine, EngineGuard, EngineHooks, MemAccess, TlbControl};

mod hooks;

pub mod memory;
pub use memory::{GuestMemory, PhysMemory, WriteMem};

pub mod page_table;
pub use page_table::{MemoryValidate, TranslateError};

pub mod regs;
pub use regs::{CpuState, Register};

pub mod rng;

pub mod snapshot;
pub use snapshot::{MemorySnapshot, RawSnapshot, SnapshotSource};

pub mod stats;
pub use stats::RunStats;

pub mod trace;
pub use trace::TraceKind;

/// Exception vectors that show up in classification
pub mod vectors {
    /// #DE
    pub const DIVIDE_ERROR: u8 = 0;

    /// #BP
    pub const BREAKPOINT: u8 = 3;

    /// #UD
    pub const INVALID_OPCODE: u8 = 6;

    /// #GP
    pub const GENERAL_PROTECTION: u8 = 13;

    /// #PF
    pub const PAGE_FAULT: u8 = 14;

    /// First vector of the external interrupt range
    pub const FIRST_EXTERNAL_INTERRUPT: u8 = 32;
}

/// Details of a crashing run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crash {
    /// Name of the crash, used to bucket crashing inputs
    pub name: String,

    /// Instruction pointer when the crash was detected
    pub rip: Gva,

    /// Exception vector, if the crash came from an exception or interrupt
    pub vector: Option<u8>,

    /// Exception error code, if the exception pushed one
    pub error_code: Option<u32>,
}

impl Crash {
    /// A crash with a caller chosen name, usually from a breakpoint handler
    pub fn new(name: impl Into<String>, rip: Gva) -> Self {
        Self {
            name: name.into(),
            rip,
            vector: None,
            error_code: None,
        }
    }

    /// A crash caused by an unexpected exception or interrupt
    #[must_use]
    pub fn exception(vector: u8, error_code: Option<u32>, rip: Gva) -> Self {
        let name = match error_code {
            Some(code) => format!("crash-{vector:#x}-{code:#x}-{:#x}", rip.0),
            None => format!("crash-{vector:#x}-{:#x}", rip.0),
        };

        Self {
            name,
            rip,
            vector: Some(vector),
            error_code,
        }
    }
}

/// Outcome of a single [`Backend::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestcaseResult {
    /// The run completed normally
    Ok,

    /// The run crashed
    Crash(Crash),

    /// A hook decided the run took too long
    Timedout,

    /// The guest switched to an address space other than the snapshot's
    Cr3Change,

    /// The engine returned without anything deciding how the run ended
    Unclassified,
}

impl TestcaseResult {
    /// Returns true if the run crashed
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crash(_))
    }

    /// Returns true if the run completed normally
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for TestcaseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Crash(crash) => write!(f, "crash ({})", crash.name),
            Self::Timedout => write!(f, "timedout"),
            Self::Cr3Change => write!(f, "cr3 change"),
            Self::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Common imports for users of the backend
pub mod prelude {
    pub use crate::addrs::{Cr3, Gpa, Gva};
    pub use crate::backend::{Backend, GuestAccess, HookContext};
    pub use crate::breakpoint::{breakpoint, BreakpointAction};
    pub use crate::config::Options;
    pub use crate::emu::EmuBackend;
    pub use crate::engine::{CpuAccess, Engine, EngineHooks, MemAccess};
    pub use crate::regs::{CpuState, Register};
    pub use crate::snapshot::{MemorySnapshot, RawSnapshot, SnapshotSource};
    pub use crate::trace::TraceKind;
    pub use crate::{Crash, TestcaseResult};
    pub use anyhow::Result;
}
