//! Breakpoint table: handlers run right before the instruction at their address

use crate::addrs::{Gva, GvaMap};
use crate::backend::HookContext;
use crate::Crash;

use std::sync::Arc;

/// What the run loop does after a breakpoint handler returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointAction {
    /// Keep executing
    Continue,

    /// Stop the run and classify it as [`TestcaseResult::Ok`](crate::TestcaseResult::Ok)
    StopOk,

    /// Stop the run and classify it as a crash
    Crash(Crash),
}

/// Callback invoked with the in-run context and the address that was hit
pub type BreakpointHandler =
    Arc<dyn Fn(&mut dyn HookContext, Gva) -> BreakpointAction + Send + Sync>;

/// Wrap a closure into a [`BreakpointHandler`]
pub fn breakpoint<F>(handler: F) -> BreakpointHandler
where
    F: Fn(&mut dyn HookContext, Gva) -> BreakpointAction + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Handlers by address. Setting a breakpoint twice on the same address keeps the
/// last handler.
#[derive(Default, Clone)]
pub struct BreakpointTable {
    /// Registered handlers
    handlers: GvaMap<BreakpointHandler>,
}

impl std::fmt::Debug for BreakpointTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut addrs: Vec<_> = self.handlers.keys().map(|gva| gva.0).collect();
        addrs.sort_unstable();
        f.debug_struct("BreakpointTable")
            .field("addresses", &format_args!("{addrs:#x?}"))
            .finish()
    }
}

impl BreakpointTable {
    /// Register `handler` at `gva`, returning the handler it replaced
    pub fn set(&mut self, gva: Gva, handler: BreakpointHandler) -> Option<BreakpointHandler> {
        self.handlers.insert(gva, handler)
    }

    /// Remove the handler at `gva`
    pub fn remove(&mut self, gva: Gva) -> Option<BreakpointHandler> {
        self.handlers.remove(&gva)
    }

    /// Handler registered at `gva`
    #[must_use]
    pub fn lookup(&self, gva: Gva) -> Option<BreakpointHandler> {
        self.handlers.get(&gva).cloned()
    }

    /// Number of registered breakpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no breakpoint is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
