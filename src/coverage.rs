//! Code coverage accounting across a fuzzing campaign

use crate::addrs::{Gva, GvaSet};

/// Where the tracker is in the lifecycle of a run
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    /// No run has started yet
    Idle,

    /// A run is executing
    InRun,

    /// The last run finished and its new coverage can be revoked
    Completed,

    /// The new coverage of the last run was revoked
    Revoked,
}

/// Unique instruction addresses hit over the whole campaign, along with the ones
/// first seen in the most recent run.
///
/// New addresses are merged into the aggregate as soon as they are hit, so a hook
/// looking at [`CoverageTracker::aggregated`] mid-run sees the hits of the current run.
#[derive(Debug)]
pub struct CoverageTracker {
    /// Every address hit since the tracker was created, minus revoked runs
    aggregated: GvaSet,

    /// Addresses first hit during the most recent run
    new: GvaSet,

    /// Run lifecycle
    phase: Phase,
}

impl Default for CoverageTracker {
    fn default() -> Self {
        Self {
            aggregated: GvaSet::default(),
            new: GvaSet::default(),
            phase: Phase::Idle,
        }
    }
}

impl CoverageTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new run, forgetting the new coverage of the previous one
    ///
    /// # Panics
    ///
    /// * A run is already in progress
    pub fn begin_run(&mut self) {
        assert!(
            self.phase != Phase::InRun,
            "begin_run called while a run is in progress"
        );

        self.new.clear();
        self.phase = Phase::InRun;
    }

    /// Finish the current run
    ///
    /// # Panics
    ///
    /// * No run is in progress
    pub fn end_run(&mut self) {
        assert!(
            self.phase == Phase::InRun,
            "end_run called without a run in progress"
        );

        self.phase = Phase::Completed;
    }

    /// Record that the instruction at `gva` executed. Returns `true` if the address
    /// was never seen before.
    pub fn record_hit(&mut self, gva: Gva) -> bool {
        if !self.aggregated.insert(gva) {
            return false;
        }

        self.new.insert(gva);
        true
    }

    /// Addresses first hit during the most recent run
    #[must_use]
    pub fn new_coverage(&self) -> &GvaSet {
        &self.new
    }

    /// Every address hit during the campaign
    #[must_use]
    pub fn aggregated(&self) -> &GvaSet {
        &self.aggregated
    }

    /// Remove the new coverage of the last run from the aggregate. Returns the
    /// number of addresses removed.
    ///
    /// # Panics
    ///
    /// * The last run hasn't completed, or its coverage was already revoked
    pub fn revoke(&mut self) -> usize {
        assert!(
            self.phase == Phase::Completed,
            "revoke is only valid once, after a completed run (phase: {:?})",
            self.phase
        );

        for gva in &self.new {
            self.aggregated.remove(gva);
        }

        self.phase = Phase::Revoked;
        self.new.len()
    }
}
