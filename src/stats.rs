//! Statistics gathered across the runs of a backend
#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};

use crate::addrs::PAGE_SIZE;
use crate::TestcaseResult;

/// Counters accumulated across runs until [`RunStats::reset`]
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Number of runs
    pub runs: u64,

    /// Instructions retired
    pub instructions_executed: u64,

    /// Linear and physical memory accesses observed
    pub memory_accesses: u64,

    /// Bytes read by the guest
    pub read_bytes: u64,

    /// Bytes written by the guest
    pub written_bytes: u64,

    /// Size of the aggregated coverage after the last run
    pub aggregated_coverage: u64,

    /// Dirty pages at the end of the last run
    pub dirty_pages: u64,

    /// Pages reset by restores
    pub restored_pages: u64,

    /// Exceptions and interrupts the guest took without ending the run
    pub exceptions_passed: u64,

    /// Writes of a page table root other than the snapshot's
    pub context_switches: u64,

    /// Runs per outcome
    pub results: ResultCounts,
}

/// Number of runs per [`TestcaseResult`]
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ResultCounts {
    pub ok: u64,
    pub crashes: u64,
    pub timeouts: u64,
    pub cr3_changes: u64,
    pub unclassified: u64,
}

impl RunStats {
    /// Count the outcome of a run
    pub fn record_result(&mut self, result: &TestcaseResult) {
        self.runs += 1;

        let counter = match result {
            TestcaseResult::Ok => &mut self.results.ok,
            TestcaseResult::Crash(_) => &mut self.results.crashes,
            TestcaseResult::Timedout => &mut self.results.timeouts,
            TestcaseResult::Cr3Change => &mut self.results.cr3_changes,
            TestcaseResult::Unclassified => &mut self.results.unclassified,
        };

        *counter += 1;
    }

    /// Zero every counter. The coverage and dirty page gauges describe the backend
    /// rather than the runs, so they are kept.
    pub fn reset(&mut self) {
        *self = Self {
            aggregated_coverage: self.aggregated_coverage,
            dirty_pages: self.dirty_pages,
            ..Self::default()
        };
    }

    /// Print the stats to stdout
    pub fn print(&self) {
        println!("{self}");
    }
}

/// Render a count with a k/m/b suffix
fn human(val: u64) -> String {
    match val {
        0..=999 => format!("{val}"),
        1_000..=999_999 => format!("{:.1}k", val as f64 / 1e3),
        1_000_000..=999_999_999 => format!("{:.1}m", val as f64 / 1e6),
        _ => format!("{:.1}b", val as f64 / 1e9),
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dirty_mb = (self.dirty_pages * PAGE_SIZE as u64) as f64 / (1024.0 * 1024.0);

        writeln!(f, "Run stats:")?;
        writeln!(f, "                 Runs: {}", human(self.runs))?;
        writeln!(
            f,
            "Instructions executed: {} ({} unique)",
            human(self.instructions_executed),
            human(self.aggregated_coverage)
        )?;
        writeln!(
            f,
            "          Dirty pages: {} ({dirty_mb:.2} MB)",
            human(self.dirty_pages)
        )?;
        writeln!(
            f,
            "      Memory accesses: {} ({} read, {} written)",
            human(self.memory_accesses),
            human(self.read_bytes),
            human(self.written_bytes)
        )?;
        writeln!(f, "       Restored pages: {}", human(self.restored_pages))?;
        writeln!(
            f,
            "    Exceptions passed: {}",
            human(self.exceptions_passed)
        )?;
        writeln!(f, "     Context switches: {}", human(self.context_switches))?;
        write!(
            f,
            "              Results: ok {} crash {} timeout {} cr3 {} unclassified {}",
            self.results.ok,
            self.results.crashes,
            self.results.timeouts,
            self.results.cr3_changes,
            self.results.unclassified
        )
    }
}
