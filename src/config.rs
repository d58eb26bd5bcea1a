//! Configuration settings for a backend

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::trace::TraceKind;
use crate::vectors;

use std::path::{Path, PathBuf};

/// Configuration settings for an [`EmuBackend`](crate::EmuBackend)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Options {
    /// File the trace records are written to
    #[serde(default)]
    pub trace_path: Option<PathBuf>,

    /// Kind of trace records to write
    #[serde(default)]
    pub trace_kind: TraceKind,

    /// Maximum number of instructions per run. `0` means no limit.
    #[serde(default = "default_instruction_limit")]
    pub instruction_limit: u64,

    /// Seed of the generator answering the guest's `rdrand`
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Directory holding the `.physmem` and `.regs` files of the snapshot
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    /// What to do when the guest leaves the snapshot's address space
    #[serde(default)]
    pub context_switch: ContextSwitchPolicy,

    /// Exceptions and interrupts that don't end the run
    #[serde(default)]
    pub exceptions: ExceptionPolicy,
}

/// Exception and interrupt vectors the guest is allowed to take without the run
/// being classified as a crash
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ExceptionPolicy {
    /// Allowed vectors
    #[serde(default = "default_allowed_vectors")]
    pub allowed: Vec<u8>,

    /// Allow any external interrupt (vector 32 and up)
    #[serde(default = "default_allow_external_interrupts")]
    pub allow_external_interrupts: bool,
}

/// Reaction to a write of a page table root other than the snapshot's
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextSwitchPolicy {
    /// End the run as [`TestcaseResult::Cr3Change`](crate::TestcaseResult::Cr3Change)
    #[default]
    Stop,

    /// Log it, count it and keep going
    Continue,
}

const fn default_instruction_limit() -> u64 {
    0
}

const fn default_seed() -> u64 {
    0
}

fn default_allowed_vectors() -> Vec<u8> {
    vec![vectors::PAGE_FAULT]
}

const fn default_allow_external_interrupts() -> bool {
    true
}

impl std::default::Default for Options {
    fn default() -> Self {
        Self {
            trace_path: None,
            trace_kind: TraceKind::default(),
            instruction_limit: default_instruction_limit(),
            seed: default_seed(),
            snapshot_path: None,
            exceptions: ExceptionPolicy::default(),
            context_switch: ContextSwitchPolicy::default(),
        }
    }
}

impl std::default::Default for ExceptionPolicy {
    fn default() -> Self {
        Self {
            allowed: default_allowed_vectors(),
            allow_external_interrupts: default_allow_external_interrupts(),
        }
    }
}

impl ExceptionPolicy {
    /// Returns `true` if an exception with `vector` passes through
    #[must_use]
    pub fn allows_exception(&self, vector: u8) -> bool {
        self.allowed.contains(&vector)
    }

    /// Returns `true` if an interrupt with `vector` passes through
    #[must_use]
    pub fn allows_interrupt(&self, vector: u8) -> bool {
        if self.allow_external_interrupts && vector >= vectors::FIRST_EXTERNAL_INTERRUPT {
            return true;
        }

        self.allowed.contains(&vector)
    }
}

impl Options {
    /// Parse [`Options`] from a TOML document
    ///
    /// # Errors
    ///
    /// * The document is not valid TOML or has fields of the wrong type
    pub fn from_toml(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }

    /// Read [`Options`] from a TOML file
    ///
    /// # Errors
    ///
    /// * The file can't be read or doesn't parse
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {path:?}"))?;
        Self::from_toml(&data).with_context(|| format!("Failed to parse config {path:?}"))
    }

    /// Serialize these [`Options`] as TOML
    ///
    /// # Errors
    ///
    /// * Serialization failed
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(Options::from_toml("").unwrap(), Options::default());
    }

    #[test]
    fn parse_every_field() {
        let options = Options::from_toml(
            r#"
            trace_path = "/tmp/trace.txt"
            trace_kind = "memory_accesses"
            instruction_limit = 1000
            seed = 1337
            snapshot_path = "snapshot"
            context_switch = "continue"

            [exceptions]
            allowed = [3, 14]
            allow_external_interrupts = false
            "#,
        )
        .unwrap();

        assert_eq!(options.trace_path, Some(PathBuf::from("/tmp/trace.txt")));
        assert_eq!(options.trace_kind, TraceKind::MemoryAccesses);
        assert_eq!(options.instruction_limit, 1000);
        assert_eq!(options.seed, 1337);
        assert_eq!(options.context_switch, ContextSwitchPolicy::Continue);
        assert!(options.exceptions.allows_interrupt(3));
        assert!(!options.exceptions.allows_interrupt(0x40));
    }

    #[test]
    fn default_policy() {
        let policy = ExceptionPolicy::default();
        assert!(policy.allows_exception(vectors::PAGE_FAULT));
        assert!(!policy.allows_exception(vectors::INVALID_OPCODE));
        assert!(policy.allows_interrupt(0x20));
        assert!(!policy.allows_interrupt(vectors::BREAKPOINT));
    }

    #[test]
    fn toml_round_trip_through_a_file() {
        let mut options = Options::default();
        options.instruction_limit = 42;
        options.trace_kind = TraceKind::Instructions;

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), options.to_toml().unwrap()).unwrap();
        assert_eq!(Options::from_file(file.path()).unwrap(), options);
    }
}
