//! Execution traces: one line per executed instruction or per memory access

use anyhow::{Context, Result};
use iced_x86::{Decoder, DecoderOptions, FastFormatter, Instruction};
use serde::{Deserialize, Serialize};

use crate::addrs::{Gpa, Gva};
use crate::engine::MemAccess;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Kind of records written to the trace sink
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// No tracing
    #[default]
    None,

    /// One record per retired instruction
    Instructions,

    /// One record per memory access
    MemoryAccesses,
}

impl std::str::FromStr for TraceKind {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "none" => Ok(TraceKind::None),
            "instructions" | "rip" => Ok(TraceKind::Instructions),
            "memory_accesses" | "mem" => Ok(TraceKind::MemoryAccesses),
            _ => Err(anyhow::anyhow!("Unknown trace kind: {input}")),
        }
    }
}

/// Destination of trace records
pub struct TraceSink {
    /// Kind of records accepted
    kind: TraceKind,

    /// Where the records go. `None` when tracing is off.
    writer: Option<Box<dyn Write + Send>>,

    /// Formatter for instruction records
    formatter: FastFormatter,

    /// Reusable instruction
    instr: Instruction,

    /// Reusable output line
    line: String,
}

impl std::fmt::Debug for TraceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSink")
            .field("kind", &self.kind)
            .field("enabled", &self.writer.is_some())
            .finish()
    }
}

impl Default for TraceSink {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TraceSink {
    /// A sink that drops every record
    #[must_use]
    pub fn disabled() -> Self {
        let mut formatter = FastFormatter::new();
        formatter.options_mut().set_uppercase_hex(false);
        formatter.options_mut().set_use_hex_prefix(true);
        formatter.options_mut().set_always_show_memory_size(true);
        formatter
            .options_mut()
            .set_space_after_operand_separator(true);
        formatter.options_mut().set_rip_relative_addresses(true);

        Self {
            kind: TraceKind::None,
            writer: None,
            formatter,
            instr: Instruction::default(),
            line: String::new(),
        }
    }

    /// Create (or truncate) the file at `path` and write `kind` records into it
    ///
    /// # Errors
    ///
    /// * The file can't be created
    pub fn open(path: &Path, kind: TraceKind) -> Result<Self> {
        if kind == TraceKind::None {
            return Ok(Self::disabled());
        }

        let file =
            File::create(path).with_context(|| format!("Failed to create trace file {path:?}"))?;

        log::info!("Tracing {kind:?} to {path:?}");
        Ok(Self::from_writer(Box::new(BufWriter::new(file)), kind))
    }

    /// Write `kind` records into `writer`
    #[must_use]
    pub fn from_writer(writer: Box<dyn Write + Send>, kind: TraceKind) -> Self {
        let mut sink = Self::disabled();
        if kind != TraceKind::None {
            sink.kind = kind;
            sink.writer = Some(writer);
        }
        sink
    }

    /// Returns `true` if records are being written
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Record that the instruction at `rip` retired. When the opcode `bytes` are
    /// known, the disassembly is added to the record.
    pub fn instruction(&mut self, rip: Gva, bytes: Option<&[u8]>) {
        if self.kind != TraceKind::Instructions || self.writer.is_none() {
            return;
        }

        self.line.clear();

        if let Some(bytes) = bytes.filter(|bytes| !bytes.is_empty()) {
            let mut decoder = Decoder::with_ip(64, bytes, rip.0, DecoderOptions::NONE);
            decoder.decode_out(&mut self.instr);

            if !self.instr.is_invalid() {
                self.formatter.format(&self.instr, &mut self.line);
            }
        }

        let record = if self.line.is_empty() {
            format!("{:#x}\n", rip.0)
        } else {
            format!("{:#x} {}\n", rip.0, self.line)
        };

        self.emit(record.as_bytes());
    }

    /// Record a memory access. Physical accesses have no `gva`.
    pub fn memory_access(&mut self, gva: Option<Gva>, gpa: Gpa, len: usize, access: MemAccess) {
        if self.kind != TraceKind::MemoryAccesses || self.writer.is_none() {
            return;
        }

        let record = match gva {
            Some(gva) => format!("{:#x} {:#x} {len} {access}\n", gva.0, gpa.0),
            None => format!("- {:#x} {len} {access}\n", gpa.0),
        };

        self.emit(record.as_bytes());
    }

    /// Write a record, turning tracing off if the writer fails
    fn emit(&mut self, record: &[u8]) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.write_all(record) {
                log::warn!("Trace write failed, disabling tracing: {err}");
                self.writer = None;
            }
        }
    }

    /// Flush the buffered records
    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("Trace flush failed, disabling tracing: {err}");
                self.writer = None;
            }
        }
    }
}

impl Drop for TraceSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_records_include_disassembly() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut sink = TraceSink::open(file.path(), TraceKind::Instructions).unwrap();

        // nop
        sink.instruction(Gva(0x40_1000), Some(&[0x90]));
        // mov rax, rbx
        sink.instruction(Gva(0x40_1001), Some(&[0x48, 0x89, 0xd8]));
        sink.instruction(Gva(0x40_1004), None);

        // Memory records are ignored by an instruction trace
        sink.memory_access(Some(Gva(0x1000)), Gpa(0x2000), 8, MemAccess::Read);
        drop(sink);

        let data = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<_> = data.lines().collect();
        assert_eq!(lines, vec!["0x401000 nop", "0x401001 mov rax, rbx", "0x401004"]);
    }

    #[test]
    fn memory_records() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut sink = TraceSink::open(file.path(), TraceKind::MemoryAccesses).unwrap();

        sink.memory_access(Some(Gva(0x60_0010)), Gpa(0x1010), 8, MemAccess::Write);
        sink.memory_access(None, Gpa(0x10_0000), 8, MemAccess::Read);
        sink.instruction(Gva(0x40_1000), None);
        sink.flush();

        let data = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(data, "0x600010 0x1010 8 W\n- 0x100000 8 R\n");
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace");
        let mut sink = TraceSink::open(&path, TraceKind::None).unwrap();
        sink.instruction(Gva(0x1000), None);
        assert!(!sink.is_enabled());
        assert!(!path.exists());
    }

    #[test]
    fn parse_kind() {
        assert_eq!("rip".parse::<TraceKind>().unwrap(), TraceKind::Instructions);
        assert_eq!(
            "memory_accesses".parse::<TraceKind>().unwrap(),
            TraceKind::MemoryAccesses
        );
        assert!("cov".parse::<TraceKind>().is_err());
    }
}
