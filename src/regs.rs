//! Register names and the register file captured in a snapshot

use serde::{Deserialize, Serialize};
use serde_hex::{CompactPfx, SerHex};

/// A segment register as captured in the snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Segment {
    #[serde(with = "SerHex::<CompactPfx>")]
    pub selector: u16,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub limit: u32,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub attr: u16,
    #[serde(default)]
    pub present: bool,
}

/// Generates the [`Register`] enum along with the accessors into [`CpuState`]
macro_rules! impl_registers {
    ($($variant:ident => $field:ident),+ $(,)?) => {
        /// Registers that can be read and written through a backend
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        #[allow(missing_docs)]
        pub enum Register {
            $($variant),+
        }

        impl Register {
            /// Every register, in declaration order
            pub const ALL: &'static [Register] = &[$(Register::$variant),+];

            /// Lowercase name of the register
            #[must_use]
            pub fn name(self) -> &'static str {
                match self {
                    $(Register::$variant => stringify!($field)),+
                }
            }
        }

        impl std::str::FromStr for Register {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $(stringify!($field) => Ok(Register::$variant),)+
                    _ => Err(format!("unknown register: {s}")),
                }
            }
        }

        impl CpuState {
            /// Read the given [`Register`]
            #[must_use]
            pub fn reg(&self, reg: Register) -> u64 {
                match reg {
                    $(Register::$variant => self.$field),+
                }
            }

            /// Write the given [`Register`], returning the previous value
            pub fn set_reg(&mut self, reg: Register, value: u64) -> u64 {
                match reg {
                    $(Register::$variant => std::mem::replace(&mut self.$field, value)),+
                }
            }
        }
    };
}

/// Register file of the guest. Supplied as the baseline when a backend is created or
/// restored and read back through the register accessors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct CpuState {
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rax: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rbx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rcx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rdx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rsi: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rdi: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rsp: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rbp: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r8: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r9: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r10: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r11: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r12: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r13: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r14: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r15: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rip: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rflags: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr0: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr2: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr3: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr4: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr8: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub efer: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub fs_base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub gs_base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub kernel_gs_base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub lstar: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub tsc: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub xcr0: u64,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
}

impl_registers! {
    Rax => rax,
    Rbx => rbx,
    Rcx => rcx,
    Rdx => rdx,
    Rsi => rsi,
    Rdi => rdi,
    Rsp => rsp,
    Rbp => rbp,
    R8 => r8,
    R9 => r9,
    R10 => r10,
    R11 => r11,
    R12 => r12,
    R13 => r13,
    R14 => r14,
    R15 => r15,
    Rip => rip,
    Rflags => rflags,
    Cr0 => cr0,
    Cr2 => cr2,
    Cr3 => cr3,
    Cr4 => cr4,
    Cr8 => cr8,
    Efer => efer,
    FsBase => fs_base,
    GsBase => gs_base,
    KernelGsBase => kernel_gs_base,
    Lstar => lstar,
    Tsc => tsc,
    Xcr0 => xcr0,
}

impl CpuState {
    /// Parse a register file from its JSON form
    ///
    /// # Errors
    ///
    /// * The JSON is malformed or a register value isn't hex encoded
    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reg_returns_previous_value() {
        let mut state = CpuState::default();
        assert_eq!(state.set_reg(Register::Rax, 0x41), 0);
        assert_eq!(state.set_reg(Register::Rax, 0x42), 0x41);
        assert_eq!(state.reg(Register::Rax), 0x42);
        assert_eq!(state.rax, 0x42);
    }

    #[test]
    fn every_register_round_trips_by_name() {
        for reg in Register::ALL {
            let parsed: Register = reg.name().parse().unwrap();
            assert_eq!(parsed, *reg);
        }
        assert!("xmm0".parse::<Register>().is_err());
    }

    #[test]
    fn registers_are_independent() {
        let mut state = CpuState::default();
        for (i, reg) in Register::ALL.iter().enumerate() {
            state.set_reg(*reg, i as u64 + 1);
        }
        for (i, reg) in Register::ALL.iter().enumerate() {
            assert_eq!(state.reg(*reg), i as u64 + 1, "{}", reg.name());
        }
    }

    #[test]
    fn json_is_hex_encoded() {
        let mut state = CpuState::default();
        state.rip = 0x40_1000;
        state.cr3 = 0x10_0000;

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"rip\":\"0x401000\""));

        let back = CpuState::from_json(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn missing_registers_default_to_zero() {
        let state = CpuState::from_json(r#"{"rip": "0x1000", "rsp": "0x7fff0000"}"#).unwrap();
        assert_eq!(state.rip, 0x1000);
        assert_eq!(state.rsp, 0x7fff_0000);
        assert_eq!(state.rax, 0);
    }
}
