//! Values produced by a capture: registers, memory ranges, stop reasons and
//! the bundled result.

use crate::address::deserialize_address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// i386 register names in debug-stub wire order.
pub const REGISTER_NAMES: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags", "cs", "ss", "ds",
    "es", "fs", "gs",
];

/// Index of the instruction pointer in [`REGISTER_NAMES`]
pub const EIP_INDEX: usize = 8;

/// Snapshot of the i386 register file.
///
/// Serializes as a flat name to integer map, which is also the golden
/// register record format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSet {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

impl RegisterSet {
    /// Values in [`REGISTER_NAMES`] order.
    pub fn values(&self) -> [u32; 16] {
        [
            self.eax,
            self.ecx,
            self.edx,
            self.ebx,
            self.esp,
            self.ebp,
            self.esi,
            self.edi,
            self.eip,
            self.eflags,
            self.cs as u32,
            self.ss as u32,
            self.ds as u32,
            self.es as u32,
            self.fs as u32,
            self.gs as u32,
        ]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u32)> {
        REGISTER_NAMES.into_iter().zip(self.values())
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.iter()
            .find(|(reg, _)| reg.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn is_segment(name: &str) -> bool {
        matches!(name, "cs" | "ss" | "ds" | "es" | "fs" | "gs")
    }

    /// Real-mode linear address of CS:IP (low 16 bits of EIP).
    pub fn code_linear(&self) -> u32 {
        crate::address::seg_offset_to_linear(self.cs, self.eip as u16)
    }

    /// Registers whose values differ, as (name, self, other).
    pub fn diff(&self, other: &RegisterSet) -> Vec<(&'static str, u32, u32)> {
        self.iter()
            .zip(other.values())
            .filter(|((_, a), b)| a != b)
            .map(|((name, a), b)| (name, a, b))
            .collect()
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            if Self::is_segment(name) {
                writeln!(f, "  {:8} = 0x{:04X}", name, value)?;
            } else {
                writeln!(f, "  {:8} = 0x{:08X}", name, value)?;
            }
        }
        Ok(())
    }
}

/// A byte range in the guest's linear address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    #[serde(deserialize_with = "deserialize_address")]
    pub address: u32,
    pub length: usize,
}

impl MemoryRegion {
    /// VGA mode 13h framebuffer: 320x200, one byte per pixel
    pub const MODE13H_FRAMEBUFFER: MemoryRegion = MemoryRegion {
        address: 0xA0000,
        length: 64000,
    };

    pub fn new(address: u32, length: usize) -> Self {
        Self { address, length }
    }

    /// One past the last byte, or `None` if the range leaves the 32-bit space.
    pub fn end(&self) -> Option<u64> {
        let end = self.address as u64 + self.length as u64;
        (end <= 1u64 << 32).then_some(end)
    }
}

/// A region together with the buffer name it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRegion {
    pub name: String,
    #[serde(flatten)]
    pub region: MemoryRegion,
}

impl NamedRegion {
    pub fn new(name: impl Into<String>, address: u32, length: usize) -> Self {
        Self {
            name: name.into(),
            region: MemoryRegion::new(address, length),
        }
    }

    pub fn framebuffer() -> Self {
        Self {
            name: "framebuffer".to_string(),
            region: MemoryRegion::MODE13H_FRAMEBUFFER,
        }
    }
}

/// Why the guest halted, as reported by the debug stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `S`/`T` reply: signal number plus any `key:value` pairs
    Signal { signal: u8, info: Vec<(String, String)> },
    /// `W` reply: process exited
    Exited(u8),
    /// `X` reply: process terminated by signal
    Terminated(u8),
}

impl StopReason {
    /// Value of a `T` reply pair.
    pub fn info(&self, key: &str) -> Option<&str> {
        match self {
            StopReason::Signal { info, .. } => info
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// Register reported inline in a `T` reply (little-endian hex), by number.
    pub fn register(&self, number: usize) -> Option<u32> {
        let hex = self.info(&format!("{:02x}", number))?;
        if hex.len() != 8 {
            return None;
        }
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(u32::from_le_bytes(bytes))
    }

    /// Whether the guest is still alive and can be resumed.
    pub fn is_halt(&self) -> bool {
        matches!(self, StopReason::Signal { .. })
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Signal { signal, info } => {
                write!(f, "signal {}", signal)?;
                for (k, v) in info {
                    write!(f, " {}={}", k, v)?;
                }
                Ok(())
            }
            StopReason::Exited(code) => write!(f, "exited with status {}", code),
            StopReason::Terminated(signal) => write!(f, "terminated by signal {}", signal),
        }
    }
}

/// Everything one capture sequence produced. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureResult {
    scenario: String,
    buffers: Vec<(String, Vec<u8>)>,
    registers: Option<RegisterSet>,
    stop: Option<StopReason>,
    screenshot: Option<PathBuf>,
}

impl CaptureResult {
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn buffer(&self, name: &str) -> Option<&[u8]> {
        self.buffers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    /// Buffers in capture order
    pub fn buffers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.buffers
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn registers(&self) -> Option<&RegisterSet> {
        self.registers.as_ref()
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop.as_ref()
    }

    pub fn screenshot(&self) -> Option<&Path> {
        self.screenshot.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.registers.is_none() && self.screenshot.is_none()
    }
}

/// Accumulates a [`CaptureResult`] step by step.
///
/// Only the code that sequences a capture holds a builder; everyone else sees
/// the frozen result.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuilder {
    inner: CaptureResult,
}

impl CaptureBuilder {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            inner: CaptureResult {
                scenario: scenario.into(),
                ..Default::default()
            },
        }
    }

    /// Add a buffer. A second buffer with the same name replaces the first.
    pub fn push_buffer(&mut self, name: impl Into<String>, data: Vec<u8>) -> &mut Self {
        let name = name.into();
        match self.inner.buffers.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = data,
            None => self.inner.buffers.push((name, data)),
        }
        self
    }

    pub fn registers(&mut self, registers: RegisterSet) -> &mut Self {
        self.inner.registers = Some(registers);
        self
    }

    pub fn stop_reason(&mut self, stop: StopReason) -> &mut Self {
        self.inner.stop = Some(stop);
        self
    }

    pub fn screenshot(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.inner.screenshot = Some(path.into());
        self
    }

    pub fn build(self) -> CaptureResult {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registers() -> RegisterSet {
        RegisterSet {
            eax: 0x1234,
            eip: 0x0000_03F0,
            eflags: 0x0202,
            cs: 0x1A00,
            ds: 0x2A30,
            ..Default::default()
        }
    }

    #[test]
    fn test_register_lookup_by_name() {
        let regs = sample_registers();
        assert_eq!(regs.get("eax"), Some(0x1234));
        assert_eq!(regs.get("EIP"), Some(0x03F0));
        assert_eq!(regs.get("ds"), Some(0x2A30));
        assert_eq!(regs.get("xmm0"), None);
        assert_eq!(regs.iter().count(), 16);
    }

    #[test]
    fn test_register_json_record_is_name_to_integer_map() {
        let regs = sample_registers();
        let json = serde_json::to_value(regs).unwrap();
        let map = json.as_object().unwrap();
        assert_eq!(map.len(), 16);
        assert_eq!(map["cs"], 0x1A00);
        assert_eq!(map["eflags"], 0x0202);
        let back: RegisterSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, regs);
    }

    #[test]
    fn test_register_diff_and_code_linear() {
        let a = sample_registers();
        let mut b = a;
        b.eax = 0;
        b.gs = 7;
        let diff = a.diff(&b);
        assert_eq!(diff, vec![("eax", 0x1234, 0), ("gs", 0, 7)]);
        assert_eq!(a.code_linear(), 0x1A3F0);
    }

    #[test]
    fn test_register_display_widths() {
        let text = sample_registers().to_string();
        assert!(text.contains("eax      = 0x00001234"));
        assert!(text.contains("cs       = 0x1A00"));
    }

    #[test]
    fn test_region_end() {
        assert_eq!(MemoryRegion::MODE13H_FRAMEBUFFER.end(), Some(0xA0000 + 64000));
        assert_eq!(MemoryRegion::new(0xFFFF_FFFF, 2).end(), None);
    }

    #[test]
    fn test_named_region_json_accepts_hex_address() {
        let r: NamedRegion =
            serde_json::from_str(r#"{"name": "state", "address": "2A30:0100", "length": 256}"#)
                .unwrap();
        assert_eq!(r, NamedRegion::new("state", 0x2A400, 256));
    }

    #[test]
    fn test_stop_reason_inline_register() {
        let stop = StopReason::Signal {
            signal: 5,
            info: vec![
                ("08".to_string(), "f0a30100".to_string()),
                ("thread".to_string(), "01".to_string()),
            ],
        };
        assert_eq!(stop.register(EIP_INDEX), Some(0x0001_A3F0));
        assert_eq!(stop.info("thread"), Some("01"));
        assert_eq!(stop.register(4), None);
        assert!(stop.is_halt());
        assert!(!StopReason::Exited(0).is_halt());
    }

    #[test]
    fn test_builder_keeps_order_and_replaces_duplicates() {
        let mut builder = CaptureBuilder::new("idle");
        builder
            .push_buffer("framebuffer", vec![1, 2])
            .push_buffer("state", vec![3])
            .push_buffer("framebuffer", vec![9]);
        let result = builder.build();

        let names: Vec<_> = result.buffers().map(|(n, _)| n).collect();
        assert_eq!(names, ["framebuffer", "state"]);
        assert_eq!(result.buffer("framebuffer"), Some(&[9u8][..]));
        assert_eq!(result.scenario(), "idle");
        assert!(!result.is_empty());
        assert!(CaptureBuilder::new("x").build().is_empty());
    }
}
