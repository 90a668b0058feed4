use serde::{Deserialize, Serialize};
use std::fmt;


/// Operand width of a port or MMIO access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoWidth {
    Byte,
    Word,
    Dword,
    Qword,
}


impl IoWidth {
    /// Maps an access size in bytes to a width. Only 1, 2, 4 and 8 are valid.
    pub fn from_bytes(size: usize) -> Option<Self> {
        match size {
            1 => Some(IoWidth::Byte),
            2 => Some(IoWidth::Word),
            4 => Some(IoWidth::Dword),
            8 => Some(IoWidth::Qword),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            IoWidth::Byte => 1,
            IoWidth::Word => 2,
            IoWidth::Dword => 4,
            IoWidth::Qword => 8,
        }
    }

    pub fn bits(self) -> u32 { self.bytes() as u32 * 8 }
}


/// A value moved through a port or MMIO access, tagged with its width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoData {
    Byte(u8),
    Word(u16),
    Dword(u32),
    Qword(u64),
}


impl IoData {
    pub fn width(&self) -> IoWidth {
        match self {
            IoData::Byte(_) => IoWidth::Byte,
            IoData::Word(_) => IoWidth::Word,
            IoData::Dword(_) => IoWidth::Dword,
            IoData::Qword(_) => IoWidth::Qword,
        }
    }

    /// Truncates `value` to `width`, as an OUT from the accumulator does.
    pub fn truncate(width: IoWidth, value: u64) -> Self {
        match width {
            IoWidth::Byte => IoData::Byte(value as u8),
            IoWidth::Word => IoData::Word(value as u16),
            IoWidth::Dword => IoData::Dword(value as u32),
            IoWidth::Qword => IoData::Qword(value),
        }
    }

    /// Reads exactly `width.bytes()` little-endian bytes from the start of
    /// `bytes`. No alignment is required. Returns `None` if `bytes` is short.
    pub fn from_le_slice(width: IoWidth, bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..width.bytes())?;
        let mut buf = [0u8; 8];
        buf[..raw.len()].copy_from_slice(raw);
        Some(IoData::truncate(width, u64::from_le_bytes(buf)))
    }

    /// Writes the value little-endian into the start of `out`. Returns `false`
    /// if `out` is shorter than the width.
    pub fn write_le(&self, out: &mut [u8]) -> bool {
        let len = self.width().bytes();
        match out.get_mut(..len) {
            Some(dst) => {
                dst.copy_from_slice(&self.value().to_le_bytes()[..len]);
                true
            }
            None => false,
        }
    }

    /// Zero-extended value.
    pub fn value(&self) -> u64 {
        match *self {
            IoData::Byte(v) => v as u64,
            IoData::Word(v) => v as u64,
            IoData::Dword(v) => v as u64,
            IoData::Qword(v) => v,
        }
    }
}


impl fmt::Display for IoData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoData::Byte(v) => write!(f, "{:#04x}", v),
            IoData::Word(v) => write!(f, "{:#06x}", v),
            IoData::Dword(v) => write!(f, "{:#010x}", v),
            IoData::Qword(v) => write!(f, "{:#018x}", v),
        }
    }
}


/// Lifecycle of a vCPU. There is no transition out of `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    Created,
    Running,
    Stopped,
}
