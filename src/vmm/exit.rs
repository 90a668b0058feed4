//! VM exits as seen by exit handlers, and decoding of the KVM run state.

use std::fmt;

use kvm_bindings::*;
use thiserror::Error;

use super::vmx::{EptViolation, VmxExit};
use crate::types::{IoData, IoWidth};


/// Why an exit could not be turned into a meaningful `VMExit`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExitDecodeError {
    #[error("port {port:#x}: invalid access size {size}")]
    InvalidIoWidth { port: u16, size: u8 },

    #[error("I/O data at offset {offset:#x} (+{len}) lies outside the run state")]
    DataOutOfBounds { offset: usize, len: usize },

    #[error("invalid exception vector {0}")]
    InvalidExceptionVector(u32),

    #[error("invalid MMIO access length {0}")]
    InvalidMmioLength(u32),

    #[error("reserved encoding in VMX instruction info {0:#x}")]
    InvalidInstructionInfo(u32),

    #[error("port {port:#x}: fetched {have:?} for a {want:?} string access")]
    FetchWidthMismatch { port: u16, want: IoWidth, have: IoWidth },

    #[error("guest memory at {0:#x} is not mapped")]
    GuestMemoryUnavailable(u64),
}


/// Architectural exception vectors 0-31 that are defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorSegmentOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
    Virtualization = 20,
    ControlProtection = 21,
}


impl ExceptionVector {
    pub fn from_raw(vector: u32) -> Option<Self> {
        use ExceptionVector::*;
        Some(match vector {
            0 => DivideError,
            1 => Debug,
            2 => Nmi,
            3 => Breakpoint,
            4 => Overflow,
            5 => BoundRange,
            6 => InvalidOpcode,
            7 => DeviceNotAvailable,
            8 => DoubleFault,
            9 => CoprocessorSegmentOverrun,
            10 => InvalidTss,
            11 => SegmentNotPresent,
            12 => StackFault,
            13 => GeneralProtection,
            14 => PageFault,
            16 => FloatingPoint,
            17 => AlignmentCheck,
            18 => MachineCheck,
            19 => SimdFloatingPoint,
            20 => Virtualization,
            21 => ControlProtection,
            _ => return None,
        })
    }

    /// Only these vectors push an error code.
    pub fn has_error_code(&self) -> bool {
        use ExceptionVector::*;
        matches!(
            self,
            DoubleFault
                | InvalidTss
                | SegmentNotPresent
                | StackFault
                | GeneralProtection
                | PageFault
                | AlignmentCheck
                | ControlProtection
        )
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExceptionInfo {
    pub vector: ExceptionVector,
    pub error_code: Option<u32>,
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DebugInfo {
    pub exception: u32,
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
}


/// A single guest exit handed to the exit handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VMExit {
    /// Hardware exit reason KVM could not handle, or an exit reason this
    /// library does not know.
    Unknown(u64),
    Exception(ExceptionInfo),
    /// Answer with `ExitContext::set_in`; the guest reads zero otherwise.
    IoIn { port: u16, width: IoWidth },
    IoOut { port: u16, data: IoData },
    Debug(DebugInfo),
    Hlt,
    MmioRead { address: u64, width: IoWidth },
    MmioWrite { address: u64, data: IoData },
    IrqWindowOpen,
    Shutdown,
    EntryFailed(VmxExit),
    /// The run was cut short by a signal.
    Interrupted,
    SetTpr,
    TprAccess,
    Nmi,
    InternalError { suberror: u32, ndata: u32 },
    EptViolation(EptViolation),
    SystemEvent(u32),
    IoapicEoi(u8),
    HyperV,
    DecodeFailure(ExitDecodeError),
}


impl fmt::Display for VMExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VMExit::IoIn { port, width } => write!(f, "IN {:?} from port {:#06x}", width, port),
            VMExit::IoOut { port, data } => write!(f, "OUT {} to port {:#06x}", data, port),
            VMExit::MmioRead { address, width } => write!(f, "MMIO read {:?} at {:#x}", width, address),
            VMExit::MmioWrite { address, data } => write!(f, "MMIO write {} at {:#x}", data, address),
            VMExit::DecodeFailure(e) => write!(f, "undecodable exit: {}", e),
            other => write!(f, "{:?}", other),
        }
    }
}


/// The parts of `kvm_run` the decoder needs, copied out of the shared page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KvmExit {
    Unknown { hardware_exit_reason: u64 },
    Exception { exception: u32, error_code: u32 },
    Io { direction: u8, size: u8, port: u16, count: u32, data_offset: u64 },
    Debug(DebugInfo),
    Hlt,
    /// `data_offset` is the offset of `mmio.data` within the run state.
    Mmio { phys_addr: u64, data: [u8; 8], len: u32, is_write: bool, data_offset: usize },
    IrqWindowOpen,
    Shutdown,
    FailEntry { hardware_entry_failure_reason: u64 },
    Intr,
    SetTpr,
    TprAccess,
    Nmi,
    InternalError { suberror: u32, ndata: u32 },
    SystemEvent { type_: u32 },
    IoapicEoi { vector: u8 },
    HyperV,
    Other(u32),
}


impl KvmExit {
    /// Copies the exit description out of a run state that KVM just filled.
    pub(crate) fn from_kvm_run(run: &kvm_run) -> Self {
        // SAFETY: the union member read in each arm is the one KVM documents
        // as valid for that exit reason, and all members are plain data.
        unsafe {
            let u = &run.__bindgen_anon_1;
            match run.exit_reason {
                KVM_EXIT_UNKNOWN => KvmExit::Unknown { hardware_exit_reason: u.hw.hardware_exit_reason },
                KVM_EXIT_EXCEPTION => KvmExit::Exception { exception: u.ex.exception, error_code: u.ex.error_code },
                KVM_EXIT_IO => KvmExit::Io {
                    direction: u.io.direction,
                    size: u.io.size,
                    port: u.io.port,
                    count: u.io.count,
                    data_offset: u.io.data_offset,
                },
                KVM_EXIT_DEBUG => KvmExit::Debug(DebugInfo {
                    exception: u.debug.arch.exception,
                    pc: u.debug.arch.pc,
                    dr6: u.debug.arch.dr6,
                    dr7: u.debug.arch.dr7,
                }),
                KVM_EXIT_HLT => KvmExit::Hlt,
                KVM_EXIT_MMIO => KvmExit::Mmio {
                    phys_addr: u.mmio.phys_addr,
                    data: u.mmio.data,
                    len: u.mmio.len,
                    is_write: u.mmio.is_write != 0,
                    data_offset: std::ptr::addr_of!(u.mmio.data) as usize - run as *const kvm_run as usize,
                },
                KVM_EXIT_IRQ_WINDOW_OPEN => KvmExit::IrqWindowOpen,
                KVM_EXIT_SHUTDOWN => KvmExit::Shutdown,
                KVM_EXIT_FAIL_ENTRY => KvmExit::FailEntry {
                    hardware_entry_failure_reason: u.fail_entry.hardware_entry_failure_reason,
                },
                KVM_EXIT_INTR => KvmExit::Intr,
                KVM_EXIT_SET_TPR => KvmExit::SetTpr,
                KVM_EXIT_TPR_ACCESS => KvmExit::TprAccess,
                KVM_EXIT_NMI => KvmExit::Nmi,
                KVM_EXIT_INTERNAL_ERROR => KvmExit::InternalError {
                    suberror: u.internal.suberror,
                    ndata: u.internal.ndata,
                },
                KVM_EXIT_SYSTEM_EVENT => KvmExit::SystemEvent { type_: u.system_event.type_ },
                KVM_EXIT_IOAPIC_EOI => KvmExit::IoapicEoi { vector: u.eoi.vector },
                KVM_EXIT_HYPERV => KvmExit::HyperV,
                other => KvmExit::Other(other),
            }
        }
    }
}


/// One exit to deliver. `in_slot` is where `set_in` writes the answer to an
/// IN or MMIO read: (byte offset into the run state, width).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingExit {
    pub exit: VMExit,
    pub in_slot: Option<(usize, IoWidth)>,
}


impl PendingExit {
    fn plain(exit: VMExit) -> Self { Self { exit, in_slot: None } }
}


/// Turns a KVM exit into the exits the handler sees, in order.
///
/// String I/O (`count > 1`) yields one exit per unit, each with its own data
/// slot. `run` is the whole shared run state, which holds the I/O data.
pub(crate) fn decode_exit(exit: &KvmExit, run: &[u8]) -> Vec<PendingExit> {
    let single = |e: VMExit| vec![PendingExit::plain(e)];
    match *exit {
        KvmExit::Unknown { hardware_exit_reason } => single(VMExit::Unknown(hardware_exit_reason)),
        KvmExit::Exception { exception, error_code } => match ExceptionVector::from_raw(exception) {
            Some(vector) => single(VMExit::Exception(ExceptionInfo {
                vector,
                error_code: vector.has_error_code().then_some(error_code),
            })),
            None => single(VMExit::DecodeFailure(ExitDecodeError::InvalidExceptionVector(exception))),
        },
        KvmExit::Io { direction, size, port, count, data_offset } => {
            decode_io(direction, size, port, count, data_offset as usize, run)
        }
        KvmExit::Debug(info) => single(VMExit::Debug(info)),
        KvmExit::Hlt => single(VMExit::Hlt),
        KvmExit::Mmio { phys_addr, data, len, is_write, data_offset } => {
            let width = match IoWidth::from_bytes(len as usize) {
                Some(width) => width,
                None => return single(VMExit::DecodeFailure(ExitDecodeError::InvalidMmioLength(len))),
            };
            if is_write {
                match IoData::from_le_slice(width, &data) {
                    Some(data) => single(VMExit::MmioWrite { address: phys_addr, data }),
                    None => single(VMExit::DecodeFailure(ExitDecodeError::InvalidMmioLength(len))),
                }
            } else {
                vec![PendingExit {
                    exit: VMExit::MmioRead { address: phys_addr, width },
                    in_slot: Some((data_offset, width)),
                }]
            }
        }
        KvmExit::IrqWindowOpen => single(VMExit::IrqWindowOpen),
        KvmExit::Shutdown => single(VMExit::Shutdown),
        KvmExit::FailEntry { hardware_entry_failure_reason } => {
            single(VMExit::EntryFailed(VmxExit(hardware_entry_failure_reason as u32)))
        }
        KvmExit::Intr => single(VMExit::Interrupted),
        KvmExit::SetTpr => single(VMExit::SetTpr),
        KvmExit::TprAccess => single(VMExit::TprAccess),
        KvmExit::Nmi => single(VMExit::Nmi),
        KvmExit::InternalError { suberror, ndata } => single(VMExit::InternalError { suberror, ndata }),
        KvmExit::SystemEvent { type_ } => single(VMExit::SystemEvent(type_)),
        KvmExit::IoapicEoi { vector } => single(VMExit::IoapicEoi(vector)),
        KvmExit::HyperV => single(VMExit::HyperV),
        KvmExit::Other(reason) => single(VMExit::Unknown(reason as u64)),
    }
}


fn decode_io(direction: u8, size: u8, port: u16, count: u32, data_offset: usize, run: &[u8]) -> Vec<PendingExit> {
    let width = match IoWidth::from_bytes(size as usize) {
        Some(width) => width,
        None => {
            return vec![PendingExit::plain(VMExit::DecodeFailure(ExitDecodeError::InvalidIoWidth { port, size }))];
        }
    };
    let len = width.bytes();
    let mut exits = Vec::with_capacity(count as usize);
    for unit in 0..count as usize {
        let offset = data_offset + unit * len;
        let slot = match run.get(offset..offset + len) {
            Some(slot) => slot,
            None => {
                exits.push(PendingExit::plain(VMExit::DecodeFailure(ExitDecodeError::DataOutOfBounds { offset, len })));
                break;
            }
        };
        if direction == KVM_EXIT_IO_IN as u8 {
            exits.push(PendingExit { exit: VMExit::IoIn { port, width }, in_slot: Some((offset, width)) });
        } else {
            // from_le_slice cannot fail, the slot is exactly `len` bytes
            if let Some(data) = IoData::from_le_slice(width, slot) {
                exits.push(PendingExit::plain(VMExit::IoOut { port, data }));
            }
        }
    }
    exits
}


#[cfg(test)]
mod tests {
    use super::*;

    fn io(direction: u32, size: u8, port: u16, count: u32, data_offset: u64) -> KvmExit {
        KvmExit::Io { direction: direction as u8, size, port, count, data_offset }
    }

    fn exits(pending: Vec<PendingExit>) -> Vec<VMExit> { pending.into_iter().map(|p| p.exit).collect() }

    #[test]
    fn out_of_every_width() {
        let mut run = vec![0u8; 64];
        run[16..24].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        for (size, data) in [
            (1, IoData::Byte(0x88)),
            (2, IoData::Word(0x7788)),
            (4, IoData::Dword(0x5566_7788)),
            (8, IoData::Qword(0x1122_3344_5566_7788)),
        ] {
            let decoded = decode_exit(&io(KVM_EXIT_IO_OUT, size, 0x3f8, 1, 16), &run);
            assert_eq!(exits(decoded), vec![VMExit::IoOut { port: 0x3f8, data }]);
        }
    }

    #[test]
    fn out_data_may_be_unaligned() {
        let mut run = vec![0u8; 32];
        run[5..13].copy_from_slice(&0x0807_0605_dead_beefu64.to_le_bytes());
        for (size, data) in [
            (1, IoData::Byte(0xef)),
            (2, IoData::Word(0xbeef)),
            (4, IoData::Dword(0xdead_beef)),
            (8, IoData::Qword(0x0807_0605_dead_beef)),
        ] {
            let decoded = decode_exit(&io(KVM_EXIT_IO_OUT, size, 0x80, 1, 5), &run);
            assert_eq!(exits(decoded), vec![VMExit::IoOut { port: 0x80, data }]);
        }

        // odd offsets for the narrow widths too
        run[3..5].copy_from_slice(&[0x34, 0x12]);
        let decoded = decode_exit(&io(KVM_EXIT_IO_OUT, 2, 0x80, 1, 3), &run);
        assert_eq!(exits(decoded), vec![VMExit::IoOut { port: 0x80, data: IoData::Word(0x1234) }]);
        let decoded = decode_exit(&io(KVM_EXIT_IO_OUT, 1, 0x80, 1, 3), &run);
        assert_eq!(exits(decoded), vec![VMExit::IoOut { port: 0x80, data: IoData::Byte(0x34) }]);
    }

    #[test]
    fn string_out_is_split_per_unit() {
        let mut run = vec![0u8; 32];
        run[3..9].copy_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let decoded = decode_exit(&io(KVM_EXIT_IO_OUT, 2, 0x10, 3, 3), &run);
        assert_eq!(
            exits(decoded),
            vec![
                VMExit::IoOut { port: 0x10, data: IoData::Word(0x0201) },
                VMExit::IoOut { port: 0x10, data: IoData::Word(0x0403) },
                VMExit::IoOut { port: 0x10, data: IoData::Word(0x0605) },
            ]
        );
    }

    #[test]
    fn string_in_gets_one_slot_per_unit() {
        let run = vec![0u8; 64];
        let decoded = decode_exit(&io(KVM_EXIT_IO_IN, 4, 0x60, 3, 8), &run);
        assert_eq!(decoded.len(), 3);
        for (i, pending) in decoded.iter().enumerate() {
            assert_eq!(pending.exit, VMExit::IoIn { port: 0x60, width: IoWidth::Dword });
            assert_eq!(pending.in_slot, Some((8 + i * 4, IoWidth::Dword)));
        }
    }

    #[test]
    fn invalid_width_is_a_decode_failure() {
        let run = vec![0u8; 16];
        let decoded = decode_exit(&io(KVM_EXIT_IO_OUT, 3, 0x60, 1, 0), &run);
        assert_eq!(
            exits(decoded),
            vec![VMExit::DecodeFailure(ExitDecodeError::InvalidIoWidth { port: 0x60, size: 3 })]
        );
    }

    #[test]
    fn data_past_the_run_state_stops_decoding() {
        let run = vec![0u8; 8];
        let decoded = decode_exit(&io(KVM_EXIT_IO_OUT, 4, 0x60, 3, 0), &run);
        assert_eq!(
            exits(decoded),
            vec![
                VMExit::IoOut { port: 0x60, data: IoData::Dword(0) },
                VMExit::IoOut { port: 0x60, data: IoData::Dword(0) },
                VMExit::DecodeFailure(ExitDecodeError::DataOutOfBounds { offset: 8, len: 4 }),
            ]
        );
    }

    #[test]
    fn mmio_read_and_write() {
        let run = vec![0u8; 64];
        let write = KvmExit::Mmio {
            phys_addr: 0xd000_0000,
            data: [0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0],
            len: 4,
            is_write: true,
            data_offset: 40,
        };
        assert_eq!(
            exits(decode_exit(&write, &run)),
            vec![VMExit::MmioWrite { address: 0xd000_0000, data: IoData::Dword(0x1234_5678) }]
        );

        let read = KvmExit::Mmio { phys_addr: 0xd000_0004, data: [0; 8], len: 2, is_write: false, data_offset: 40 };
        let decoded = decode_exit(&read, &run);
        assert_eq!(decoded[0].exit, VMExit::MmioRead { address: 0xd000_0004, width: IoWidth::Word });
        assert_eq!(decoded[0].in_slot, Some((40, IoWidth::Word)));

        let bad = KvmExit::Mmio { phys_addr: 0, data: [0; 8], len: 5, is_write: true, data_offset: 40 };
        assert_eq!(
            exits(decode_exit(&bad, &run)),
            vec![VMExit::DecodeFailure(ExitDecodeError::InvalidMmioLength(5))]
        );
    }

    #[test]
    fn exceptions_carry_error_codes_only_when_defined() {
        let gp = KvmExit::Exception { exception: 13, error_code: 0x18 };
        assert_eq!(
            exits(decode_exit(&gp, &[])),
            vec![VMExit::Exception(ExceptionInfo { vector: ExceptionVector::GeneralProtection, error_code: Some(0x18) })]
        );
        let ud = KvmExit::Exception { exception: 6, error_code: 0x18 };
        assert_eq!(
            exits(decode_exit(&ud, &[])),
            vec![VMExit::Exception(ExceptionInfo { vector: ExceptionVector::InvalidOpcode, error_code: None })]
        );
        let reserved = KvmExit::Exception { exception: 15, error_code: 0 };
        assert_eq!(
            exits(decode_exit(&reserved, &[])),
            vec![VMExit::DecodeFailure(ExitDecodeError::InvalidExceptionVector(15))]
        );
    }

    #[test]
    fn simple_reasons() {
        assert_eq!(exits(decode_exit(&KvmExit::Hlt, &[])), vec![VMExit::Hlt]);
        assert_eq!(exits(decode_exit(&KvmExit::Intr, &[])), vec![VMExit::Interrupted]);
        assert_eq!(
            exits(decode_exit(&KvmExit::Unknown { hardware_exit_reason: 0x42 }, &[])),
            vec![VMExit::Unknown(0x42)]
        );
        assert_eq!(exits(decode_exit(&KvmExit::Other(99), &[])), vec![VMExit::Unknown(99)]);
        assert_eq!(
            exits(decode_exit(&KvmExit::FailEntry { hardware_entry_failure_reason: 0x8000_0021 }, &[])),
            vec![VMExit::EntryFailed(VmxExit(0x8000_0021))]
        );
    }

    #[test]
    #[allow(unused_unsafe)]
    fn run_state_is_read_by_reason() {
        let mut run = kvm_run::default();
        run.exit_reason = KVM_EXIT_IO;
        unsafe {
            run.__bindgen_anon_1.io.direction = KVM_EXIT_IO_IN as u8;
            run.__bindgen_anon_1.io.size = 2;
            run.__bindgen_anon_1.io.port = 0x71;
            run.__bindgen_anon_1.io.count = 1;
            run.__bindgen_anon_1.io.data_offset = 4096;
        }
        assert_eq!(KvmExit::from_kvm_run(&run), io(KVM_EXIT_IO_IN, 2, 0x71, 1, 4096));

        run.exit_reason = 0xdead;
        assert_eq!(KvmExit::from_kvm_run(&run), KvmExit::Other(0xdead));
    }
}
