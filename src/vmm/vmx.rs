//! Bit-level decoding of Intel VMX exit information.
//!
//! KVM hands these values back verbatim in a few places (the hardware reason
//! of `KVM_EXIT_UNKNOWN` and `KVM_EXIT_FAIL_ENTRY`). Hosts that expose raw VMX
//! exits can decode a complete exit with [`decode_vmx_exit`].

use std::fmt;

use super::exit::{ExitDecodeError, VMExit};
use crate::types::{IoData, IoWidth};


fn bit(value: u64, n: u32) -> bool { value & (1 << n) != 0 }

fn bits(value: u64, lo: u32, hi: u32) -> u64 { (value >> lo) & ((1 << (hi - lo + 1)) - 1) }


/// The 32-bit VM-exit reason field: basic reason in bits 0-15 plus flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmxExit(pub u32);


impl VmxExit {
    pub fn basic_reason(&self) -> u16 { self.0 as u16 }

    pub fn reason(&self) -> Option<VmxExitReason> { VmxExitReason::from_raw(self.basic_reason()) }

    pub fn in_enclave_mode(&self) -> bool { bit(self.0 as u64, 27) }

    pub fn pending_mtf_exit(&self) -> bool { bit(self.0 as u64, 28) }

    pub fn from_vmx_root_operation(&self) -> bool { bit(self.0 as u64, 29) }

    pub fn entry_failure(&self) -> bool { bit(self.0 as u64, 31) }
}


impl fmt::Debug for VmxExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("VmxExit");
        match self.reason() {
            Some(reason) => s.field("reason", &reason),
            None => s.field("reason", &self.basic_reason()),
        };
        s.field("enclave", &self.in_enclave_mode())
            .field("pending_mtf", &self.pending_mtf_exit())
            .field("vmx_root", &self.from_vmx_root_operation())
            .field("entry_failure", &self.entry_failure())
            .finish()
    }
}


macro_rules! exit_reasons {
    ($($name:ident = $value:literal, $desc:literal;)*) => {
        /// Basic VM-exit reasons (Intel SDM Vol. 3 Appendix C).
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum VmxExitReason {
            $($name = $value,)*
        }

        impl VmxExitReason {
            pub fn from_raw(raw: u16) -> Option<Self> {
                match raw {
                    $($value => Some(VmxExitReason::$name),)*
                    _ => None,
                }
            }

            pub fn description(&self) -> &'static str {
                match self {
                    $(VmxExitReason::$name => $desc,)*
                }
            }
        }
    };
}


exit_reasons! {
    ExceptionOrNmi = 0, "Exception or NMI";
    ExternalInterrupt = 1, "External interrupt";
    TripleFault = 2, "Triple fault";
    InitSignal = 3, "INIT signal";
    StartupIpi = 4, "Start-up IPI";
    IoSmi = 5, "I/O system-management interrupt";
    OtherSmi = 6, "Other SMI";
    InterruptWindow = 7, "Interrupt window";
    NmiWindow = 8, "NMI window";
    TaskSwitch = 9, "Task switch";
    Cpuid = 10, "CPUID";
    Getsec = 11, "GETSEC";
    Hlt = 12, "HLT";
    Invd = 13, "INVD";
    Invlpg = 14, "INVLPG";
    Rdpmc = 15, "RDPMC";
    Rdtsc = 16, "RDTSC";
    Rsm = 17, "RSM";
    Vmcall = 18, "VMCALL";
    Vmclear = 19, "VMCLEAR";
    Vmlaunch = 20, "VMLAUNCH";
    Vmptrld = 21, "VMPTRLD";
    Vmptrst = 22, "VMPTRST";
    Vmread = 23, "VMREAD";
    Vmresume = 24, "VMRESUME";
    Vmwrite = 25, "VMWRITE";
    Vmxoff = 26, "VMXOFF";
    Vmxon = 27, "VMXON";
    CrAccess = 28, "Control-register access";
    DrAccess = 29, "MOV DR";
    IoInstruction = 30, "I/O instruction";
    Rdmsr = 31, "RDMSR";
    Wrmsr = 32, "WRMSR";
    EntryFailInvalidGuestState = 33, "VM-entry failure due to invalid guest state";
    EntryFailMsrLoading = 34, "VM-entry failure due to MSR loading";
    Mwait = 36, "MWAIT";
    MonitorTrapFlag = 37, "Monitor trap flag";
    Monitor = 39, "MONITOR";
    Pause = 40, "PAUSE";
    EntryFailMachineCheck = 41, "VM-entry failure due to machine-check event";
    TprBelowThreshold = 43, "TPR below threshold";
    ApicAccess = 44, "APIC access";
    VirtualizedEoi = 45, "Virtualized EOI";
    GdtrIdtrAccess = 46, "Access to GDTR or IDTR";
    LdtrTrAccess = 47, "Access to LDTR or TR";
    EptViolation = 48, "EPT violation";
    EptMisconfiguration = 49, "EPT misconfiguration";
    Invept = 50, "INVEPT";
    Rdtscp = 51, "RDTSCP";
    PreemptionTimerExpired = 52, "VMX-preemption timer expired";
    Invvpid = 53, "INVVPID";
    Wbinvd = 54, "WBINVD or WBNOINVD";
    Xsetbv = 55, "XSETBV";
    ApicWrite = 56, "APIC write";
    Rdrand = 57, "RDRAND";
    Invpcid = 58, "INVPCID";
    Vmfunc = 59, "VMFUNC";
    Encls = 60, "ENCLS";
    Rdseed = 61, "RDSEED";
    PmlFull = 62, "Page-modification log full";
    Xsaves = 63, "XSAVES";
    Xrstors = 64, "XRSTORS";
    SubPagePermissionEvent = 66, "SPP-related event";
    Umwait = 67, "UMWAIT";
    Tpause = 68, "TPAUSE";
}


impl fmt::Display for VmxExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.description()) }
}


/// Sub-reasons reported in the VM-instruction error field after VMfailValid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmFailValidError {
    VmcallInVmxRoot,
    VmclearInvalidAddress,
    VmclearVmxonPointer,
    VmlaunchNonClearVmcs,
    VmresumeNonLaunchedVmcs,
    VmresumeAfterVmxoff,
    EntryInvalidControlField,
    EntryInvalidHostStateField,
    VmptrldInvalidAddress,
    VmptrldVmxonPointer,
    VmptrldIncorrectRevisionId,
    UnsupportedVmcsComponent,
    VmwriteReadOnlyComponent,
    VmxonInVmxRoot,
    EntryInvalidExecutiveVmcsPointer,
    EntryNonLaunchedExecutiveVmcs,
    EntryExecutiveVmcsPointer,
    VmcallNonClearVmcs,
    VmcallInvalidExitControlFields,
    VmcallIncorrectMsegRevisionId,
    VmxoffUnderDualMonitor,
    VmcallInvalidSmmMonitorFeatures,
    EntryInvalidExecutionControlFields,
    EntryEventsBlockedByMovSs,
    InvalidInveptInvvpidOperand,
    Other(u32),
}


impl VmFailValidError {
    pub fn from_raw(raw: u32) -> Self {
        use VmFailValidError::*;
        match raw {
            1 => VmcallInVmxRoot,
            2 => VmclearInvalidAddress,
            3 => VmclearVmxonPointer,
            4 => VmlaunchNonClearVmcs,
            5 => VmresumeNonLaunchedVmcs,
            6 => VmresumeAfterVmxoff,
            7 => EntryInvalidControlField,
            8 => EntryInvalidHostStateField,
            9 => VmptrldInvalidAddress,
            10 => VmptrldVmxonPointer,
            11 => VmptrldIncorrectRevisionId,
            12 => UnsupportedVmcsComponent,
            13 => VmwriteReadOnlyComponent,
            15 => VmxonInVmxRoot,
            16 => EntryInvalidExecutiveVmcsPointer,
            17 => EntryNonLaunchedExecutiveVmcs,
            18 => EntryExecutiveVmcsPointer,
            19 => VmcallNonClearVmcs,
            20 => VmcallInvalidExitControlFields,
            22 => VmcallIncorrectMsegRevisionId,
            23 => VmxoffUnderDualMonitor,
            24 => VmcallInvalidSmmMonitorFeatures,
            25 => EntryInvalidExecutionControlFields,
            26 => EntryEventsBlockedByMovSs,
            28 => InvalidInveptInvvpidOperand,
            other => Other(other),
        }
    }
}


/// Outcome of a VMX instruction as reported by the host.
///
/// Consulted for diagnostics when a host call fails unexpectedly; a guest
/// never causes anything but `Succeed` on the normal run path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmxInstructionError {
    Succeed,
    /// No current VMCS.
    FailInvalid,
    FailValid(VmFailValidError),
}


impl VmxInstructionError {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => VmxInstructionError::Succeed,
            1 => VmxInstructionError::FailInvalid,
            other => VmxInstructionError::FailValid(VmFailValidError::from_raw(other as u32)),
        }
    }

    /// Fail-valid results mean the VMCS was programmed inconsistently.
    pub fn is_fatal(&self) -> bool { matches!(self, VmxInstructionError::FailValid(_)) }
}


/// Exit qualification of an I/O-instruction exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoQualification(pub u64);


impl IoQualification {
    /// Bits 0-2 hold size - 1; only 0, 1 and 3 are architecturally defined.
    pub fn size(&self) -> usize { bits(self.0, 0, 2) as usize + 1 }

    /// Port I/O never moves eight bytes, so encoding 7 is as invalid as 2.
    pub fn width(&self) -> Option<IoWidth> {
        match bits(self.0, 0, 2) {
            0 => Some(IoWidth::Byte),
            1 => Some(IoWidth::Word),
            3 => Some(IoWidth::Dword),
            _ => None,
        }
    }

    pub fn is_in(&self) -> bool { bit(self.0, 3) }

    pub fn is_string(&self) -> bool { bit(self.0, 4) }

    pub fn is_rep(&self) -> bool { bit(self.0, 5) }

    /// Port came from an immediate operand rather than DX.
    pub fn immediate_operand(&self) -> bool { bit(self.0, 6) }

    pub fn port(&self) -> u16 { bits(self.0, 16, 31) as u16 }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSize {
    Bits16,
    Bits32,
    Bits64,
}


impl AddressSize {
    /// Mask applied to SI/DI/CX for this address size.
    pub fn mask(&self) -> u64 {
        match self {
            AddressSize::Bits16 => 0xffff,
            AddressSize::Bits32 => 0xffff_ffff,
            AddressSize::Bits64 => u64::MAX,
        }
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentOverride {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}


/// VM-exit instruction-information field for INS/OUTS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoInstructionInfo(pub u32);


impl IoInstructionInfo {
    pub fn address_size(&self) -> Option<AddressSize> {
        match bits(self.0 as u64, 7, 9) {
            0 => Some(AddressSize::Bits16),
            1 => Some(AddressSize::Bits32),
            2 => Some(AddressSize::Bits64),
            _ => None,
        }
    }

    pub fn segment(&self) -> Option<SegmentOverride> {
        match bits(self.0 as u64, 15, 17) {
            0 => Some(SegmentOverride::Es),
            1 => Some(SegmentOverride::Cs),
            2 => Some(SegmentOverride::Ss),
            3 => Some(SegmentOverride::Ds),
            4 => Some(SegmentOverride::Fs),
            5 => Some(SegmentOverride::Gs),
            _ => None,
        }
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryAccess {
    Read,
    Write,
    InstructionFetch,
}


/// Decoded EPT-violation exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EptViolation {
    pub access: MemoryAccess,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub guest_physical_address: u64,
    pub guest_linear_address: Option<u64>,
    pub qualification: u64,
}


impl EptViolation {
    pub fn decode(qualification: u64, guest_physical_address: u64, guest_linear_address: u64) -> Self {
        let access = if bit(qualification, 2) {
            MemoryAccess::InstructionFetch
        } else if bit(qualification, 1) {
            MemoryAccess::Write
        } else {
            MemoryAccess::Read
        };
        Self {
            access,
            readable: bit(qualification, 3),
            writable: bit(qualification, 4),
            executable: bit(qualification, 5),
            guest_physical_address,
            guest_linear_address: bit(qualification, 7).then_some(guest_linear_address),
            qualification,
        }
    }
}


/// Raw VMX exit information read from the VMCS after an exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmxExitInfo {
    pub reason: u32,
    pub qualification: u64,
    pub instruction_info: u32,
    pub guest_physical_address: u64,
    pub guest_linear_address: u64,
    pub rax: u64,
}


/// Where the source operand of an OUTS lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StringSource {
    pub segment: SegmentOverride,
    pub address_size: AddressSize,
    pub width: IoWidth,
}


/// Decodes a raw VMX exit.
///
/// For OUTS the data lives in guest memory at `segment:[rSI]`; `fetch` is
/// asked to read one unit given the effective segment and address size.
/// INS always writes through ES and never needs `fetch`.
pub fn decode_vmx_exit<F>(info: &VmxExitInfo, fetch: F) -> VMExit
where
    F: FnOnce(StringSource) -> Result<IoData, ExitDecodeError>,
{
    let exit = VmxExit(info.reason);
    if exit.entry_failure() {
        return VMExit::EntryFailed(exit);
    }
    match exit.reason() {
        Some(VmxExitReason::Hlt) => VMExit::Hlt,
        Some(VmxExitReason::TripleFault) => VMExit::Shutdown,
        Some(VmxExitReason::InterruptWindow) => VMExit::IrqWindowOpen,
        Some(VmxExitReason::ExternalInterrupt) => VMExit::Interrupted,
        Some(VmxExitReason::EptViolation) => VMExit::EptViolation(EptViolation::decode(
            info.qualification,
            info.guest_physical_address,
            info.guest_linear_address,
        )),
        Some(VmxExitReason::IoInstruction) => decode_io_instruction(info, fetch),
        _ => VMExit::Unknown(info.reason as u64),
    }
}


fn decode_io_instruction<F>(info: &VmxExitInfo, fetch: F) -> VMExit
where
    F: FnOnce(StringSource) -> Result<IoData, ExitDecodeError>,
{
    let q = IoQualification(info.qualification);
    let port = q.port();
    let width = match q.width() {
        Some(width) => width,
        None => return VMExit::DecodeFailure(ExitDecodeError::InvalidIoWidth { port, size: q.size() as u8 }),
    };
    if q.is_in() {
        return VMExit::IoIn { port, width };
    }
    if !q.is_string() {
        return VMExit::IoOut { port, data: IoData::truncate(width, info.rax) };
    }

    let instruction = IoInstructionInfo(info.instruction_info);
    let (segment, address_size) = match (instruction.segment(), instruction.address_size()) {
        (Some(segment), Some(address_size)) => (segment, address_size),
        _ => {
            return VMExit::DecodeFailure(ExitDecodeError::InvalidInstructionInfo(info.instruction_info));
        }
    };
    match fetch(StringSource { segment, address_size, width }) {
        Ok(data) if data.width() == width => VMExit::IoOut { port, data },
        Ok(data) => VMExit::DecodeFailure(ExitDecodeError::FetchWidthMismatch {
            port,
            want: width,
            have: data.width(),
        }),
        Err(e) => VMExit::DecodeFailure(e),
    }
}
