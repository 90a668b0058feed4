//! Semantic view of a vCPU's register state.
//!
//! `Registers` is a plain snapshot: general-purpose registers, RIP, RFLAGS,
//! the eight segment caches, GDTR/IDTR and the control registers. It is
//! converted to and from the KVM `kvm_regs`/`kvm_sregs` pair as a unit; the
//! two halves are never synchronised separately.

use kvm_bindings::{kvm_dtable, kvm_regs, kvm_segment, kvm_sregs};
use std::fmt;


pub const CR0_PE: u64 = 1 << 0;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_NW: u64 = 1 << 29;
pub const CR0_CD: u64 = 1 << 30;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_VMXE: u64 = 1 << 13;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;


/// RFLAGS with named single-bit accessors.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Rflags(pub u64);


macro_rules! flag_bits {
    ($($get:ident, $set:ident, $bit:expr;)*) => {
        $(
            pub fn $get(&self) -> bool { self.0 & (1 << $bit) != 0 }

            pub fn $set(&mut self, on: bool) {
                if on { self.0 |= 1 << $bit } else { self.0 &= !(1 << $bit) }
            }
        )*
    };
}


impl Rflags {
    /// Bit 1 is reserved and always reads as one.
    pub const RESERVED_ONE: u64 = 1 << 1;

    flag_bits! {
        carry, set_carry, 0;
        parity, set_parity, 2;
        adjust, set_adjust, 4;
        zero, set_zero, 6;
        sign, set_sign, 7;
        trap, set_trap, 8;
        interrupt_enable, set_interrupt_enable, 9;
        direction, set_direction, 10;
        overflow, set_overflow, 11;
        nested_task, set_nested_task, 14;
        resume, set_resume, 16;
        virtual_8086, set_virtual_8086, 17;
        alignment_check, set_alignment_check, 18;
        virtual_interrupt, set_virtual_interrupt, 19;
        virtual_interrupt_pending, set_virtual_interrupt_pending, 20;
        id, set_id, 21;
    }

    pub fn iopl(&self) -> u8 { ((self.0 >> 12) & 3) as u8 }

    pub fn set_iopl(&mut self, level: u8) {
        self.0 = (self.0 & !(3 << 12)) | (((level & 3) as u64) << 12);
    }
}


impl fmt::Debug for Rflags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rflags({:#x})", self.0)
    }
}


impl fmt::Display for Rflags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.overflow(), "OF"),
            (self.direction(), "DF"),
            (self.interrupt_enable(), "IF"),
            (self.trap(), "TF"),
            (self.sign(), "SF"),
            (self.zero(), "ZF"),
            (self.adjust(), "AF"),
            (self.parity(), "PF"),
            (self.carry(), "CF"),
        ];
        write!(f, "{:#06x}", self.0)?;
        for (set, name) in names {
            if set {
                write!(f, " {}", name)?;
            }
        }
        Ok(())
    }
}


/// Hidden part of a segment register as cached by the CPU.
///
/// `access_rights` uses the VMX layout: type in bits 0-3, S in 4, DPL in 5-6,
/// P in 7, AVL in 12, L in 13, D/B in 14, G in 15 and "unusable" in 16.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}


impl SegmentRegister {
    pub const fn new(selector: u16, base: u64, limit: u32, access_rights: u32) -> Self {
        Self { selector, base, limit, access_rights }
    }

    /// Real-mode segment: base is selector * 16.
    pub const fn real_mode(selector: u16, access_rights: u32) -> Self {
        Self::new(selector, (selector as u64) << 4, 0xffff, access_rights)
    }

    pub fn is_unusable(&self) -> bool { self.access_rights & (1 << 16) != 0 }

    pub(crate) fn from_kvm(seg: &kvm_segment) -> Self {
        let access_rights = (seg.type_ as u32 & 0xf)
            | (seg.s as u32 & 1) << 4
            | (seg.dpl as u32 & 3) << 5
            | (seg.present as u32 & 1) << 7
            | (seg.avl as u32 & 1) << 12
            | (seg.l as u32 & 1) << 13
            | (seg.db as u32 & 1) << 14
            | (seg.g as u32 & 1) << 15
            | (seg.unusable as u32 & 1) << 16;
        Self {
            selector: seg.selector,
            base: seg.base,
            limit: seg.limit,
            access_rights,
        }
    }

    pub(crate) fn to_kvm(&self) -> kvm_segment {
        let ar = self.access_rights;
        kvm_segment {
            base: self.base,
            limit: self.limit,
            selector: self.selector,
            type_: (ar & 0xf) as u8,
            s: ((ar >> 4) & 1) as u8,
            dpl: ((ar >> 5) & 3) as u8,
            present: ((ar >> 7) & 1) as u8,
            avl: ((ar >> 12) & 1) as u8,
            l: ((ar >> 13) & 1) as u8,
            db: ((ar >> 14) & 1) as u8,
            g: ((ar >> 15) & 1) as u8,
            unusable: ((ar >> 16) & 1) as u8,
            ..Default::default()
        }
    }
}


/// GDTR / IDTR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}


impl DescriptorTable {
    fn from_kvm(table: &kvm_dtable) -> Self { Self { base: table.base, limit: table.limit } }

    fn to_kvm(self) -> kvm_dtable {
        kvm_dtable { base: self.base, limit: self.limit, ..Default::default() }
    }
}


/// Snapshot of a vCPU's register state.
///
/// Platform fields the model does not cover (APIC base, pending interrupt
/// bitmap) are carried through untouched so a pull/push round-trip is
/// lossless.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: Rflags,

    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub es: SegmentRegister,
    pub fs: SegmentRegister,
    pub gs: SegmentRegister,
    pub tr: SegmentRegister,
    pub ldtr: SegmentRegister,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,

    platform: PlatformState,
}


#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PlatformState {
    apic_base: u64,
    interrupt_bitmap: [u64; 4],
}


macro_rules! sub_registers {
    ($($full:ident => $r32:ident/$set32:ident, $r16:ident/$set16:ident;)*) => {
        $(
            pub fn $r32(&self) -> u32 { self.$full as u32 }

            pub fn $set32(&mut self, value: u32) {
                self.$full = (self.$full & !0xffff_ffff) | value as u64;
            }

            pub fn $r16(&self) -> u16 { self.$full as u16 }

            pub fn $set16(&mut self, value: u16) {
                self.$full = (self.$full & !0xffff) | value as u64;
            }
        )*
    };
}


macro_rules! byte_registers {
    ($($full:ident => $lo:ident/$set_lo:ident, $hi:ident/$set_hi:ident;)*) => {
        $(
            pub fn $lo(&self) -> u8 { self.$full as u8 }

            pub fn $set_lo(&mut self, value: u8) {
                self.$full = (self.$full & !0xff) | value as u64;
            }

            pub fn $hi(&self) -> u8 { (self.$full >> 8) as u8 }

            pub fn $set_hi(&mut self, value: u8) {
                self.$full = (self.$full & !0xff00) | (value as u64) << 8;
            }
        )*
    };
}


impl Registers {
    sub_registers! {
        rax => eax/set_eax, ax/set_ax;
        rbx => ebx/set_ebx, bx/set_bx;
        rcx => ecx/set_ecx, cx/set_cx;
        rdx => edx/set_edx, dx/set_dx;
        rsi => esi/set_esi, si/set_si;
        rdi => edi/set_edi, di/set_di;
        rsp => esp/set_esp, sp/set_sp;
        rbp => ebp/set_ebp, bp/set_bp;
        rip => eip/set_eip, ip/set_ip;
    }

    byte_registers! {
        rax => al/set_al, ah/set_ah;
        rbx => bl/set_bl, bh/set_bh;
        rcx => cl/set_cl, ch/set_ch;
        rdx => dl/set_dl, dh/set_dh;
    }

    pub fn from_kvm(regs: &kvm_regs, sregs: &kvm_sregs) -> Self {
        Self {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: Rflags(regs.rflags),
            cs: SegmentRegister::from_kvm(&sregs.cs),
            ss: SegmentRegister::from_kvm(&sregs.ss),
            ds: SegmentRegister::from_kvm(&sregs.ds),
            es: SegmentRegister::from_kvm(&sregs.es),
            fs: SegmentRegister::from_kvm(&sregs.fs),
            gs: SegmentRegister::from_kvm(&sregs.gs),
            tr: SegmentRegister::from_kvm(&sregs.tr),
            ldtr: SegmentRegister::from_kvm(&sregs.ldt),
            gdtr: DescriptorTable::from_kvm(&sregs.gdt),
            idtr: DescriptorTable::from_kvm(&sregs.idt),
            cr0: sregs.cr0,
            cr2: sregs.cr2,
            cr3: sregs.cr3,
            cr4: sregs.cr4,
            cr8: sregs.cr8,
            efer: sregs.efer,
            platform: PlatformState {
                apic_base: sregs.apic_base,
                interrupt_bitmap: sregs.interrupt_bitmap,
            },
        }
    }

    pub fn to_kvm_regs(&self) -> kvm_regs {
        kvm_regs {
            rax: self.rax,
            rbx: self.rbx,
            rcx: self.rcx,
            rdx: self.rdx,
            rsi: self.rsi,
            rdi: self.rdi,
            rsp: self.rsp,
            rbp: self.rbp,
            r8: self.r8,
            r9: self.r9,
            r10: self.r10,
            r11: self.r11,
            r12: self.r12,
            r13: self.r13,
            r14: self.r14,
            r15: self.r15,
            rip: self.rip,
            rflags: self.rflags.0 | Rflags::RESERVED_ONE,
        }
    }

    pub fn to_kvm_sregs(&self) -> kvm_sregs {
        kvm_sregs {
            cs: self.cs.to_kvm(),
            ds: self.ds.to_kvm(),
            es: self.es.to_kvm(),
            fs: self.fs.to_kvm(),
            gs: self.gs.to_kvm(),
            ss: self.ss.to_kvm(),
            tr: self.tr.to_kvm(),
            ldt: self.ldtr.to_kvm(),
            gdt: self.gdtr.to_kvm(),
            idt: self.idtr.to_kvm(),
            cr0: self.cr0,
            cr2: self.cr2,
            cr3: self.cr3,
            cr4: self.cr4,
            cr8: self.cr8,
            efer: self.efer,
            apic_base: self.platform.apic_base,
            interrupt_bitmap: self.platform.interrupt_bitmap,
        }
    }

    /// Puts the CPU into its reset state: real mode, executing at F000:FFF0.
    pub fn setup_real_mode(&mut self) {
        self.cr0 = CR0_CD | CR0_NW | CR0_ET | CR0_NE;
        self.cr2 = 0;
        self.cr3 = 0;
        // KVM owns CR4.VMXE; the guest only sees it with nested VMX in CPUID.
        self.cr4 = 0;
        self.efer = 0;

        self.rip = 0xfff0;
        self.rflags = Rflags(Rflags::RESERVED_ONE);
        self.rsp = 0;
        self.rax = 0;

        self.cs = SegmentRegister::new(0xf000, 0xf_0000, 0xffff, 0x9b);
        let data = SegmentRegister::new(0, 0, 0xffff, 0x93);
        self.ds = data;
        self.es = data;
        self.fs = data;
        self.gs = data;
        self.ss = data;
        self.tr = SegmentRegister::new(0, 0, 0, 0x83);
        self.ldtr = SegmentRegister::new(0, 0, 0, 0x1_0000);

        self.gdtr = DescriptorTable { base: 0, limit: 0xffff };
        self.idtr = DescriptorTable { base: 0, limit: 0xffff };
    }
}


impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "CS: {:04x} SS: {:04x} DS: {:04x} ES: {:04x} FS: {:04x} GS: {:04x} FLAGS {}",
            self.cs.selector,
            self.ss.selector,
            self.ds.selector,
            self.es.selector,
            self.fs.selector,
            self.gs.selector,
            self.rflags
        )?;
        writeln!(
            f,
            "IP: {:04x} AX: {:04x} BX: {:04x} CX: {:04x} DX: {:04x} DI: {:04x} SI: {:04x} BP: {:04x} SP: {:04x}",
            self.ip(),
            self.ax(),
            self.bx(),
            self.cx(),
            self.dx(),
            self.di(),
            self.si(),
            self.bp(),
            self.sp()
        )
    }
}
