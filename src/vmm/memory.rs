use std::fmt::Write;
use std::sync::{PoisonError, RwLock};

use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};
use log::debug;
use vm_memory::{ByteValued, Bytes, MmapRegion, VolatileMemory};

use crate::error::{Result, VMError};


/// Host memory backing one guest-physical range, mapped as a KVM slot.
///
/// The mapping is anonymous, private and zero-filled. It stays valid until
/// the owning `VirtualMachine` shuts down, after which every accessor fails
/// with `RegionReleased`.
#[derive(Debug)]
pub struct MemoryRegion {
    slot: u32,
    guest_address: u64,
    size: usize,
    read_only: bool,
    mapping: RwLock<Option<MmapRegion<()>>>,
}


impl MemoryRegion {
    pub(crate) fn create(size: usize, guest_address: u64, slot: u32, read_only: bool) -> Result<Self> {
        let mapping = MmapRegion::<()>::new(size)
            .map_err(|e| VMError::MemoryAllocation { size, reason: e.to_string() })?;
        debug!("memory slot {}: {:#x} bytes at guest {:#x}, host {:p}", slot, size, guest_address, mapping.as_ptr());
        Ok(Self { slot, guest_address, size, read_only, mapping: RwLock::new(Some(mapping)) })
    }

    pub fn slot(&self) -> u32 { self.slot }

    pub fn guest_address(&self) -> u64 { self.guest_address }

    pub fn size(&self) -> usize { self.size }

    pub fn read_only(&self) -> bool { self.read_only }

    pub fn is_released(&self) -> bool {
        self.mapping.read().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// True if `[address, address + len)` lies entirely in this region.
    pub fn contains(&self, address: u64, len: usize) -> bool {
        let Some(offset) = address.checked_sub(self.guest_address) else { return false };
        offset
            .checked_add(len as u64)
            .map_or(false, |end| end <= self.size as u64)
    }

    /// Host virtual address of the first byte.
    pub fn host_address(&self) -> Result<u64> {
        self.with_mapping(|m| Ok(m.as_ptr() as u64))
    }

    /// Copies `bytes` into the region starting at `offset`.
    pub fn load_binary(&self, bytes: &[u8], offset: usize) -> Result<()> {
        self.write_slice(bytes, offset)
    }

    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.with_mapping(|m| m.as_volatile_slice().read_slice(buf, offset).map_err(VMError::GuestMemory))
    }

    pub fn write_slice(&self, bytes: &[u8], offset: usize) -> Result<()> {
        self.check_bounds(offset, bytes.len())?;
        self.with_mapping(|m| m.as_volatile_slice().write_slice(bytes, offset).map_err(VMError::GuestMemory))
    }

    pub fn read_obj<T: ByteValued>(&self, offset: usize) -> Result<T> {
        self.check_bounds(offset, std::mem::size_of::<T>())?;
        self.with_mapping(|m| m.as_volatile_slice().read_obj(offset).map_err(VMError::GuestMemory))
    }

    pub fn write_obj<T: ByteValued>(&self, value: T, offset: usize) -> Result<()> {
        self.check_bounds(offset, std::mem::size_of::<T>())?;
        self.with_mapping(|m| m.as_volatile_slice().write_obj(value, offset).map_err(VMError::GuestMemory))
    }

    /// Hex dump of `count` bytes at `offset`, 16 per line, each line
    /// prefixed with its region offset.
    pub fn dump_memory(&self, offset: usize, count: usize) -> Result<String> {
        let mut bytes = vec![0u8; count];
        self.read_slice(&mut bytes, offset)?;

        let mut out = String::with_capacity(7 + count * 3 + count / 16 * 8);
        for (idx, byte) in bytes.iter().enumerate() {
            if idx % 16 == 0 {
                if idx > 0 {
                    out.push('\n');
                }
                let _ = write!(out, "{:05x}: ", offset + idx);
            }
            let _ = write!(out, "{:02x} ", byte);
        }
        Ok(out)
    }

    pub(crate) fn kvm_region(&self) -> Result<kvm_userspace_memory_region> {
        let userspace_addr = self.host_address()?;
        Ok(kvm_userspace_memory_region {
            slot: self.slot,
            flags: if self.read_only { KVM_MEM_READONLY } else { 0 },
            guest_phys_addr: self.guest_address,
            memory_size: self.size as u64,
            userspace_addr,
        })
    }

    /// Unmaps the host memory. Only the first call does anything.
    pub(crate) fn release(&self) -> bool {
        let released = self.mapping.write().unwrap_or_else(PoisonError::into_inner).take();
        if released.is_some() {
            debug!("memory slot {}: released", self.slot);
        }
        released.is_some()
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VMError::RegionTooSmall { size: self.size, offset, len }),
        }
    }

    fn with_mapping<T>(&self, f: impl FnOnce(&MmapRegion<()>) -> Result<T>) -> Result<T> {
        let guard = self.mapping.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(mapping) => f(mapping),
            None => Err(VMError::RegionReleased(self.slot)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_region_is_zeroed() {
        let region = MemoryRegion::create(0x2000, 0x1000, 0, false).unwrap();
        let mut buf = [0xffu8; 16];
        region.read_slice(&mut buf, 0x1ff0).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_ne!(region.host_address().unwrap(), 0);
    }

    #[test]
    fn load_binary_respects_bounds() {
        let region = MemoryRegion::create(0x1000, 0, 3, false).unwrap();
        region.load_binary(&[0xf4], 0xfff).unwrap();
        assert_eq!(region.read_obj::<u8>(0xfff).unwrap(), 0xf4);

        let err = region.load_binary(&[0x90, 0xf4], 0xfff).unwrap_err();
        assert!(matches!(err, VMError::RegionTooSmall { size: 0x1000, offset: 0xfff, len: 2 }));
        let err = region.load_binary(&[0x90], usize::MAX).unwrap_err();
        assert!(matches!(err, VMError::RegionTooSmall { .. }));
    }

    #[test]
    fn objects_are_little_endian_and_unaligned() {
        let region = MemoryRegion::create(0x1000, 0, 0, false).unwrap();
        region.write_obj(0x1234u16, 0x201).unwrap();
        let mut raw = [0u8; 2];
        region.read_slice(&mut raw, 0x201).unwrap();
        assert_eq!(raw, [0x34, 0x12]);
        assert_eq!(region.read_obj::<u16>(0x201).unwrap(), 0x1234);
    }

    #[test]
    fn dump_memory_prints_sixteen_bytes_per_line() {
        let region = MemoryRegion::create(0x1000, 0, 0, false).unwrap();
        let bytes: Vec<u8> = (0..18).collect();
        region.load_binary(&bytes, 0x1f0).unwrap();

        let dump = region.dump_memory(0x1f0, 18).unwrap();
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(
            lines,
            vec![
                "001f0: 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f ",
                "00200: 10 11 ",
            ]
        );
        assert!(!dump.ends_with('\n'));

        assert_eq!(region.dump_memory(0, 0).unwrap(), "");
        assert!(matches!(region.dump_memory(0xff8, 16), Err(VMError::RegionTooSmall { offset: 0xff8, len: 16, .. })));
    }

    #[test]
    fn contains_checks_whole_range() {
        let region = MemoryRegion::create(0x2000, 0x1000, 0, false).unwrap();
        assert!(region.contains(0x1000, 1));
        assert!(region.contains(0x2ffc, 4));
        assert!(!region.contains(0x2ffd, 4));
        assert!(!region.contains(0xfff, 1));
        assert!(!region.contains(u64::MAX, 2));
    }

    #[test]
    fn release_is_idempotent_and_blocks_access() {
        let region = MemoryRegion::create(0x1000, 0, 7, true).unwrap();
        assert_eq!(region.kvm_region().unwrap().flags, KVM_MEM_READONLY);
        assert!(region.release());
        assert!(!region.release());
        assert!(region.is_released());
        assert!(matches!(region.load_binary(&[1], 0), Err(VMError::RegionReleased(7))));
        assert!(matches!(region.host_address(), Err(VMError::RegionReleased(7))));
    }
}
