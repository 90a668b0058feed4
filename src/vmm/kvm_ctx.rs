use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, Mutex, PoisonError};

use kvm_ioctls::Kvm;
use log::{debug, info};

use crate::config::VMConfig;
use crate::error::{Result, VMError};


/// Process-wide handle to the virtualization device.
///
/// Opened once and shared by every VM created through `shared`. Holding
/// the handle keeps the device open.
pub struct KvmContext {
    pub kvm: Kvm,
    pub api_version: i32,
    pub vcpu_mmap_size: usize,
}


static SHARED: Mutex<Option<Arc<KvmContext>>> = Mutex::new(None);


impl KvmContext {
    /// Opens `config.device_path` and checks the API version.
    pub fn open(config: &VMConfig) -> Result<Self> {
        let path = CString::new(config.device_path.as_os_str().as_bytes())
            .map_err(|_| VMError::InvalidArgument(format!("device path {:?} contains NUL", config.device_path)))?;
        let kvm = Kvm::new_with_path(&path)
            .map_err(|source| VMError::DeviceUnavailable { path: config.device_path.clone(), source })?;

        let api_version = kvm.get_api_version();
        if api_version != config.expected_api_version {
            return Err(VMError::ApiVersionMismatch { expected: config.expected_api_version, actual: api_version });
        }
        let vcpu_mmap_size = kvm.get_vcpu_mmap_size().map_err(VMError::VcpuMmapSize)?;
        info!("opened {:?} (API version {}, run state {:#x} bytes)", config.device_path, api_version, vcpu_mmap_size);
        Ok(Self { kvm, api_version, vcpu_mmap_size })
    }

    /// Returns the process-wide context, opening it on first use.
    ///
    /// A failed open is not remembered, the next call tries again.
    pub fn shared(config: &VMConfig) -> Result<Arc<Self>> {
        let mut shared = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ctx) = shared.as_ref() {
            return Ok(Arc::clone(ctx));
        }
        let ctx = Arc::new(Self::open(config)?);
        debug!("initialised shared KVM context");
        *shared = Some(Arc::clone(&ctx));
        Ok(ctx)
    }
}
