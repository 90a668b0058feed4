use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Configuration for creating a `VirtualMachine`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMConfig {
    /// Virtualization device node
    pub device_path: PathBuf,
    /// KVM API version the library was written against
    pub expected_api_version: i32,
    /// How long `shutdown()` waits for a running vCPU to stop (ms)
    pub vcpu_shutdown_timeout_ms: u64,
    /// vCPU threads are named `<prefix>-<id>`
    pub vcpu_thread_name: String,
    /// Stack size of vCPU threads; None = platform default
    pub vcpu_stack_size: Option<usize>,
    /// Regions added in order at VM creation (slots 0..n)
    pub memory: Vec<MemoryRegionConfig>,
}

impl Default for VMConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/kvm"),
            expected_api_version: kvm_bindings::KVM_API_VERSION as i32,
            vcpu_shutdown_timeout_ms: 100,
            vcpu_thread_name: "vcpu".to_string(),
            vcpu_stack_size: None,
            memory: vec![],
        }
    }
}

impl VMConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn vcpu_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.vcpu_shutdown_timeout_ms)
    }
}

/// One guest-physical memory region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRegionConfig {
    pub guest_address: u64,
    pub size: usize,
    #[serde(default)]
    pub read_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_target_dev_kvm() {
        let config = VMConfig::default();
        assert_eq!(config.device_path, PathBuf::from("/dev/kvm"));
        assert_eq!(config.expected_api_version, 12);
        assert_eq!(config.vcpu_shutdown_timeout(), Duration::from_millis(100));
        assert!(config.memory.is_empty());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = VMConfig::from_json(
            r#"{
                "vcpu_shutdown_timeout_ms": 250,
                "memory": [
                    { "guest_address": 4096, "size": 8192 },
                    { "guest_address": 16384, "size": 4096, "read_only": true }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.device_path, PathBuf::from("/dev/kvm"));
        assert_eq!(config.vcpu_shutdown_timeout_ms, 250);
        assert_eq!(
            config.memory,
            vec![
                MemoryRegionConfig { guest_address: 0x1000, size: 0x2000, read_only: false },
                MemoryRegionConfig { guest_address: 0x4000, size: 0x1000, read_only: true },
            ]
        );
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = VMConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, crate::VMError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "vcpu_thread_name": "cpu", "vcpu_stack_size": 65536 }}"#).unwrap();
        let config = VMConfig::from_file(file.path()).unwrap();
        assert_eq!(config.vcpu_thread_name, "cpu");
        assert_eq!(config.vcpu_stack_size, Some(65536));
    }
}
