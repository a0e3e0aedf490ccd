//! Default [`HypervisorProvider`] backed by real VMM binaries.

use crate::cloud_hypervisor::CloudHypervisor;
use crate::error::{Result, VmError};
use crate::firecracker::Firecracker;
use crate::hypervisor::{BackendKind, Hypervisor, HypervisorProvider};
use std::path::PathBuf;

/// Creates Firecracker or Cloud Hypervisor instances from configured binaries.
#[derive(Debug, Clone)]
pub struct DefaultProvider {
    firecracker_bin: PathBuf,
    cloud_hypervisor_bin: PathBuf,
}

impl DefaultProvider {
    pub fn new(firecracker_bin: impl Into<PathBuf>, cloud_hypervisor_bin: impl Into<PathBuf>) -> Self {
        Self {
            firecracker_bin: firecracker_bin.into(),
            cloud_hypervisor_bin: cloud_hypervisor_bin.into(),
        }
    }

    fn binary(&self, kind: BackendKind) -> &PathBuf {
        match kind {
            BackendKind::Firecracker => &self.firecracker_bin,
            BackendKind::CloudHypervisor => &self.cloud_hypervisor_bin,
        }
    }
}

impl HypervisorProvider for DefaultProvider {
    fn create(&self, kind: BackendKind) -> Result<Box<dyn Hypervisor>> {
        let binary = self.binary(kind);
        if !binary.exists() {
            return Err(VmError::Config(format!(
                "{kind} binary not found at {}",
                binary.display()
            )));
        }
        Ok(match kind {
            BackendKind::Firecracker => Box::new(Firecracker::new(binary.clone())),
            BackendKind::CloudHypervisor => Box::new(CloudHypervisor::new(binary.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_config_error() {
        let provider = DefaultProvider::new("/nonexistent/firecracker", "/nonexistent/ch");
        let err = provider.create(BackendKind::Firecracker).err().unwrap();
        assert!(matches!(err, VmError::Config(_)));
    }

    #[test]
    fn test_creates_requested_backend() {
        let dir = tempfile::tempdir().unwrap();
        let fc = dir.path().join("firecracker");
        let ch = dir.path().join("cloud-hypervisor");
        std::fs::write(&fc, b"").unwrap();
        std::fs::write(&ch, b"").unwrap();

        let provider = DefaultProvider::new(&fc, &ch);
        let hv = provider.create(BackendKind::CloudHypervisor).unwrap();
        assert_eq!(hv.kind(), BackendKind::CloudHypervisor);
        assert!(hv.capabilities().live_resize);

        let hv = provider.create(BackendKind::Firecracker).unwrap();
        assert_eq!(hv.kind(), BackendKind::Firecracker);
        assert!(hv.capabilities().hotplug.is_empty());
    }
}
