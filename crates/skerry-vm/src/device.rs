//! Device descriptions handed to backends and the bus addresses they return.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Kind of host resource exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Virtio block device backed by a file or host block device
    Block,
    /// VFIO passthrough of a host PCI function
    Vfio,
    /// Shared memory region (pmem-style)
    SharedMemory,
    /// Block device served by a vhost-user backend socket
    VhostUserBlock,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Vfio => write!(f, "vfio"),
            Self::SharedMemory => write!(f, "shared-memory"),
            Self::VhostUserBlock => write!(f, "vhost-user-block"),
        }
    }
}

/// A device to attach to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Identifier the VMM uses for this device
    pub id: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Host-side source: image path, sysfs path, shm file or vhost-user socket
    pub source: PathBuf,
    /// Attach read-only (block kinds)
    pub read_only: bool,
    /// Region size in bytes (shared memory)
    pub size_bytes: Option<u64>,
}

/// Guest-side address of an attached device.
///
/// PCI backends report a BDF (`0000:00:05.0`); MMIO backends report the
/// guest device node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusAddress(String);

impl BusAddress {
    /// Wrap a backend-reported address.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device the running VM already holds.
///
/// Passed to [`Hypervisor::reattach`](crate::Hypervisor::reattach) so a
/// backend that never saw the attach can still detach it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub device: DeviceSpec,
    pub address: BusAddress,
}

/// Hands out the lowest free slot in `first..=last`.
///
/// A slot is only returned to the pool by [`release`](Self::release), so a
/// slot can never be handed out twice while it is still in use.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    first: u32,
    last: u32,
    in_use: BTreeSet<u32>,
}

impl SlotAllocator {
    /// Create an allocator over the inclusive range `first..=last`.
    pub fn new(first: u32, last: u32) -> Self {
        Self {
            first,
            last,
            in_use: BTreeSet::new(),
        }
    }

    /// Reserve the lowest free slot, or `None` when the range is exhausted.
    pub fn allocate(&mut self) -> Option<u32> {
        let slot = (self.first..=self.last).find(|s| !self.in_use.contains(s))?;
        self.in_use.insert(slot);
        Some(slot)
    }

    /// Return a slot to the pool. Releasing a free slot is a no-op.
    pub fn release(&mut self, slot: u32) {
        self.in_use.remove(&slot);
    }

    /// Mark a slot as used (e.g. when reattaching to a running VM).
    pub fn reserve(&mut self, slot: u32) -> bool {
        (self.first..=self.last).contains(&slot) && self.in_use.insert(slot)
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_lowest_free() {
        let mut slots = SlotAllocator::new(1, 3);
        assert_eq!(slots.allocate(), Some(1));
        assert_eq!(slots.allocate(), Some(2));
        slots.release(1);
        assert_eq!(slots.allocate(), Some(1));
        assert_eq!(slots.allocate(), Some(3));
        assert_eq!(slots.allocate(), None);
    }

    #[test]
    fn test_allocator_never_duplicates_live_slot() {
        let mut slots = SlotAllocator::new(0, 7);
        let mut live = BTreeSet::new();
        for step in 0..200u32 {
            if step % 3 == 2 {
                if let Some(&slot) = live.iter().next() {
                    slots.release(slot);
                    live.remove(&slot);
                }
            } else if let Some(slot) = slots.allocate() {
                assert!(live.insert(slot), "slot {slot} handed out twice");
            }
        }
        assert_eq!(slots.in_use(), live.len());
    }

    #[test]
    fn test_reserve_out_of_range() {
        let mut slots = SlotAllocator::new(1, 2);
        assert!(!slots.reserve(5));
        assert!(slots.reserve(2));
        assert!(!slots.reserve(2));
    }

    #[test]
    fn test_device_kind_display() {
        assert_eq!(DeviceKind::Block.to_string(), "block");
        assert_eq!(DeviceKind::VhostUserBlock.to_string(), "vhost-user-block");
    }
}
