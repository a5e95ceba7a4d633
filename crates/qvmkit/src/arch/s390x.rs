//! s390x `s390-ccw-virtio` machine.
//!
//! On s390x every virtio device sits on the CCW bus: there are no PCI
//! bridges on the command line, devices carry a `-ccw` suffix and hotplug
//! addressing uses 16-bit device numbers instead of bridge slots.

use crate::bridge::BusType;
use crate::config::{HypervisorConfig, KernelParam, MachineType};
use crate::device::LaunchDevice;

use super::{ArchBase, ArchOps, Machine};

pub(super) struct S390x {
    base: ArchBase,
}

impl S390x {
    pub(super) fn new(config: &HypervisorConfig) -> Self {
        let base = ArchBase {
            machine_type: config.machine_type,
            machines: vec![Machine {
                mtype: "s390-ccw-virtio",
                options: "accel=kvm",
            }],
            qemu_paths: vec![(MachineType::CcwVirtio, "/usr/bin/qemu-system-s390x")],
            bus: BusType::Ccw,
            root_bus: "",
            memory_offset: config.memory_offset,
            kernel_params: vec![KernelParam::new("console", "ttysclp0")],
            kernel_params_debug: vec![KernelParam::new("debug", "")],
            kernel_params_non_debug: vec![KernelParam::new("quiet", "")],
            ..Default::default()
        };
        Self { base }
    }
}

impl ArchOps for S390x {
    fn base(&self) -> &ArchBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ArchBase {
        &mut self.base
    }

    fn transport_suffix(&self) -> &'static str {
        "-ccw"
    }

    fn supports_guest_memory_hotplug(&self) -> bool {
        false
    }

    // CCW "bridges" are pure bookkeeping for device numbers; nothing is
    // emitted on the command line.
    fn append_bridges(&mut self, _devices: &mut Vec<LaunchDevice>) {}

    fn handle_image_path(&mut self, _config: &HypervisorConfig) {
        self.base.kernel_params.extend([
            KernelParam::new("root", "/dev/vda1"),
            KernelParam::new("rootfstype", "ext4"),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeTable;

    #[test]
    fn test_ccw_machine() {
        let config = HypervisorConfig {
            machine_type: MachineType::CcwVirtio,
            ..Default::default()
        };
        let arch = S390x::new(&config);
        assert_eq!(arch.machine().unwrap().mtype, "s390-ccw-virtio");
        assert_eq!(arch.transport_suffix(), "-ccw");
    }

    #[test]
    fn test_ccw_bridges_emit_no_devices() {
        let config = HypervisorConfig {
            machine_type: MachineType::CcwVirtio,
            ..Default::default()
        };
        let mut arch = S390x::new(&config);
        arch.base_mut().bridges = BridgeTable::create(BusType::Ccw, 1);
        let mut devices = Vec::new();
        arch.append_bridges(&mut devices);
        assert!(devices.is_empty());
        // The table itself still hands out device numbers.
        assert!(arch.add_device_to_bridge("d0", BusType::Ccw).is_ok());
    }
}
