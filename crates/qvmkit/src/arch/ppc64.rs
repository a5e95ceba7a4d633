//! ppc64le `pseries` machine.

use crate::bridge::BusType;
use crate::config::{HypervisorConfig, KernelParam, MachineType};

use super::{ArchBase, ArchOps, Machine};

pub(super) struct Ppc64 {
    base: ArchBase,
}

impl Ppc64 {
    pub(super) fn new(config: &HypervisorConfig) -> Self {
        let base = ArchBase {
            machine_type: config.machine_type,
            machines: vec![Machine {
                mtype: "pseries",
                options: "accel=kvm,usb=off,cap-cfpc=broken,cap-sbbc=broken,cap-ibs=broken",
            }],
            qemu_paths: vec![(MachineType::Pseries, "/usr/bin/qemu-system-ppc64")],
            bus: BusType::Pci,
            root_bus: "pci.0",
            memory_offset: config.memory_offset,
            kernel_params: vec![KernelParam::new("console", "hvc0")],
            kernel_params_debug: vec![KernelParam::new("debug", "")],
            kernel_params_non_debug: vec![KernelParam::new("quiet", "")],
            ..Default::default()
        };
        Self { base }
    }
}

impl ArchOps for Ppc64 {
    fn base(&self) -> &ArchBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ArchBase {
        &mut self.base
    }

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

    #[test]
    fn test_pseries_machine() {
        let config = HypervisorConfig {
            machine_type: MachineType::Pseries,
            ..Default::default()
        };
        let arch = Ppc64::new(&config);
        assert_eq!(arch.machine().unwrap().mtype, "pseries");
        assert_eq!(arch.base().bus, BusType::Pci);
        assert!(arch.supports_guest_memory_hotplug());
    }
}
