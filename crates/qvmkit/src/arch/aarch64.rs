//! aarch64 `virt` machine.

use crate::bridge::BusType;
use crate::config::{HypervisorConfig, KernelParam, MachineType};

use super::{ArchBase, ArchOps, Machine};

pub(super) struct Aarch64 {
    base: ArchBase,
}

impl Aarch64 {
    pub(super) fn new(config: &HypervisorConfig) -> Self {
        let base = ArchBase {
            machine_type: config.machine_type,
            machines: vec![Machine {
                mtype: "virt",
                options: "usb=off,accel=kvm,gic-version=host",
            }],
            qemu_paths: vec![(MachineType::Virt, "/usr/bin/qemu-system-aarch64")],
            bus: BusType::Pcie,
            root_bus: "pcie.0",
            memory_offset: config.memory_offset,
            kernel_params: vec![
                KernelParam::new("console", "hvc0"),
                KernelParam::new("console", "hvc1"),
                KernelParam::new("iommu.passthrough", "0"),
            ],
            kernel_params_debug: vec![KernelParam::new("debug", "")],
            kernel_params_non_debug: vec![KernelParam::new("quiet", "")],
            ..Default::default()
        };
        Self { base }
    }
}

impl ArchOps for Aarch64 {
    fn base(&self) -> &ArchBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ArchBase {
        &mut self.base
    }

    // The low root-bus slots host the platform devices on virt.
    fn first_bridge_addr(&self) -> u32 {
        6
    }

    fn supports_guest_memory_hotplug(&self) -> bool {
        false
    }

    fn handle_image_path(&mut self, config: &HypervisorConfig) {
        // No NVDIMM on virt: the image is attached as the first
        // virtio-block device.
        self.base.kernel_params.extend([
            KernelParam::new("root", "/dev/vda1"),
            KernelParam::new("rootfstype", "ext4"),
        ]);
        if config.image_path.is_some() {
            self.base
                .kernel_params_non_debug
                .push(KernelParam::new("systemd.show_status", "false"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_machine() {
        let config = HypervisorConfig {
            machine_type: MachineType::Virt,
            ..Default::default()
        };
        let arch = Aarch64::new(&config);
        assert_eq!(arch.machine().unwrap().mtype, "virt");
        assert_eq!(arch.base().bus, BusType::Pcie);
        assert!(!arch.supports_guest_memory_hotplug());
        assert_eq!(arch.first_bridge_addr(), 6);
    }
}
