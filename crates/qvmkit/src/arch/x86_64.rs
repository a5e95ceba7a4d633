//! x86_64 machine types (`pc`, `q35`).

use camino::Utf8Path;
use color_eyre::Result;

use crate::bridge::BusType;
use crate::cmdline::MemorySpec;
use crate::config::{HypervisorConfig, KernelParam, MachineType};
use crate::device::LaunchDevice;

use super::{image_size, ArchBase, ArchOps, Machine};

pub(super) struct Amd64 {
    base: ArchBase,
    /// The root image is mapped as an NVDIMM, which costs extra guest
    /// address space.
    nvdimm_image: bool,
}

impl Amd64 {
    pub(super) fn new(config: &HypervisorConfig) -> Self {
        let base = ArchBase {
            machine_type: config.machine_type,
            machines: vec![
                Machine {
                    mtype: "pc",
                    options: "accel=kvm,kernel_irqchip,nvdimm",
                },
                Machine {
                    mtype: "q35",
                    options: "accel=kvm,kernel_irqchip,nvdimm",
                },
            ],
            qemu_paths: vec![
                (MachineType::Pc, "/usr/bin/qemu-system-x86_64"),
                (MachineType::Q35, "/usr/bin/qemu-system-x86_64"),
            ],
            bus: BusType::Pci,
            root_bus: match config.machine_type {
                MachineType::Q35 => "pcie.0",
                _ => "pci.0",
            },
            memory_offset: config.memory_offset,
            kernel_params: vec![
                KernelParam::new("tsc", "reliable"),
                KernelParam::new("no_timer_check", ""),
                KernelParam::new("rcupdate.rcu_expedited", "1"),
                KernelParam::new("i8042.direct", "1"),
                KernelParam::new("i8042.dumbkbd", "1"),
                KernelParam::new("i8042.nopnp", "1"),
                KernelParam::new("i8042.noaux", "1"),
                KernelParam::new("noreplace-smp", ""),
                KernelParam::new("reboot", "k"),
                KernelParam::new("console", "hvc0"),
                KernelParam::new("console", "hvc1"),
                KernelParam::new("cryptomgr.notests", ""),
                KernelParam::new("net.ifnames", "0"),
                KernelParam::new("pci", "lastbus=0"),
            ],
            kernel_params_debug: vec![KernelParam::new("debug", "")],
            kernel_params_non_debug: vec![KernelParam::new("quiet", "")],
            ..Default::default()
        };
        Self {
            base,
            nvdimm_image: false,
        }
    }
}

impl ArchOps for Amd64 {
    fn base(&self) -> &ArchBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ArchBase {
        &mut self.base
    }

    fn cpu_model(&self) -> String {
        let mut model = "host".to_string();
        // The PMU is not virtualizable when we ourselves run virtualized.
        if self.base.nested_run {
            model += ",pmu=off";
        }
        model
    }

    fn handle_image_path(&mut self, config: &HypervisorConfig) {
        self.nvdimm_image = config.initrd_path.is_none();
        self.base.kernel_params.extend([
            KernelParam::new("root", "/dev/pmem0p1"),
            KernelParam::new("rootflags", "dax,data=ordered,errors=remount-ro"),
            KernelParam::new("ro", ""),
            KernelParam::new("rootfstype", "ext4"),
        ]);
        self.base
            .kernel_params_debug
            .extend([
                KernelParam::new("systemd.show_status", "true"),
                KernelParam::new("systemd.log_level", "debug"),
            ]);
        self.base
            .kernel_params_non_debug
            .push(KernelParam::new("systemd.show_status", "false"));
    }

    fn memory_topology(&self, memory_mib: u64, host_memory_mib: u64, slots: u32) -> MemorySpec {
        let mut max = host_memory_mib;
        if self.nvdimm_image {
            // The image NVDIMM needs its own slice of address space.
            max += u64::from(self.base.memory_offset) + 1024;
        }
        MemorySpec {
            size: format!("{memory_mib}M"),
            slots,
            max_mem: format!("{max}M"),
            path: None,
        }
    }

    fn append_image(&self, devices: &mut Vec<LaunchDevice>, path: &Utf8Path) -> Result<()> {
        let size = image_size(path)?;
        devices.push(LaunchDevice::NvdimmImage {
            id: "nv0".to_string(),
            memdev_id: "mem0".to_string(),
            file: path.to_owned(),
            size,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(machine: MachineType) -> HypervisorConfig {
        HypervisorConfig {
            machine_type: machine,
            ..Default::default()
        }
    }

    #[test]
    fn test_machine_table() {
        let arch = Amd64::new(&config(MachineType::Q35));
        let machine = arch.machine().unwrap();
        assert_eq!(machine.mtype, "q35");
        assert!(machine.options.contains("accel=kvm"));
    }

    #[test]
    fn test_root_bus_per_machine() {
        assert_eq!(Amd64::new(&config(MachineType::Q35)).base().root_bus, "pcie.0");
        assert_eq!(Amd64::new(&config(MachineType::Pc)).base().root_bus, "pci.0");
    }

    #[test]
    fn test_cpu_model_nested() {
        let mut arch = Amd64::new(&config(MachineType::Q35));
        assert_eq!(arch.cpu_model(), "host");
        arch.enable_nesting_checks();
        assert_eq!(arch.cpu_model(), "host,pmu=off");
    }

    #[test]
    fn test_nvdimm_image_grows_max_memory() {
        let mut cfg = config(MachineType::Q35);
        cfg.image_path = Some("/img".into());
        cfg.memory_offset = 512;
        let mut arch = Amd64::new(&cfg);
        arch.handle_image_path(&cfg);
        let mem = arch.memory_topology(2048, 8192, 10);
        assert_eq!(mem.max_mem, format!("{}M", 8192 + 512 + 1024));
    }
}
