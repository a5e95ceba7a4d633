//! Static hypervisor configuration.
//!
//! A [`HypervisorConfig`] is assembled once by the orchestrator and is
//! immutable after the sandbox is created. Everything mutable at runtime
//! lives in [`crate::state::ControllerState`].

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{bail, eyre, Context};
use color_eyre::Result;

/// Block device driver presented to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockDriver {
    /// virtio-scsi controller with scsi-hd disks.
    #[default]
    VirtioScsi,
    /// virtio-blk on a PCI bridge slot.
    VirtioBlock,
    /// virtio-blk on the CCW bus (s390x).
    VirtioBlockCcw,
    /// Disks mapped as NVDIMM memory devices.
    Nvdimm,
}

/// Mechanism used to share host directories with the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedFs {
    /// No shared filesystem.
    None,
    /// Plan 9 filesystem over virtio.
    #[default]
    Virtio9p,
    /// virtio-fs backed by an external vhost-user daemon.
    VirtioFs,
}

/// QEMU machine type. The machine type selects the arch backend and with
/// it the bus topology (PCI vs PCIe vs CCW) and device name suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MachineType {
    Pc,
    #[default]
    Q35,
    /// aarch64 `virt` machine.
    Virt,
    /// ppc64le `pseries` machine.
    Pseries,
    /// s390x `s390-ccw-virtio` machine.
    CcwVirtio,
}

impl MachineType {
    /// The name QEMU knows this machine by.
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineType::Pc => "pc",
            MachineType::Q35 => "q35",
            MachineType::Virt => "virt",
            MachineType::Pseries => "pseries",
            MachineType::CcwVirtio => "s390-ccw-virtio",
        }
    }
}

/// A single `key=value` kernel command line parameter. A parameter with an
/// empty value serializes as the bare key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    pub key: String,
    pub value: String,
}

impl KernelParam {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Serialize kernel parameters in order. The kernel honours the last value
/// of a duplicated key, so callers control overrides purely by ordering.
pub fn serialize_params(params: &[KernelParam]) -> String {
    params
        .iter()
        .map(|p| {
            if p.value.is_empty() {
                p.key.clone()
            } else {
                format!("{}={}", p.key, p.value)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Static launch configuration for one sandbox VM.
#[derive(Debug, Clone)]
pub struct HypervisorConfig {
    /// QEMU binary. Empty means "let the arch backend pick".
    pub hypervisor_path: Option<Utf8PathBuf>,
    pub kernel_path: Utf8PathBuf,
    pub initrd_path: Option<Utf8PathBuf>,
    /// Root filesystem image; attached as NVDIMM on x86, virtio-block
    /// elsewhere. Only consulted when no initrd is set.
    pub image_path: Option<Utf8PathBuf>,
    pub firmware_path: Option<Utf8PathBuf>,

    pub machine_type: MachineType,
    /// Extra accelerator properties appended to `-machine` (comma joined).
    pub machine_accelerators: String,

    /// vCPUs booted with.
    pub num_vcpus: u32,
    /// Ceiling for vCPU hotplug; also the guest `nr_cpus=` parameter.
    pub default_max_vcpus: u32,

    /// Boot memory in MiB.
    pub memory_size_mib: u32,
    /// DIMM slots reserved for memory hotplug.
    pub mem_slots: u32,
    /// Extra guest address space (MiB) reserved for NVDIMM devices.
    pub memory_offset: u32,

    pub default_bridges: u32,

    pub block_device_driver: BlockDriver,
    pub block_device_cache_set: bool,
    pub block_device_cache_direct: bool,
    pub block_device_cache_noflush: bool,

    pub shared_fs: SharedFs,
    pub virtio_fs_daemon: Utf8PathBuf,
    pub virtio_fs_cache: String,
    pub virtio_fs_cache_size_mib: u32,
    pub virtio_fs_extra_args: Vec<String>,

    /// Root directory for file backed guest memory. When set (and
    /// templating is off) guest RAM is file backed and shared.
    pub file_backed_mem_root_dir: Option<Utf8PathBuf>,
    /// Guest memory file used by VM templating.
    pub memory_path: Option<Utf8PathBuf>,
    /// Device state blob consumed/produced by template migration.
    pub devices_state_path: Option<Utf8PathBuf>,

    pub huge_pages: bool,
    pub mlock: bool,
    pub realtime: bool,
    pub mem_prealloc: bool,
    pub debug: bool,
    pub disable_nesting_checks: bool,
    pub disable_vhost_net: bool,
    pub hotplug_vfio_on_root_bus: bool,
    pub boot_to_be_template: bool,
    pub boot_from_template: bool,
    pub use_vsock: bool,
    pub enable_io_threads: bool,

    /// User supplied kernel parameters; appended last so they win.
    pub kernel_params: Vec<KernelParam>,

    pub entropy_source: Utf8PathBuf,
    /// 9p msize (bytes) for shared-fs = virtio-9p.
    pub msize_9p: u32,

    /// Root of the per-sandbox runtime directories (sockets, pid file).
    pub run_store_path: Utf8PathBuf,
    /// Root of the per-sandbox shared directories exported to the guest.
    pub host_shared_path: Utf8PathBuf,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            hypervisor_path: None,
            kernel_path: Utf8PathBuf::new(),
            initrd_path: None,
            image_path: None,
            firmware_path: None,
            machine_type: MachineType::default(),
            machine_accelerators: String::new(),
            num_vcpus: 1,
            default_max_vcpus: 1,
            memory_size_mib: 2048,
            mem_slots: 10,
            memory_offset: 0,
            default_bridges: 1,
            block_device_driver: BlockDriver::default(),
            block_device_cache_set: false,
            block_device_cache_direct: false,
            block_device_cache_noflush: false,
            shared_fs: SharedFs::default(),
            virtio_fs_daemon: Utf8PathBuf::from("/usr/libexec/virtiofsd"),
            virtio_fs_cache: "always".to_string(),
            virtio_fs_cache_size_mib: 0,
            virtio_fs_extra_args: Vec::new(),
            file_backed_mem_root_dir: None,
            memory_path: None,
            devices_state_path: None,
            huge_pages: false,
            mlock: false,
            realtime: false,
            mem_prealloc: false,
            debug: false,
            disable_nesting_checks: false,
            disable_vhost_net: false,
            hotplug_vfio_on_root_bus: false,
            boot_to_be_template: false,
            boot_from_template: false,
            use_vsock: false,
            enable_io_threads: false,
            kernel_params: Vec::new(),
            entropy_source: Utf8PathBuf::from("/dev/urandom"),
            msize_9p: 8192,
            run_store_path: Utf8PathBuf::from("/run/qvm/vm"),
            host_shared_path: Utf8PathBuf::from("/run/qvm/shared"),
        }
    }
}

impl HypervisorConfig {
    /// Reject configurations that can never produce a working VM. Errors
    /// here are caller bugs and must surface before any process is
    /// spawned.
    pub fn validate(&self) -> Result<()> {
        if self.kernel_path.as_str().is_empty() {
            bail!("missing kernel path in hypervisor configuration");
        }
        if self.num_vcpus == 0 {
            bail!("hypervisor configuration requires at least one vCPU");
        }
        if self.memory_size_mib == 0 {
            bail!("hypervisor configuration requires a non-zero memory size");
        }
        if self.default_max_vcpus < self.num_vcpus {
            bail!(
                "maximum vCPU count {} is below the boot vCPU count {}",
                self.default_max_vcpus,
                self.num_vcpus
            );
        }
        if self.boot_to_be_template && self.boot_from_template {
            bail!("cannot boot a template VM from a template");
        }
        if self.boot_from_template && self.memory_path.is_none() {
            bail!("booting from a VM template requires a memory path");
        }
        if self.boot_from_template && self.devices_state_path.is_none() {
            bail!("booting from a VM template requires a devices state path");
        }
        Ok(())
    }

    /// Normalized accelerator suffix for `-machine`, always either empty
    /// or starting with a comma.
    pub fn accelerator_suffix(&self) -> String {
        let accels = self.machine_accelerators.trim();
        if accels.is_empty() {
            String::new()
        } else if let Some(stripped) = accels.strip_prefix(',') {
            format!(",{stripped}")
        } else {
            format!(",{accels}")
        }
    }

    /// Per-sandbox runtime directory.
    pub fn vm_dir(&self, id: &str) -> Utf8PathBuf {
        self.run_store_path.join(id)
    }

    /// Directory exported to the guest through virtio-fs or 9p.
    pub fn shared_dir(&self, id: &str) -> Utf8PathBuf {
        self.host_shared_path.join(id)
    }

    /// Guest console socket.
    pub fn console_socket(&self, id: &str) -> Utf8PathBuf {
        self.vm_dir(id).join("console.sock")
    }

    /// QMP control socket.
    pub fn qmp_socket(&self, id: &str) -> Utf8PathBuf {
        self.vm_dir(id).join("qmp.sock")
    }

    /// vhost-user-fs socket the virtiofsd daemon listens on.
    pub fn vhost_fs_socket(&self, id: &str) -> Utf8PathBuf {
        self.vm_dir(id).join("vhost-fs.sock")
    }

    /// File QEMU writes its main PID to.
    pub fn pid_file(&self, id: &str) -> Utf8PathBuf {
        self.vm_dir(id).join("pid")
    }

    /// QEMU log file, used only in debug mode.
    pub fn log_file(&self, id: &str) -> Utf8PathBuf {
        self.vm_dir(id).join("qemu.log")
    }

    /// Whether either side of VM templating is active.
    pub fn templating(&self) -> bool {
        self.boot_to_be_template || self.boot_from_template
    }
}

/// Total host memory in MiB, from `/proc/meminfo`.
pub fn host_memory_mib() -> Result<u64> {
    let kib = host_memory_kib(Utf8Path::new("/proc/meminfo"))?;
    Ok(kib / 1024)
}

fn host_memory_kib(meminfo: &Utf8Path) -> Result<u64> {
    let contents = std::fs::read_to_string(meminfo)
        .with_context(|| format!("reading {meminfo}"))?;
    for line in contents.lines() {
        let Some(rest) = line.strip_prefix("MemTotal:") else {
            continue;
        };
        let kib: u64 = rest
            .trim()
            .trim_end_matches(" kB")
            .trim()
            .parse()
            .with_context(|| format!("parsing MemTotal from {meminfo}"))?;
        if kib == 0 {
            bail!("host reports zero total memory");
        }
        return Ok(kib);
    }
    Err(eyre!("no MemTotal entry in {meminfo}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_serialize_params() {
        let params = vec![
            KernelParam::new("panic", "1"),
            KernelParam::new("quiet", ""),
            KernelParam::new("root", "/dev/vda1"),
        ];
        assert_eq!(serialize_params(&params), "panic=1 quiet root=/dev/vda1");
    }

    #[test]
    fn test_validate_defaults_need_kernel() {
        let mut config = HypervisorConfig::default();
        assert!(config.validate().is_err());
        config.kernel_path = "/usr/share/vm/vmlinuz".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_vcpu_bounds() {
        let mut config = HypervisorConfig {
            kernel_path: "/usr/share/vm/vmlinuz".into(),
            ..Default::default()
        };
        config.num_vcpus = 4;
        config.default_max_vcpus = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accelerator_suffix_normalization() {
        let mut config = HypervisorConfig::default();
        assert_eq!(config.accelerator_suffix(), "");
        config.machine_accelerators = "nvdimm".into();
        assert_eq!(config.accelerator_suffix(), ",nvdimm");
        config.machine_accelerators = ",nvdimm=on,accel=kvm".into();
        assert_eq!(config.accelerator_suffix(), ",nvdimm=on,accel=kvm");
    }

    #[test]
    fn test_host_memory_kib() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meminfo");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "MemTotal:       4194304 kB").unwrap();
        writeln!(f, "MemFree:        1048576 kB").unwrap();
        drop(f);
        let kib =
            host_memory_kib(camino::Utf8Path::from_path(&path).unwrap()).unwrap();
        assert_eq!(kib, 4194304);
    }
}
