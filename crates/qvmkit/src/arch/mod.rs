//! Per-machine-type behavior behind the [`ArchOps`] capability.
//!
//! The controller core never branches on architecture directly: machine
//! tables, topology formulas, bus policy and device flavors all come
//! through this trait. [`ArchBase`] carries the shared default table and
//! each machine type is a thin leaf over it; leaves override only what
//! their platform actually changes.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{bail, eyre, Context};
use color_eyre::Result;
use tracing::debug;

use crate::bridge::{Bridge, BridgeTable, BusType, SlotRef};
use crate::cmdline::{MemorySpec, Smp};
use crate::config::{HypervisorConfig, KernelParam, MachineType};
use crate::device::{
    make_name_id, truncate_id, BlockDrive, CharDriver, Endpoint, LaunchDevice, SerialPort,
    VfioDevice, VfioKind, VhostUserFsDevice, Volume,
};
use crate::qmp::QmpSession;

mod aarch64;
mod ppc64;
mod s390x;
mod x86_64;

pub(crate) const SCSI_CONTROLLER_ID: &str = "scsi0";
pub(crate) const RNG_ID: &str = "rng0";

const DEFAULT_CORES: u32 = 1;
const DEFAULT_THREADS: u32 = 1;
const DEFAULT_CPU_MODEL: &str = "host";

/// First root-bus slot handed to bridges on PCI machines; slots 0 and 1
/// belong to the platform.
const BRIDGE_PCI_START_ADDR: u32 = 2;

/// A machine type QEMU accepts, with its baked-in option string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    pub mtype: &'static str,
    pub options: &'static str,
}

/// What the hypervisor under this arch can do; reported to the
/// orchestrator through the façade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub block_device_hotplug: bool,
    pub multi_queue: bool,
}

/// Shared state and default behavior for every machine type.
#[derive(Debug, Default)]
pub struct ArchBase {
    pub(crate) machine_type: MachineType,
    pub(crate) machines: Vec<Machine>,
    pub(crate) qemu_paths: Vec<(MachineType, &'static str)>,
    /// Bus the hot-pluggable devices land on.
    pub(crate) bus: BusType,
    /// Root bus name bridges attach to.
    pub(crate) root_bus: &'static str,
    pub(crate) nested_run: bool,
    pub(crate) vhost_net: bool,
    pub(crate) network_index: u32,
    /// Extra guest address space (MiB) reserved for NVDIMMs.
    pub(crate) memory_offset: u32,
    pub(crate) kernel_params: Vec<KernelParam>,
    pub(crate) kernel_params_debug: Vec<KernelParam>,
    pub(crate) kernel_params_non_debug: Vec<KernelParam>,
    pub(crate) bridges: BridgeTable,
}

/// Capability table consumed by the controller core. Most operations have
/// a default implementation over [`ArchBase`].
pub trait ArchOps: Send {
    fn base(&self) -> &ArchBase;
    fn base_mut(&mut self) -> &mut ArchBase;

    fn machine_type(&self) -> MachineType {
        self.base().machine_type
    }

    /// Device name suffix for the virtio transport of this machine.
    fn transport_suffix(&self) -> &'static str {
        "-pci"
    }

    fn machine(&self) -> Result<Machine> {
        let base = self.base();
        base.machines
            .iter()
            .find(|m| m.mtype == base.machine_type.as_str())
            .copied()
            .ok_or_else(|| eyre!("unrecognised machine type: {}", base.machine_type.as_str()))
    }

    fn qemu_path(&self) -> Result<Utf8PathBuf> {
        let base = self.base();
        base.qemu_paths
            .iter()
            .find(|(mtype, _)| *mtype == base.machine_type)
            .map(|(_, path)| Utf8PathBuf::from(*path))
            .ok_or_else(|| eyre!("unknown machine type: {}", base.machine_type.as_str()))
    }

    fn cpu_model(&self) -> String {
        DEFAULT_CPU_MODEL.to_string()
    }

    fn cpu_topology(&self, vcpus: u32, maxvcpus: u32) -> Smp {
        Smp {
            cpus: vcpus,
            sockets: maxvcpus,
            cores: DEFAULT_CORES,
            threads: DEFAULT_THREADS,
            max_cpus: maxvcpus,
        }
    }

    fn memory_topology(&self, memory_mib: u64, host_memory_mib: u64, slots: u32) -> MemorySpec {
        MemorySpec {
            size: format!("{memory_mib}M"),
            slots,
            max_mem: format!("{host_memory_mib}M"),
            path: None,
        }
    }

    /// Arch kernel parameter base; the caller appends the controller
    /// defaults and the user overrides after these.
    fn kernel_params_base(&self, debug: bool) -> Vec<KernelParam> {
        let base = self.base();
        let mut params = base.kernel_params.clone();
        if debug {
            params.extend(base.kernel_params_debug.iter().cloned());
        } else {
            params.extend(base.kernel_params_non_debug.iter().cloned());
        }
        params
    }

    /// Fold the root-image kernel parameters into the base set. Called
    /// once at init when the config carries an image path.
    fn handle_image_path(&mut self, config: &HypervisorConfig);

    fn supports_guest_memory_hotplug(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            block_device_hotplug: true,
            multi_queue: true,
        }
    }

    fn enable_nesting_checks(&mut self) {
        self.base_mut().nested_run = true;
    }

    fn disable_nesting_checks(&mut self) {
        self.base_mut().nested_run = false;
    }

    fn enable_vhost_net(&mut self) {
        self.base_mut().vhost_net = true;
    }

    fn disable_vhost_net(&mut self) {
        self.base_mut().vhost_net = false;
    }

    /// Create the boot-time bridge set. Runs exactly once per sandbox
    /// lifetime; reattached controllers restore via [`ArchOps::set_bridges`].
    fn create_bridges(&mut self, count: u32) {
        let bus = self.base().bus;
        self.base_mut().bridges = BridgeTable::create(bus, count);
    }

    fn bridges(&self) -> &[Bridge] {
        self.base().bridges.bridges()
    }

    fn set_bridges(&mut self, bridges: Vec<Bridge>) {
        self.base_mut().bridges = BridgeTable::from_bridges(bridges);
    }

    fn first_bridge_addr(&self) -> u32 {
        BRIDGE_PCI_START_ADDR
    }

    /// Emit the bridge devices. Must run before any device that attaches
    /// to a bridge so the bridges get the first root-bus addresses.
    fn append_bridges(&mut self, devices: &mut Vec<LaunchDevice>) {
        let start = self.first_bridge_addr();
        let root_bus = self.base().root_bus;
        let base = self.base_mut();
        base.bridges.assign_addresses(start);
        for (idx, bridge) in base.bridges.bridges().iter().enumerate() {
            if bridge.bus == BusType::Ccw {
                continue;
            }
            devices.push(LaunchDevice::Bridge {
                bus: bridge.bus,
                id: bridge.id.clone(),
                root_bus,
                // Each bridge needs a unique chassis id > 0.
                chassis: idx as u32 + 1,
                addr: bridge.addr,
            });
        }
    }

    fn add_device_to_bridge(&mut self, id: &str, bus: BusType) -> Result<SlotRef> {
        self.base_mut().bridges.allocate(id, bus)
    }

    fn remove_device_from_bridge(&mut self, id: &str) -> Result<()> {
        self.base_mut().bridges.release(id)
    }

    fn append_console(&self, devices: &mut Vec<LaunchDevice>, path: &Utf8Path) {
        devices.push(LaunchDevice::SerialController {
            id: "serial0".to_string(),
            disable_modern: self.base().nested_run,
        });
        devices.push(LaunchDevice::Char {
            driver: CharDriver::Console,
            device_id: "console0".to_string(),
            id: "charconsole0".to_string(),
            path: path.to_owned(),
            name: None,
        });
    }

    /// Attach the root image. The base flavor is a plain virtio-block
    /// drive; x86 overrides this with an NVDIMM mapping.
    fn append_image(&self, devices: &mut Vec<LaunchDevice>, path: &Utf8Path) -> Result<()> {
        let drive = generic_image_drive(path)?;
        self.append_block_device(devices, &drive)
    }

    /// Append the SCSI controller; returns the iothread id when one was
    /// requested so the caller can register the iothread object.
    fn append_scsi_controller(
        &self,
        devices: &mut Vec<LaunchDevice>,
        enable_io_threads: bool,
    ) -> Option<String> {
        let io_thread = enable_io_threads.then(|| make_name_id("iothread"));
        devices.push(LaunchDevice::ScsiController {
            id: SCSI_CONTROLLER_ID.to_string(),
            io_thread: io_thread.clone(),
            disable_modern: self.base().nested_run,
        });
        io_thread
    }

    fn append_9p_volume(&self, devices: &mut Vec<LaunchDevice>, volume: &Volume) {
        if volume.mount_tag.is_empty() || volume.host_path.as_str().is_empty() {
            return;
        }
        devices.push(LaunchDevice::NinePFs {
            id: truncate_id(&format!("extra-9p-{}", volume.mount_tag)),
            path: volume.host_path.clone(),
            mount_tag: volume.mount_tag.clone(),
            disable_modern: self.base().nested_run,
        });
    }

    fn append_serial_port(&self, devices: &mut Vec<LaunchDevice>, port: &SerialPort) {
        devices.push(LaunchDevice::Char {
            driver: CharDriver::SerialPort,
            device_id: port.device_id.clone(),
            id: truncate_id(&port.id),
            path: port.host_path.clone(),
            name: Some(port.name.clone()),
        });
    }

    fn append_vsock(&self, devices: &mut Vec<LaunchDevice>, context_id: u64, vhost_fd_num: i32) {
        devices.push(LaunchDevice::Vsock {
            id: format!("vsock-{context_id}"),
            context_id,
            vhost_fd_num,
            disable_modern: self.base().nested_run,
        });
    }

    fn append_network(&mut self, devices: &mut Vec<LaunchDevice>, endpoint: &Endpoint) -> Result<()> {
        use std::os::fd::AsRawFd;

        let tap = endpoint.tap();
        let base = self.base();
        let device = LaunchDevice::Net {
            id: format!("network-{}", base.network_index),
            ifname: tap.name.clone(),
            mac: tap.hard_addr.clone(),
            vhost: base.vhost_net,
            fd_nums: tap.vm_fds.iter().map(|fd| fd.as_raw_fd()).collect(),
            vhost_fd_nums: tap.vhost_fds.iter().map(|fd| fd.as_raw_fd()).collect(),
            disable_modern: base.nested_run,
        };
        self.base_mut().network_index += 1;
        devices.push(device);
        Ok(())
    }

    fn append_block_device(&self, devices: &mut Vec<LaunchDevice>, drive: &BlockDrive) -> Result<()> {
        if drive.file.as_str().is_empty() || drive.id.is_empty() || drive.format.is_empty() {
            bail!("empty file, id or format for drive {drive:?}");
        }
        devices.push(LaunchDevice::Block {
            id: truncate_id(&drive.id),
            file: drive.file.clone(),
            format: drive.format.clone(),
            read_only: drive.read_only,
            disable_modern: self.base().nested_run,
        });
        Ok(())
    }

    fn append_vhost_user_fs(&self, devices: &mut Vec<LaunchDevice>, dev: &VhostUserFsDevice) {
        devices.push(LaunchDevice::VhostUserFs {
            char_id: truncate_id(&format!("char-{}", dev.dev_id)),
            dev_id: truncate_id(&format!("fs-{}", dev.dev_id)),
            socket_path: dev.socket_path.clone(),
            tag: dev.tag.clone(),
            cache_size_mib: dev.cache_size_mib,
        });
    }

    /// Static VFIO attach; mediated devices cannot be cold-plugged and
    /// are silently skipped, same as unplugged BDF-less records.
    fn append_vfio(&self, devices: &mut Vec<LaunchDevice>, vfio: &VfioDevice) {
        if let VfioKind::Normal { bdf } = &vfio.kind {
            devices.push(LaunchDevice::Vfio { bdf: bdf.clone() });
        }
    }

    fn append_rng(&self, devices: &mut Vec<LaunchDevice>, entropy_source: &Utf8Path) {
        devices.push(LaunchDevice::Rng {
            id: RNG_ID.to_string(),
            filename: entropy_source.to_owned(),
        });
    }

    /// Tell the migration engine to skip shared memory regions; required
    /// on both sides of VM templating.
    fn set_ignore_shared_memory_migration_caps(&self, qmp: &mut QmpSession) -> Result<()> {
        qmp.set_migration_caps(&[(qapi_qmp::MigrationCapability::x_ignore_shared, true)])
    }
}

/// Build a random-id raw drive record for the root image.
fn generic_image_drive(path: &Utf8Path) -> Result<BlockDrive> {
    if !path.exists() {
        bail!("image path {path} does not exist");
    }
    Ok(BlockDrive {
        id: make_name_id("image"),
        file: path.to_owned(),
        format: "raw".to_string(),
        read_only: true,
        ..Default::default()
    })
}

/// Size of the root image in bytes, for the NVDIMM mapping.
pub(crate) fn image_size(path: &Utf8Path) -> Result<u64> {
    let meta = std::fs::metadata(path).with_context(|| format!("inspecting image {path}"))?;
    Ok(meta.len())
}

impl ArchOps for ArchBase {
    fn base(&self) -> &ArchBase {
        self
    }

    fn base_mut(&mut self) -> &mut ArchBase {
        self
    }

    fn handle_image_path(&mut self, _config: &HypervisorConfig) {}
}

/// Instantiate the arch backend for the configured machine type.
pub fn new_arch(config: &HypervisorConfig) -> Box<dyn ArchOps> {
    let mut arch: Box<dyn ArchOps> = match config.machine_type {
        MachineType::Pc | MachineType::Q35 => Box::new(x86_64::Amd64::new(config)),
        MachineType::Virt => Box::new(aarch64::Aarch64::new(config)),
        MachineType::Pseries => Box::new(ppc64::Ppc64::new(config)),
        MachineType::CcwVirtio => Box::new(s390x::S390x::new(config)),
    };
    if config.image_path.is_some() {
        arch.handle_image_path(config);
    }
    debug!(
        machine = config.machine_type.as_str(),
        "selected arch backend"
    );
    arch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_cpu_topology_single() {
        let arch = ArchBase::default();
        let smp = arch.cpu_topology(1, 1);
        assert_eq!(
            smp,
            Smp {
                cpus: 1,
                sockets: 1,
                cores: 1,
                threads: 1,
                max_cpus: 1
            }
        );
    }

    #[test]
    fn test_base_memory_topology() {
        let arch = ArchBase::default();
        let mem = arch.memory_topology(1000, 4194304 / 1024, 8);
        assert_eq!(mem.size, "1000M");
        assert_eq!(mem.slots, 8);
        assert_eq!(mem.max_mem, "4096M");
        assert!(mem.path.is_none());
    }

    #[test]
    fn test_machine_lookup_unknown() {
        let arch = ArchBase::default();
        // Default base has an empty machine table.
        assert!(arch.machine().is_err());
    }

    #[test]
    fn test_kernel_params_debug_split() {
        let mut arch = ArchBase::default();
        arch.kernel_params = vec![KernelParam::new("tsc", "reliable")];
        arch.kernel_params_debug = vec![KernelParam::new("debug", "")];
        arch.kernel_params_non_debug = vec![KernelParam::new("quiet", "")];

        let debug: Vec<String> = arch
            .kernel_params_base(true)
            .iter()
            .map(|p| p.key.clone())
            .collect();
        assert_eq!(debug, ["tsc", "debug"]);

        let quiet: Vec<String> = arch
            .kernel_params_base(false)
            .iter()
            .map(|p| p.key.clone())
            .collect();
        assert_eq!(quiet, ["tsc", "quiet"]);
    }
}
