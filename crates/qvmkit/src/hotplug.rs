//! Live device hot-plug and hot-unplug flows.
//!
//! Every add flow is a linear pipeline: host resources first, then QMP
//! commands in QEMU's dependency order, then the in-memory model. Each
//! step that fails unwinds the steps before it in reverse, so a mid-path
//! failure leaves no ghost resource on either side. Removes mirror the
//! adds. The dispatcher persists state after every successful flow.

use std::io::Seek;

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use tracing::{debug, error, warn};

use crate::bridge::BusType;
use crate::config::{BlockDriver, SharedFs};
use crate::controller::ControllerInner;
use crate::device::{BlockDrive, Endpoint, MemoryDevice, VfioDevice, VfioKind};
use crate::qmp::MemoryBackend;

/// SCSI bus exposed by the boot-time controller.
const SCSI_BUS: &str = "scsi0.0";

/// Hot-(un)pluggable payloads accepted by the façade. Mutable fields of
/// the descriptors (guest addresses, derived ids) are filled back in by
/// a successful add.
#[derive(Debug)]
pub enum HotplugDevice {
    Block(BlockDrive),
    Vfio(VfioDevice),
    Network(Endpoint),
    Vcpus(u32),
    MemoryMib(MemoryDevice),
}

/// What a hotplug flow yielded beyond its side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugResult {
    None,
    /// vCPUs actually added or removed.
    Vcpus(u32),
    /// Memory actually added or removed, in MiB.
    MemoryMib(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Add,
    Remove,
}

/// Derive the SCSI id and LUN from a drive's attach index.
pub(crate) fn scsi_id_lun(index: u32) -> Result<(u32, u32)> {
    // 256 LUNs per SCSI id; the bus offers 256 ids.
    if index >= 256 * 256 {
        bail!("drive index {index} exceeds the SCSI address space");
    }
    Ok((index / 256, index % 256))
}

impl ControllerInner {
    /// Single entry point for all hotplug traffic.
    pub(crate) fn hotplug(&mut self, device: &mut HotplugDevice, op: Op) -> Result<HotplugResult> {
        self.ensure_qmp()?;
        let result = match (device, op) {
            (HotplugDevice::Block(drive), Op::Add) => {
                self.hotplug_add_block(drive).map(|()| HotplugResult::None)
            }
            (HotplugDevice::Block(drive), Op::Remove) => self
                .hotplug_remove_block(drive)
                .map(|()| HotplugResult::None),
            (HotplugDevice::Vfio(dev), Op::Add) => {
                self.hotplug_add_vfio(dev).map(|()| HotplugResult::None)
            }
            (HotplugDevice::Vfio(dev), Op::Remove) => {
                self.hotplug_remove_vfio(dev).map(|()| HotplugResult::None)
            }
            (HotplugDevice::Network(endpoint), Op::Add) => self
                .hotplug_add_net(endpoint)
                .map(|()| HotplugResult::None),
            (HotplugDevice::Network(endpoint), Op::Remove) => self
                .hotplug_remove_net(endpoint)
                .map(|()| HotplugResult::None),
            (HotplugDevice::Vcpus(count), Op::Add) => {
                self.hotplug_add_cpus(*count).map(HotplugResult::Vcpus)
            }
            (HotplugDevice::Vcpus(count), Op::Remove) => {
                self.hotplug_remove_cpus(*count).map(HotplugResult::Vcpus)
            }
            (HotplugDevice::MemoryMib(dev), Op::Add) => {
                self.hotplug_add_memory(dev).map(HotplugResult::MemoryMib)
            }
            (HotplugDevice::MemoryMib(dev), Op::Remove) => self
                .hotplug_remove_memory(dev)
                .map(HotplugResult::MemoryMib),
        }?;
        self.store_state()?;
        Ok(result)
    }

    // -- block ----------------------------------------------------------

    fn hotplug_add_block(&mut self, drive: &mut BlockDrive) -> Result<()> {
        if self.config.block_device_driver == BlockDriver::Nvdimm {
            return self.hotplug_add_nvdimm(drive);
        }

        if self.config.block_device_cache_set {
            let direct = self.config.block_device_cache_direct;
            let no_flush = self.config.block_device_cache_noflush;
            self.qmp_mut()?.blockdev_add_with_cache(
                &drive.file,
                &drive.id,
                direct,
                no_flush,
            )?;
        } else {
            self.qmp_mut()?.blockdev_add(&drive.file, &drive.id)?;
        }

        if let Err(err) = self.hotplug_attach_block_frontend(drive) {
            // Unwind the backend so no orphaned node lingers in QEMU.
            if let Err(del_err) = self.qmp_mut()?.blockdev_del(&drive.id) {
                warn!(drive = %drive.id, %del_err, "could not roll back blockdev_add");
            }
            return Err(err);
        }
        Ok(())
    }

    fn hotplug_attach_block_frontend(&mut self, drive: &mut BlockDrive) -> Result<()> {
        let dev_id = drive.device_id();
        match self.config.block_device_driver {
            BlockDriver::VirtioBlockCcw => {
                let slot = self.arch.add_device_to_bridge(&drive.id, BusType::Ccw)?;
                drive.ccw_devno = Some(slot.ccw_virt_server_addr());
                let devno = slot.ccw_addr();
                if let Err(err) = self.qmp_mut()?.ccw_device_add(&drive.id, &dev_id, &devno) {
                    self.release_bridge_slot(&drive.id);
                    return Err(err);
                }
                Ok(())
            }
            BlockDriver::VirtioBlock => {
                let slot = self.arch.add_device_to_bridge(&drive.id, BusType::Pci)?;
                drive.pci_addr = Some(slot.pci_addr());
                if let Err(err) = self.qmp_mut()?.pci_device_add(
                    &drive.id,
                    &dev_id,
                    &slot.slot_string(),
                    &slot.bridge_id,
                ) {
                    self.release_bridge_slot(&drive.id);
                    return Err(err);
                }
                Ok(())
            }
            BlockDriver::VirtioScsi => {
                let (scsi_id, lun) = scsi_id_lun(drive.index)?;
                self.qmp_mut()?
                    .scsi_device_add(&drive.id, &dev_id, SCSI_BUS, scsi_id, lun)
            }
            BlockDriver::Nvdimm => bail!("NVDIMM drives take the dedicated hotplug path"),
        }
    }

    fn hotplug_add_nvdimm(&mut self, drive: &mut BlockDrive) -> Result<()> {
        let mut file = std::fs::File::open(&drive.file)
            .map_err(|err| eyre!("opening NVDIMM backing file {}: {err}", drive.file))?;
        // Device size query: seek to the end works for both regular files
        // and block devices.
        let size = file.seek(std::io::SeekFrom::End(0))?;
        self.qmp_mut()?.nvdimm_add(&drive.id, &drive.file, size)?;
        drive.nvdimm_id = Some(self.state.nvdimm_count.to_string());
        self.state.nvdimm_count += 1;
        Ok(())
    }

    fn hotplug_remove_block(&mut self, drive: &mut BlockDrive) -> Result<()> {
        match self.config.block_device_driver {
            BlockDriver::VirtioBlock | BlockDriver::VirtioBlockCcw => {
                self.arch.remove_device_from_bridge(&drive.id)?;
            }
            _ => {}
        }
        let dev_id = drive.device_id();
        self.qmp_mut()?.device_del(&dev_id)?;
        self.qmp_mut()?.blockdev_del(&drive.id)?;
        Ok(())
    }

    // -- VFIO -------------------------------------------------------------

    fn hotplug_add_vfio(&mut self, dev: &VfioDevice) -> Result<()> {
        // Devices needing a large PCI BAR cannot sit behind a bridge;
        // the snapshot taken at init decides, not the live config.
        if self.state.hotplug_vfio_on_root_bus {
            return match &dev.kind {
                VfioKind::Normal { bdf } => self.qmp_mut()?.vfio_device_add(&dev.id, bdf),
                VfioKind::Mediated { sysfs_dev } => {
                    self.qmp_mut()?
                        .pci_vfio_mediated_add(&dev.id, sysfs_dev, None, None)
                }
            };
        }

        let slot = self.arch.add_device_to_bridge(&dev.id, BusType::Pci)?;
        let result = match &dev.kind {
            VfioKind::Normal { bdf } => self.qmp_mut()?.pci_vfio_device_add(
                &dev.id,
                bdf,
                &slot.slot_string(),
                &slot.bridge_id,
            ),
            VfioKind::Mediated { sysfs_dev } => self.qmp_mut()?.pci_vfio_mediated_add(
                &dev.id,
                sysfs_dev,
                Some(&slot.slot_string()),
                Some(&slot.bridge_id),
            ),
        };
        if let Err(err) = result {
            self.release_bridge_slot(&dev.id);
            return Err(err);
        }
        Ok(())
    }

    fn hotplug_remove_vfio(&mut self, dev: &VfioDevice) -> Result<()> {
        if !self.state.hotplug_vfio_on_root_bus {
            self.arch.remove_device_from_bridge(&dev.id)?;
        }
        self.qmp_mut()?.device_del(&dev.id)
    }

    // -- network ------------------------------------------------------------

    fn hotplug_add_net(&mut self, endpoint: &mut Endpoint) -> Result<()> {
        match endpoint {
            Endpoint::Veth { .. } | Endpoint::Tap { .. } => {}
            _ => bail!("this endpoint is not supported for network hotplug"),
        }

        let netdev_id = endpoint.tap().name.clone();
        let tap_id = endpoint.tap().id.clone();
        let dev_id = format!("virtio-{tap_id}");
        let mac = endpoint.tap().hard_addr.clone();

        let (fd_names, vhost_fd_names) = self.transfer_net_fds(endpoint)?;
        self.qmp_mut()?
            .netdev_add_by_fds(&netdev_id, &fd_names, &vhost_fd_names)?;

        if let Err(err) = self.hotplug_attach_net_frontend(endpoint, &netdev_id, &tap_id, &dev_id, &mac)
        {
            if let Err(del_err) = self.qmp_mut()?.netdev_del(&netdev_id) {
                warn!(netdev = %netdev_id, %del_err, "could not roll back netdev_add");
            }
            return Err(err);
        }
        Ok(())
    }

    fn hotplug_attach_net_frontend(
        &mut self,
        endpoint: &mut Endpoint,
        netdev_id: &str,
        tap_id: &str,
        dev_id: &str,
        mac: &str,
    ) -> Result<()> {
        let bus = self.arch.base().bus;
        let slot = self.arch.add_device_to_bridge(tap_id, bus)?;
        endpoint.set_pci_addr(slot.pci_addr());

        let result = if bus == BusType::Ccw {
            self.qmp_mut()?
                .net_ccw_device_add(netdev_id, dev_id, mac, &slot.ccw_addr())
        } else {
            let num_vcpus = self.config.num_vcpus;
            self.qmp_mut()?.net_pci_device_add(
                netdev_id,
                dev_id,
                mac,
                &slot.slot_string(),
                &slot.bridge_id,
                num_vcpus,
            )
        };
        if let Err(err) = result {
            self.release_bridge_slot(tap_id);
            return Err(err);
        }
        Ok(())
    }

    /// Hand the tap fds to QEMU. The vhost fds are closed locally right
    /// after transfer: QEMU owns them now.
    fn transfer_net_fds(&mut self, endpoint: &mut Endpoint) -> Result<(Vec<String>, Vec<String>)> {
        use std::os::fd::AsRawFd;

        let mut fd_names = Vec::new();
        for (i, fd) in endpoint.tap().vm_fds.iter().enumerate() {
            let name = format!("fd{i}");
            self.qmp_mut()?.getfd(&name, fd.as_raw_fd())?;
            fd_names.push(name);
        }

        let mut vhost_fd_names = Vec::new();
        let vhost_fds = std::mem::take(&mut endpoint.tap_mut().vhost_fds);
        for (i, fd) in vhost_fds.into_iter().enumerate() {
            let name = format!("vhostfd{i}");
            self.qmp_mut()?.getfd(&name, fd.as_raw_fd())?;
            drop(fd);
            vhost_fd_names.push(name);
        }
        Ok((fd_names, vhost_fd_names))
    }

    fn hotplug_remove_net(&mut self, endpoint: &mut Endpoint) -> Result<()> {
        match endpoint {
            Endpoint::Veth { .. } | Endpoint::Tap { .. } => {}
            _ => bail!("this endpoint is not supported for network hotplug"),
        }
        let tap_id = endpoint.tap().id.clone();
        let netdev_id = endpoint.tap().name.clone();
        let dev_id = format!("virtio-{tap_id}");

        self.arch.remove_device_from_bridge(&tap_id)?;
        self.qmp_mut()?.device_del(&dev_id)?;
        self.qmp_mut()?.netdev_del(&netdev_id)?;
        Ok(())
    }

    // -- vCPUs ---------------------------------------------------------------

    fn hotplug_add_cpus(&mut self, requested: u32) -> Result<u32> {
        if requested == 0 {
            warn!("cannot hotplug 0 vCPUs");
            return Ok(0);
        }

        let current = self.launch.smp.cpus + self.state.hotplugged_vcpus.len() as u32;
        let mut amount = requested;
        if current + amount > self.config.default_max_vcpus {
            // Clamp instead of failing; the caller tolerates partial
            // growth and the cgroup layer still gets updated.
            warn!(
                requested,
                current,
                max = self.config.default_max_vcpus,
                "clamping vCPU hotplug to the remaining budget"
            );
            amount = self.config.default_max_vcpus - current;
        }
        if amount == 0 {
            warn!(
                max = self.config.default_max_vcpus,
                "maximum number of vCPUs already reached"
            );
            return Ok(0);
        }

        let candidates = self.qmp_mut()?.query_hotpluggable_cpus()?;
        let machine = self.arch.machine()?;
        // These machines manage CPU topology themselves and reject
        // explicit socket/die/thread ids.
        let bare_topology = matches!(machine.mtype, "pseries" | "s390-ccw-virtio");

        let mut added = 0;
        for candidate in candidates {
            // A non-empty qom-path means the slot is occupied.
            if candidate.qom_path.as_deref().is_some_and(|p| !p.is_empty()) {
                continue;
            }
            let cpu_id = format!("cpu-{}", self.state.hotplugged_vcpus.len());
            let (socket_id, die_id, thread_id) = if bare_topology {
                (None, None, None)
            } else {
                (candidate.socket_id, candidate.die_id, candidate.thread_id)
            };
            if let Err(err) = self.qmp_mut()?.cpu_device_add(
                &candidate.driver,
                &cpu_id,
                socket_id,
                die_id,
                candidate.core_id,
                thread_id,
            ) {
                // Try the next candidate slot.
                debug!(cpu = %cpu_id, %err, "vCPU candidate rejected");
                continue;
            }
            self.state.hotplugged_vcpus.push(cpu_id);
            added += 1;
            if added == amount {
                self.store_state()?;
                return Ok(amount);
            }
        }

        // Partial success: the state already reflects what landed.
        if let Err(err) = self.store_state() {
            error!(%err, added, "could not persist state after partial vCPU hotplug");
        }
        Err(eyre!(
            "failed to hot add vCPUs: only {added} of {amount} were added"
        ))
    }

    fn hotplug_remove_cpus(&mut self, amount: u32) -> Result<u32> {
        let present = self.state.hotplugged_vcpus.len() as u32;
        if amount > present {
            bail!("unable to remove {amount} vCPUs, only {present} are hot-plugged");
        }

        for removed in 0..amount {
            let Some(cpu_id) = self.state.hotplugged_vcpus.last().cloned() else {
                break;
            };
            if let Err(err) = self.qmp_mut()?.device_del(&cpu_id) {
                let _ = self.store_state();
                return Err(eyre!(
                    "failed to hot unplug vCPUs, only {removed} were removed: {err}"
                ));
            }
            self.state.hotplugged_vcpus.pop();
        }
        self.store_state()?;
        Ok(amount)
    }

    // -- memory ---------------------------------------------------------------

    fn hotplug_add_memory(&mut self, dev: &mut MemoryDevice) -> Result<u32> {
        if !self.arch.supports_guest_memory_hotplug() {
            bail!("guest memory hotplug not supported on this machine type");
        }
        if dev.size_mib == 0 {
            debug!("memory hotplug not required");
            return Ok(0);
        }

        let current = self.config.memory_size_mib + self.state.hotplugged_memory_mib;
        let host_mib = crate::config::host_memory_mib()?;
        if u64::from(current) + u64::from(dev.size_mib) > host_mib {
            bail!(
                "unable to hotplug {} MiB memory, the VM has {current} MiB and the maximum is {host_mib} MiB",
                dev.size_mib
            );
        }

        let records = self.qmp_mut()?.query_memory_devices()?;
        dev.slot = records.iter().map(|r| r.slot).max().map_or(0, |max| max + 1);

        let mut share = self.launch.knobs.mem_shared;
        let backend_path;
        let backend = if self.launch.knobs.huge_pages {
            share = true;
            backend_path = camino::Utf8PathBuf::from("/dev/hugepages");
            MemoryBackend::File(&backend_path)
        } else if self.config.shared_fs == SharedFs::VirtioFs
            || self.config.file_backed_mem_root_dir.is_some()
        {
            backend_path = self
                .launch
                .memory
                .path
                .clone()
                .unwrap_or_else(|| camino::Utf8PathBuf::from("/dev/shm"));
            MemoryBackend::File(&backend_path)
        } else {
            MemoryBackend::Ram
        };

        let backend_id = format!("mem{}", dev.slot);
        self.qmp_mut()?
            .hotplug_memory(backend, &backend_id, dev.size_mib, share)?;

        if dev.probe {
            // Guests without the ACPI hotplug interrupt need the device
            // address to poke the probe interface.
            let records = self.qmp_mut()?.query_memory_devices()?;
            let last = records
                .last()
                .ok_or_else(|| eyre!("no memory device found after hotplug"))?;
            debug!(addr = format_args!("{:#x}", last.addr), "hot-added memory device");
            dev.addr = last.addr;
        }

        self.state.hotplugged_memory_mib += dev.size_mib;
        self.store_state()?;
        Ok(dev.size_mib)
    }

    fn hotplug_remove_memory(&mut self, dev: &mut MemoryDevice) -> Result<u32> {
        warn!(size_mib = dev.size_mib, "hot-remove of VM memory is not supported");
        Ok(0)
    }

    fn release_bridge_slot(&mut self, device_id: &str) {
        if let Err(err) = self.arch.remove_device_from_bridge(device_id) {
            warn!(device = device_id, %err, "could not release bridge slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scsi_id_lun_derivation() {
        assert_eq!(scsi_id_lun(0).unwrap(), (0, 0));
        assert_eq!(scsi_id_lun(255).unwrap(), (0, 255));
        assert_eq!(scsi_id_lun(256).unwrap(), (1, 0));
        assert_eq!(scsi_id_lun(65535).unwrap(), (255, 255));
        assert!(scsi_id_lun(65536).is_err());
    }
}
