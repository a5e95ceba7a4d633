//! The controller façade.
//!
//! One [`Controller`] drives one QEMU instance. The orchestrator above
//! it issues coarse lifecycle calls; everything below happens over QMP
//! and the virtiofsd supervisor. A single coarse mutex serializes all
//! mutating operations, so observers always see post-flow topology.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{bail, eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arch::{new_arch, ArchOps, Capabilities};
use crate::cmdline::{build_launch_spec, LaunchSpec, Smp};
use crate::config::{HypervisorConfig, SharedFs};
use crate::device::{make_name_id, Device, MemoryDevice, VhostUserFsDevice};
use crate::hotplug::{HotplugDevice, HotplugResult, Op};
use crate::qmp::QmpSession;
use crate::state::{ControllerState, StateStore};

/// Controller-internal state; every field is reachable by the flow
/// modules (`launch`, `hotplug`) through `pub(crate)` access.
pub(crate) struct ControllerInner {
    pub(crate) id: String,
    pub(crate) config: HypervisorConfig,
    pub(crate) arch: Box<dyn ArchOps>,
    pub(crate) state: ControllerState,
    pub(crate) store: StateStore,
    pub(crate) launch: LaunchSpec,
    pub(crate) qmp: Option<QmpSession>,
    /// Fds QEMU inherits at launch; closed once the process runs.
    pub(crate) staged_fds: Vec<OwnedFd>,
    pub(crate) stopped: bool,
}

/// Public handle of one sandbox VM.
pub struct Controller {
    inner: Arc<Mutex<ControllerInner>>,
}

/// Cross-process handoff blob: enough to reattach to a live VM, nothing
/// more. Everything else is rebuilt from the hypervisor config.
#[derive(Debug, Serialize, Deserialize)]
struct WireController {
    id: String,
    qmp_socket: Utf8PathBuf,
    state: ControllerState,
    nvdimm_count: u32,
    smp: Smp,
}

impl Controller {
    /// Create the sandbox: validate the configuration, restore or
    /// initialize persistent state, and assemble the launch
    /// specification. No process is spawned yet.
    pub fn create_sandbox(id: &str, config: HypervisorConfig) -> Result<Self> {
        if id.is_empty() {
            bail!("sandbox id must not be empty");
        }
        config.validate()?;

        let mut arch = new_arch(&config);
        let store = StateStore::new(config.run_store_path.clone());

        let mut state = match store.load(id)? {
            Some(saved) => {
                debug!(sandbox = id, "restoring controller state");
                arch.set_bridges(saved.bridges.clone());
                saved
            }
            None => {
                debug!(sandbox = id, "creating bridges and UUID");
                arch.create_bridges(config.default_bridges);
                let state = ControllerState {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    hotplug_vfio_on_root_bus: config.hotplug_vfio_on_root_bus,
                    nvdimm_count: u32::from(
                        config.initrd_path.is_none() && config.image_path.is_some(),
                    ),
                    ..Default::default()
                };
                std::fs::create_dir_all(config.vm_dir(id))
                    .with_context(|| format!("creating VM directory for {id}"))?;
                store.save(id, &state)?;
                state
            }
        };

        let nested = running_on_vmm(Utf8Path::new("/proc/cpuinfo")).unwrap_or(false);
        if !config.disable_nesting_checks && nested {
            arch.enable_nesting_checks();
        } else {
            debug!(inside_vm = nested, "nesting environment checks disabled");
            arch.disable_nesting_checks();
        }
        if !config.disable_vhost_net {
            arch.enable_vhost_net();
        } else {
            debug!("vhost_net disabled");
            arch.disable_vhost_net();
        }

        let launch = build_launch_spec(id, &state.uuid, &config, arch.as_mut())?;
        // Bridge addresses were assigned while rendering; keep the
        // persisted copy in sync.
        state.bridges = arch.bridges().to_vec();
        store.save(id, &state)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(ControllerInner {
                id: id.to_string(),
                config,
                arch,
                state,
                store,
                launch,
                qmp: None,
                staged_fds: Vec::new(),
                stopped: false,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Callback handed to the virtiofsd supervisor: its death stops the
    /// sandbox, asynchronously and at most once.
    fn virtiofsd_death_handler(&self) -> Box<dyn FnOnce() + Send> {
        let weak: Weak<Mutex<ControllerInner>> = Arc::downgrade(&self.inner);
        Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            warn!("virtiofsd died, stopping the VM");
            if let Err(err) = inner.stop_vm() {
                warn!(%err, "could not stop VM after virtiofsd death");
            }
        })
    }

    /// Boot the VM within `timeout`.
    pub fn start_sandbox(&self, timeout: Duration) -> Result<()> {
        let on_exit = self.virtiofsd_death_handler();
        self.lock().start_vm(timeout, on_exit)
    }

    /// Stop the VM and clean the runtime directory. Safe to call twice;
    /// the second call is a no-op.
    pub fn stop_sandbox(&self) -> Result<()> {
        self.lock().stop_vm()
    }

    pub fn pause_sandbox(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_qmp()?;
        inner.qmp_mut()?.stop()
    }

    pub fn resume_sandbox(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_qmp()?;
        inner.qmp_mut()?.cont()
    }

    /// Snapshot the running VM into the configured template location.
    pub fn save_sandbox(&self) -> Result<()> {
        self.lock().save_template()
    }

    /// Register a device in the static launch configuration. Only valid
    /// before [`Controller::start_sandbox`].
    pub fn add_device(&self, device: Device) -> Result<()> {
        self.lock().add_device_cold(device)
    }

    /// Live-add a device. The descriptor's output fields (guest address,
    /// derived ids) are filled in on success.
    pub fn hotplug_add_device(&self, device: &mut HotplugDevice) -> Result<HotplugResult> {
        self.lock().hotplug(device, Op::Add)
    }

    /// Live-remove a device previously added with
    /// [`Controller::hotplug_add_device`].
    pub fn hotplug_remove_device(&self, device: &mut HotplugDevice) -> Result<HotplugResult> {
        self.lock().hotplug(device, Op::Remove)
    }

    /// Grow or shrink toward `requested` vCPUs. Returns the totals
    /// before and after.
    pub fn resize_vcpus(&self, requested: u32) -> Result<(u32, u32)> {
        self.lock().resize_vcpus(requested)
    }

    /// Move the VM toward `requested_mib` of memory. Growth happens via
    /// DIMM hotplug; shrinking is left to the balloon and only logged
    /// here. Returns the resulting total plus the hotplug record.
    pub fn resize_memory(
        &self,
        requested_mib: u32,
        block_mib: u32,
        probe: bool,
    ) -> Result<(u32, MemoryDevice)> {
        self.lock().resize_memory(requested_mib, block_mib, probe)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.lock().arch.capabilities()
    }

    /// Host PIDs belonging to this sandbox: QEMU first, then virtiofsd
    /// when one is running.
    pub fn get_pids(&self) -> Vec<u32> {
        self.lock().get_pids()
    }

    /// Path of the guest console socket.
    pub fn sandbox_console(&self) -> Utf8PathBuf {
        let inner = self.lock();
        inner.config.console_socket(&inner.id)
    }

    /// Liveness probe: ask QEMU for its run state and reject the states
    /// a guest cannot recover from.
    pub fn check(&self) -> Result<()> {
        self.lock().check()
    }

    /// Release host-side resources without touching the VM.
    pub fn cleanup(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.close_staged_fds();
        Ok(())
    }

    /// Tear down the QMP session; it reopens lazily on the next call
    /// that needs it.
    pub fn disconnect(&self) {
        self.lock().qmp_shutdown();
    }

    /// Serialize the handoff blob and release live resources so another
    /// process can attach.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        inner.qmp_shutdown();
        inner.close_staged_fds();
        let blob = WireController {
            id: inner.id.clone(),
            qmp_socket: inner.launch.qmp_socket.clone(),
            state: inner.state.clone(),
            nvdimm_count: inner.state.nvdimm_count,
            smp: inner.launch.smp,
        };
        Ok(serde_json::to_vec(&blob)?)
    }

    /// Attach to a VM another process launched, from its handoff blob.
    pub fn from_wire(config: HypervisorConfig, blob: &[u8]) -> Result<Self> {
        let wire: WireController =
            serde_json::from_slice(blob).context("decoding controller handoff blob")?;

        let mut arch = new_arch(&config);
        arch.set_bridges(wire.state.bridges.clone());
        if !config.disable_vhost_net {
            arch.enable_vhost_net();
        }

        let store = StateStore::new(config.run_store_path.clone());
        let mut state = wire.state;
        state.nvdimm_count = wire.nvdimm_count;

        // Only the QMP path and the SMP descriptor survive the handoff;
        // the rest of the launch spec belongs to the process that ran
        // the launch. Memory knobs are re-derived so memory hotplug
        // picks the same backend the VM booted with.
        let mut launch = LaunchSpec {
            qmp_socket: wire.qmp_socket,
            smp: wire.smp,
            pid_file: config.pid_file(&wire.id),
            transport_suffix: arch.transport_suffix(),
            ..Default::default()
        };
        launch.knobs.huge_pages = config.huge_pages;
        if config.shared_fs == SharedFs::VirtioFs || config.file_backed_mem_root_dir.is_some() {
            launch.knobs.mem_shared = true;
            launch.memory.path = Some(
                config
                    .file_backed_mem_root_dir
                    .clone()
                    .unwrap_or_else(|| Utf8PathBuf::from("/dev/shm")),
            );
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(ControllerInner {
                id: wire.id,
                config,
                arch,
                state,
                store,
                launch,
                qmp: None,
                staged_fds: Vec::new(),
                stopped: false,
            })),
        })
    }
}

impl ControllerInner {
    /// Open the QMP session if none is cached. A single attempt: past
    /// startup the socket either answers or the VM is gone.
    pub(crate) fn ensure_qmp(&mut self) -> Result<()> {
        if self.qmp.is_none() {
            self.qmp = Some(QmpSession::connect(&self.launch.qmp_socket)?);
        }
        Ok(())
    }

    pub(crate) fn qmp_mut(&mut self) -> Result<&mut QmpSession> {
        self.qmp
            .as_mut()
            .ok_or_else(|| eyre!("QMP session is not open"))
    }

    pub(crate) fn qmp_shutdown(&mut self) {
        // Dropping the session is the disconnect barrier: commands are
        // synchronous, so nothing is in flight when the handle goes.
        if let Some(session) = self.qmp.take() {
            session.close();
        }
    }

    /// Persist the current state, bridges included.
    pub(crate) fn store_state(&mut self) -> Result<()> {
        self.state.bridges = self.arch.bridges().to_vec();
        self.store.save(&self.id, &self.state)
    }

    pub(crate) fn close_staged_fds(&mut self) {
        self.staged_fds.clear();
    }

    pub(crate) fn stop_vm(&mut self) -> Result<()> {
        info!(sandbox = %self.id, "stopping sandbox");
        if self.stopped {
            info!("sandbox already stopped");
            return Ok(());
        }

        if self.config.debug {
            self.dump_qemu_log();
        }

        let result = match QmpSession::connect(&self.launch.qmp_socket) {
            Ok(session) => {
                self.qmp_shutdown();
                self.qmp = Some(session);
                self.qmp_mut()?.quit().map_err(|err| {
                    warn!(%err, "QMP quit failed");
                    err
                })
            }
            // No monitor means no VM; stopping a dead sandbox succeeds.
            Err(err) => {
                debug!(%err, "QMP unreachable during stop, assuming VM is gone");
                Ok(())
            }
        };

        self.qmp_shutdown();
        self.cleanup_run_dir();
        self.stopped = true;
        result
    }

    fn dump_qemu_log(&self) {
        let Some(log_file) = &self.launch.log_file else {
            return;
        };
        match std::fs::read_to_string(log_file) {
            Ok(contents) => {
                for line in contents.lines() {
                    debug!(source = "qemu", "{line}");
                }
            }
            Err(err) => debug!(%err, "could not read qemu log"),
        }
    }

    /// Remove the runtime directory. When the path is a symlink (a
    /// template-cloned sandbox shares its VM directory that way), both
    /// the link and the resolved target go; an unrelated resolution
    /// failure only logs.
    fn cleanup_run_dir(&self) {
        let dir = self.config.vm_dir(&self.id);
        let resolved = match std::fs::canonicalize(dir.as_std_path()) {
            Ok(path) => Utf8PathBuf::from_path_buf(path).ok(),
            Err(err) => {
                warn!(%dir, %err, "failed to resolve VM directory");
                None
            }
        };
        info!(%dir, ?resolved, "cleaning up VM directory");
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            warn!(%dir, %err, "failed to remove VM directory");
        }
        if let Some(target) = resolved {
            if target != dir {
                if let Err(err) = std::fs::remove_dir_all(&target) {
                    warn!(%target, %err, "failed to remove resolved VM directory");
                }
            }
        }
    }

    pub(crate) fn save_template(&mut self) -> Result<()> {
        info!(sandbox = %self.id, "saving sandbox template");
        self.ensure_qmp()?;

        if self.config.boot_to_be_template {
            // The clones map the memory file themselves; keep it out of
            // the snapshot stream.
            let ControllerInner { arch, qmp, .. } = &mut *self;
            let session = qmp
                .as_mut()
                .ok_or_else(|| eyre!("QMP session vanished during template save"))?;
            arch.set_ignore_shared_memory_migration_caps(session)?;
        }

        let state_path = self
            .config
            .devices_state_path
            .as_ref()
            .ok_or_else(|| eyre!("saving a template requires a devices state path"))?;
        let uri = format!("exec:cat >{state_path}");
        self.qmp_mut()?.migrate(&uri)?;
        self.wait_migration()
    }

    pub(crate) fn add_device_cold(&mut self, device: Device) -> Result<()> {
        match device {
            Device::Volume(volume) => {
                if self.config.shared_fs == SharedFs::VirtioFs {
                    info!(volume_type = "virtio-fs", tag = %volume.mount_tag, "adding volume");
                    let dev = VhostUserFsDevice {
                        dev_id: make_name_id("vufs"),
                        socket_path: self.config.vhost_fs_socket(&self.id),
                        tag: volume.mount_tag,
                        cache_size_mib: self.config.virtio_fs_cache_size_mib,
                    };
                    self.arch
                        .append_vhost_user_fs(&mut self.launch.devices, &dev);
                } else {
                    info!(volume_type = "virtio-9p", tag = %volume.mount_tag, "adding volume");
                    self.arch.append_9p_volume(&mut self.launch.devices, &volume);
                }
            }
            Device::SerialPort(port) => {
                self.arch.append_serial_port(&mut self.launch.devices, &port);
            }
            Device::Vsock(vsock) => {
                self.arch.append_vsock(
                    &mut self.launch.devices,
                    vsock.context_id,
                    vsock.vhost_fd.as_raw_fd(),
                );
                self.staged_fds.push(vsock.vhost_fd);
            }
            Device::Network(endpoint) => {
                self.arch
                    .append_network(&mut self.launch.devices, &endpoint)?;
                let tap = endpoint.into_tap();
                self.staged_fds.extend(tap.vm_fds);
                self.staged_fds.extend(tap.vhost_fds);
            }
            Device::Block(drive) => {
                self.arch
                    .append_block_device(&mut self.launch.devices, &drive)?;
            }
            Device::VhostUserFs(dev) => {
                self.arch
                    .append_vhost_user_fs(&mut self.launch.devices, &dev);
            }
            Device::Vfio(dev) => {
                self.arch.append_vfio(&mut self.launch.devices, &dev);
            }
        }
        Ok(())
    }

    pub(crate) fn resize_vcpus(&mut self, requested: u32) -> Result<(u32, u32)> {
        let current = self.launch.smp.cpus + self.state.hotplugged_vcpus.len() as u32;
        let mut device;
        let new_total = if requested > current {
            device = HotplugDevice::Vcpus(requested - current);
            match self.hotplug(&mut device, Op::Add)? {
                HotplugResult::Vcpus(added) => current + added,
                other => bail!("unexpected vCPU hotplug result {other:?}"),
            }
        } else if requested < current {
            device = HotplugDevice::Vcpus(current - requested);
            match self.hotplug(&mut device, Op::Remove)? {
                HotplugResult::Vcpus(removed) => current - removed,
                other => bail!("unexpected vCPU hotplug result {other:?}"),
            }
        } else {
            current
        };
        Ok((current, new_total))
    }

    pub(crate) fn resize_memory(
        &mut self,
        requested_mib: u32,
        block_mib: u32,
        probe: bool,
    ) -> Result<(u32, MemoryDevice)> {
        let current = self.config.memory_size_mib + self.state.hotplugged_memory_mib;
        self.ensure_qmp()?;

        if requested_mib == current {
            return Ok((current, MemoryDevice::default()));
        }

        let delta = requested_mib.abs_diff(current);
        let aligned = align_memory_mib(delta, block_mib);
        let mut device = HotplugDevice::MemoryMib(MemoryDevice {
            size_mib: aligned,
            probe,
            ..Default::default()
        });

        let op = if requested_mib > current { Op::Add } else { Op::Remove };
        let result = self.hotplug(&mut device, op)?;
        let HotplugDevice::MemoryMib(record) = device else {
            unreachable!("memory resize dispatched a non-memory device");
        };
        let moved = match result {
            HotplugResult::MemoryMib(mib) => mib,
            other => bail!("unexpected memory hotplug result {other:?}"),
        };
        let new_total = match op {
            Op::Add => current + moved,
            Op::Remove => current - moved,
        };
        Ok((new_total, record))
    }

    pub(crate) fn check(&mut self) -> Result<()> {
        self.ensure_qmp()?;
        let status = self.qmp_mut()?.query_status()?;
        match status {
            qapi_qmp::RunState::internal_error => bail!("guest failure: internal-error"),
            qapi_qmp::RunState::guest_panicked => bail!("guest failure: guest-panicked"),
            _ => Ok(()),
        }
    }

    pub(crate) fn get_pids(&self) -> Vec<u32> {
        let contents = match std::fs::read_to_string(&self.launch.pid_file) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(%err, "could not read QEMU pid file");
                return vec![0];
            }
        };
        let pid = match contents.trim().parse::<u32>() {
            Ok(pid) => pid,
            Err(err) => {
                warn!(%err, "QEMU pid file does not hold a pid");
                return vec![0];
            }
        };
        let mut pids = vec![pid];
        if self.state.virtiofsd_pid != 0 {
            pids.push(self.state.virtiofsd_pid);
        }
        pids
    }
}

/// Round a memory delta up to the guest's hotplug block size.
fn align_memory_mib(size_mib: u32, block_mib: u32) -> u32 {
    if block_mib == 0 {
        return size_mib;
    }
    size_mib.div_ceil(block_mib) * block_mib
}

/// Whether the host itself runs under a hypervisor, per the CPU flags.
fn running_on_vmm(cpuinfo: &Utf8Path) -> Result<bool> {
    let contents = std::fs::read_to_string(cpuinfo)
        .with_context(|| format!("reading {cpuinfo}"))?;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() == "flags" {
            return Ok(value.split_whitespace().any(|flag| flag == "hypervisor"));
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_align_memory_mib() {
        assert_eq!(align_memory_mib(100, 0), 100);
        assert_eq!(align_memory_mib(100, 128), 128);
        assert_eq!(align_memory_mib(128, 128), 128);
        assert_eq!(align_memory_mib(129, 128), 256);
    }

    #[test]
    fn test_running_on_vmm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuinfo");

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "processor\t: 0").unwrap();
        writeln!(f, "flags\t\t: fpu vme de pse hypervisor ssse3").unwrap();
        drop(f);
        assert!(running_on_vmm(Utf8Path::from_path(&path).unwrap()).unwrap());

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "flags\t\t: fpu vme de pse ssse3").unwrap();
        drop(f);
        assert!(!running_on_vmm(Utf8Path::from_path(&path).unwrap()).unwrap());
    }

    #[test]
    fn test_wire_blob_round_trip() {
        let wire = WireController {
            id: "sb".to_string(),
            qmp_socket: "/run/qvm/vm/sb/qmp.sock".into(),
            state: ControllerState {
                uuid: "u".to_string(),
                nvdimm_count: 2,
                ..Default::default()
            },
            nvdimm_count: 2,
            smp: Smp {
                cpus: 2,
                cores: 1,
                threads: 1,
                sockets: 4,
                max_cpus: 4,
            },
        };
        let blob = serde_json::to_vec(&wire).unwrap();
        let back: WireController = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back.id, "sb");
        assert_eq!(back.smp, wire.smp);
        assert_eq!(back.state.uuid, "u");
    }
}
