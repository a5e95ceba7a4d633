//! QMP control session.
//!
//! One session per VM, strictly request/response: the controller
//! serializes all mutating operations, so there is never more than one
//! in-flight command. Wire framing and typing come from the `qapi`
//! crate; everything here is a thin wrapper that translates between the
//! controller's device model and the QAPI structs.

use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use qapi::qmp;
use qapi_spec::Dictionary;
use tracing::{debug, warn};

/// Connection retry interval during VM startup.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Per-read timeout while negotiating. QEMU may accept the connection
/// before its monitor is ready to talk; a bounded read keeps the retry
/// loop moving instead of blocking forever on a half-up socket.
const NEGOTIATE_READ_TIMEOUT: Duration = Duration::from_millis(250);

type QmpStream = qapi::Qmp<qapi::Stream<BufReader<UnixStream>, UnixStream>>;

/// A hot-pluggable CPU slot reported by the guest.
#[derive(Debug, Clone)]
pub struct HotpluggableCpu {
    /// QOM type to pass as the `device_add` driver.
    pub driver: String,
    /// Non-empty when the slot is already occupied.
    pub qom_path: Option<String>,
    pub socket_id: Option<i64>,
    pub die_id: Option<i64>,
    pub core_id: Option<i64>,
    pub thread_id: Option<i64>,
}

/// A DIMM (or NVDIMM) the guest currently has plugged.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDeviceRecord {
    pub slot: i64,
    pub addr: u64,
}

/// An open, capability-negotiated QMP session.
///
/// Dropping the session closes the socket. Because all commands are
/// synchronous there is nothing in flight at drop time; ownership is the
/// disconnect barrier, so a fresh [`QmpSession::open`] may follow
/// immediately.
pub struct QmpSession {
    qmp: QmpStream,
}

impl QmpSession {
    /// Connect and negotiate capabilities, retrying until `deadline`.
    /// Transport failures during this window are expected (the VM is
    /// still coming up) and retried at a fixed interval.
    pub fn open(socket: &Utf8Path, deadline: Instant) -> Result<Self> {
        let mut last_err = None;
        loop {
            match Self::try_open(socket) {
                Ok(session) => return Ok(session),
                Err(err) => last_err = Some(err),
            }
            if Instant::now() >= deadline {
                return Err(eyre!(
                    "timed out connecting to QMP socket {socket}: {}",
                    last_err.map(|e| e.to_string()).unwrap_or_default()
                ));
            }
            std::thread::sleep(CONNECT_RETRY_INTERVAL);
        }
    }

    /// Single connect attempt with immediate capability negotiation.
    pub fn connect(socket: &Utf8Path) -> Result<Self> {
        Self::try_open(socket)
    }

    fn try_open(socket: &Utf8Path) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .with_context(|| format!("connecting to QMP socket {socket}"))?;
        stream.set_read_timeout(Some(NEGOTIATE_READ_TIMEOUT))?;

        let mut qmp = qapi::Qmp::new(qapi::Stream::new(
            BufReader::new(stream.try_clone()?),
            stream.try_clone()?,
        ));
        let info = qmp
            .handshake()
            .with_context(|| format!("negotiating QMP capabilities on {socket}"))?;
        debug!(greeting = ?info, "QMP session ready");

        // Commands from here on run unbounded; the flows above this layer
        // carry their own deadlines.
        stream.set_read_timeout(None)?;
        Ok(Self { qmp })
    }

    /// Terminate the session. Consuming `self` is the disconnect barrier:
    /// no callback can still reference the socket once this returns.
    pub fn close(self) {
        drop(self);
    }

    fn execute<C: qapi_spec::Command>(&mut self, cmd: &C) -> Result<C::Ok> {
        self.qmp
            .execute(cmd)
            .map_err(|e| eyre!("QMP {} failed: {e}", C::NAME))
    }

    // -- generic device plumbing --------------------------------------

    pub fn device_add(
        &mut self,
        driver: &str,
        id: &str,
        bus: Option<&str>,
        arguments: Dictionary,
    ) -> Result<()> {
        self.execute(&qmp::device_add {
            driver: driver.to_string(),
            id: Some(id.to_string()),
            bus: bus.map(str::to_string),
            arguments,
        })?;
        Ok(())
    }

    pub fn device_del(&mut self, id: &str) -> Result<()> {
        self.execute(&qmp::device_del { id: id.to_string() })?;
        Ok(())
    }

    // -- block ---------------------------------------------------------

    pub fn blockdev_add(&mut self, file: &Utf8Path, node_name: &str) -> Result<()> {
        self.blockdev_add_opts(file, node_name, None)
    }

    pub fn blockdev_add_with_cache(
        &mut self,
        file: &Utf8Path,
        node_name: &str,
        direct: bool,
        no_flush: bool,
    ) -> Result<()> {
        let cache = qmp::BlockdevCacheOptions {
            direct: Some(direct),
            no_flush: Some(no_flush),
        };
        self.blockdev_add_opts(file, node_name, Some(cache))
    }

    fn blockdev_add_opts(
        &mut self,
        file: &Utf8Path,
        node_name: &str,
        cache: Option<qmp::BlockdevCacheOptions>,
    ) -> Result<()> {
        self.execute(&qmp::blockdev_add(qmp::BlockdevOptions::raw {
            base: qmp::BlockdevOptionsBase {
                node_name: Some(node_name.to_string()),
                cache,
                auto_read_only: None,
                detect_zeroes: None,
                discard: None,
                force_share: None,
                read_only: None,
            },
            raw: qmp::BlockdevOptionsRaw {
                base: qmp::BlockdevOptionsGenericFormat {
                    file: qmp::BlockdevRef::definition(Box::new(qmp::BlockdevOptions::file {
                        base: qmp::BlockdevOptionsBase {
                            node_name: None,
                            cache: None,
                            auto_read_only: None,
                            detect_zeroes: None,
                            discard: None,
                            force_share: None,
                            read_only: None,
                        },
                        file: qmp::BlockdevOptionsFile {
                            filename: file.to_string(),
                            aio: None,
                            aio_max_batch: None,
                            drop_cache: None,
                            locking: None,
                            pr_manager: None,
                            x_check_cache_dropped: None,
                        },
                    })),
                },
                offset: None,
                size: None,
            },
        }))?;
        Ok(())
    }

    pub fn blockdev_del(&mut self, node_name: &str) -> Result<()> {
        self.execute(&qmp::blockdev_del {
            node_name: node_name.to_string(),
        })?;
        Ok(())
    }

    /// Map a file into the guest as an NVDIMM: file backend first, then
    /// the nvdimm device referencing it.
    pub fn nvdimm_add(&mut self, id: &str, file: &Utf8Path, size: u64) -> Result<()> {
        let backend_id = format!("nvdimm-{id}");
        self.execute(&qmp::object_add(qmp::ObjectOptions::memory_backend_file {
            id: backend_id.clone(),
            memory_backend_file: qmp::MemoryBackendFileProperties {
                base: memory_backend_properties(size, Some(true)),
                align: None,
                discard_data: None,
                offset: None,
                mem_path: file.to_string(),
                pmem: None,
                readonly: None,
            },
        }))?;

        let mut args = Dictionary::new();
        args.insert("memdev".to_string(), backend_id.clone().into());
        if let Err(err) = self.device_add("nvdimm", id, None, args) {
            if let Err(del_err) = self.execute(&qmp::object_del { id: backend_id }) {
                warn!(%del_err, "could not roll back nvdimm backend");
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn scsi_device_add(
        &mut self,
        blockdev_id: &str,
        dev_id: &str,
        bus: &str,
        scsi_id: u32,
        lun: u32,
    ) -> Result<()> {
        let mut args = Dictionary::new();
        args.insert("drive".to_string(), blockdev_id.to_string().into());
        args.insert("scsi-id".to_string(), i64::from(scsi_id).into());
        args.insert("lun".to_string(), i64::from(lun).into());
        self.device_add("scsi-hd", dev_id, Some(bus), args)
    }

    /// Plug a virtio-blk device into a PCI bridge slot.
    pub fn pci_device_add(
        &mut self,
        blockdev_id: &str,
        dev_id: &str,
        addr: &str,
        bus: &str,
    ) -> Result<()> {
        let mut args = Dictionary::new();
        args.insert("drive".to_string(), blockdev_id.to_string().into());
        args.insert("addr".to_string(), addr.to_string().into());
        self.device_add("virtio-blk-pci", dev_id, Some(bus), args)
    }

    /// Plug a virtio-blk device at a CCW device number.
    pub fn ccw_device_add(&mut self, blockdev_id: &str, dev_id: &str, devno: &str) -> Result<()> {
        let mut args = Dictionary::new();
        args.insert("drive".to_string(), blockdev_id.to_string().into());
        args.insert("devno".to_string(), devno.to_string().into());
        self.device_add("virtio-blk-ccw", dev_id, None, args)
    }

    // -- VFIO ----------------------------------------------------------

    /// VFIO passthrough on the root bus.
    pub fn vfio_device_add(&mut self, dev_id: &str, bdf: &str) -> Result<()> {
        let mut args = Dictionary::new();
        args.insert("host".to_string(), bdf.to_string().into());
        self.device_add("vfio-pci", dev_id, None, args)
    }

    /// VFIO passthrough on a bridge slot.
    pub fn pci_vfio_device_add(&mut self, dev_id: &str, bdf: &str, addr: &str, bus: &str) -> Result<()> {
        let mut args = Dictionary::new();
        args.insert("host".to_string(), bdf.to_string().into());
        args.insert("addr".to_string(), addr.to_string().into());
        self.device_add("vfio-pci", dev_id, Some(bus), args)
    }

    /// Mediated VFIO device; `addr`/`bus` empty means root bus.
    pub fn pci_vfio_mediated_add(
        &mut self,
        dev_id: &str,
        sysfs_dev: &Utf8Path,
        addr: Option<&str>,
        bus: Option<&str>,
    ) -> Result<()> {
        let mut args = Dictionary::new();
        args.insert("sysfsdev".to_string(), sysfs_dev.to_string().into());
        if let Some(addr) = addr {
            args.insert("addr".to_string(), addr.to_string().into());
        }
        self.device_add("vfio-pci", dev_id, bus, args)
    }

    // -- network -------------------------------------------------------

    /// Create a tap netdev referencing fds previously transferred with
    /// [`QmpSession::getfd`].
    pub fn netdev_add_by_fds(
        &mut self,
        id: &str,
        fd_names: &[String],
        vhost_fd_names: &[String],
    ) -> Result<()> {
        let vhost = !vhost_fd_names.is_empty();
        self.execute(&qmp::netdev_add(qmp::Netdev::tap {
            id: id.to_string(),
            tap: qmp::NetdevTapOptions {
                fds: Some(fd_names.join(":")),
                vhost: vhost.then_some(true),
                vhostfds: vhost.then(|| vhost_fd_names.join(":")),
                br: None,
                downscript: None,
                fd: None,
                helper: None,
                ifname: None,
                poll_us: None,
                queues: None,
                script: None,
                sndbuf: None,
                vhostfd: None,
                vhostforce: None,
                vnet_hdr: None,
            },
        }))?;
        Ok(())
    }

    pub fn netdev_del(&mut self, id: &str) -> Result<()> {
        self.execute(&qmp::netdev_del { id: id.to_string() })?;
        Ok(())
    }

    pub fn net_pci_device_add(
        &mut self,
        netdev_id: &str,
        dev_id: &str,
        mac: &str,
        addr: &str,
        bus: &str,
        queues: u32,
    ) -> Result<()> {
        let mut args = Dictionary::new();
        args.insert("netdev".to_string(), netdev_id.to_string().into());
        args.insert("mac".to_string(), mac.to_string().into());
        args.insert("addr".to_string(), addr.to_string().into());
        if queues > 0 {
            // One vector per queue pair plus config and control.
            args.insert("mq".to_string(), "on".to_string().into());
            args.insert("vectors".to_string(), i64::from(2 * queues + 2).into());
        }
        self.device_add("virtio-net-pci", dev_id, Some(bus), args)
    }

    pub fn net_ccw_device_add(
        &mut self,
        netdev_id: &str,
        dev_id: &str,
        mac: &str,
        devno: &str,
    ) -> Result<()> {
        let mut args = Dictionary::new();
        args.insert("netdev".to_string(), netdev_id.to_string().into());
        args.insert("mac".to_string(), mac.to_string().into());
        args.insert("devno".to_string(), devno.to_string().into());
        self.device_add("virtio-net-ccw", dev_id, None, args)
    }

    /// Transfer a file descriptor into QEMU under `name`. Ownership moves
    /// to QEMU on success; the local copy must be closed by the caller.
    pub fn getfd(&mut self, name: &str, fd: std::os::fd::RawFd) -> Result<()> {
        self.qmp
            .execute_with_fds(
                &qmp::getfd {
                    fdname: name.to_string(),
                },
                &[fd],
            )
            .map_err(|e| eyre!("QMP getfd({name}) failed: {e}"))?;
        Ok(())
    }

    // -- CPU and memory -------------------------------------------------

    pub fn query_hotpluggable_cpus(&mut self) -> Result<Vec<HotpluggableCpu>> {
        let cpus = self.execute(&qmp::query_hotpluggable_cpus {})?;
        Ok(cpus
            .into_iter()
            .map(|cpu| HotpluggableCpu {
                driver: cpu.type_,
                qom_path: cpu.qom_path,
                socket_id: cpu.props.socket_id,
                die_id: cpu.props.die_id,
                core_id: cpu.props.core_id,
                thread_id: cpu.props.thread_id,
            })
            .collect())
    }

    /// Hot-add one vCPU. Topology ids are optional because some machines
    /// (`pseries`, `s390-ccw-virtio`) refuse them.
    pub fn cpu_device_add(
        &mut self,
        driver: &str,
        cpu_id: &str,
        socket_id: Option<i64>,
        die_id: Option<i64>,
        core_id: Option<i64>,
        thread_id: Option<i64>,
    ) -> Result<()> {
        let mut args = Dictionary::new();
        if let Some(socket_id) = socket_id {
            args.insert("socket-id".to_string(), socket_id.into());
        }
        if let Some(die_id) = die_id {
            args.insert("die-id".to_string(), die_id.into());
        }
        if let Some(core_id) = core_id {
            args.insert("core-id".to_string(), core_id.into());
        }
        if let Some(thread_id) = thread_id {
            args.insert("thread-id".to_string(), thread_id.into());
        }
        self.device_add(driver, cpu_id, None, args)
    }

    pub fn query_memory_devices(&mut self) -> Result<Vec<MemoryDeviceRecord>> {
        let devices = self.execute(&qmp::query_memory_devices {})?;
        Ok(devices
            .into_iter()
            .filter_map(|device| match device {
                qmp::MemoryDeviceInfo::dimm(info) => Some(MemoryDeviceRecord {
                    slot: info.data.slot,
                    addr: info.data.addr as u64,
                }),
                qmp::MemoryDeviceInfo::nvdimm(info) => Some(MemoryDeviceRecord {
                    slot: info.data.slot,
                    addr: info.data.addr as u64,
                }),
                _ => None,
            })
            .collect())
    }

    /// Hot-add a DIMM: memory backend first, then the pc-dimm device.
    /// The backend is rolled back when the device add fails.
    pub fn hotplug_memory(
        &mut self,
        backend: MemoryBackend<'_>,
        id: &str,
        size_mib: u32,
        share: bool,
    ) -> Result<()> {
        let size = u64::from(size_mib) << 20;
        let share = share.then_some(true);
        let options = match backend {
            MemoryBackend::File(path) => qmp::ObjectOptions::memory_backend_file {
                id: id.to_string(),
                memory_backend_file: qmp::MemoryBackendFileProperties {
                    base: memory_backend_properties(size, share),
                    align: None,
                    discard_data: None,
                    offset: None,
                    mem_path: path.to_string(),
                    pmem: None,
                    readonly: None,
                },
            },
            MemoryBackend::Ram => qmp::ObjectOptions::memory_backend_ram {
                id: id.to_string(),
                memory_backend_ram: memory_backend_properties(size, share),
            },
        };
        self.execute(&qmp::object_add(options))?;

        let mut args = Dictionary::new();
        args.insert("memdev".to_string(), id.to_string().into());
        if let Err(err) = self.device_add("pc-dimm", &format!("dimm-{id}"), None, args) {
            if let Err(del_err) = self.execute(&qmp::object_del { id: id.to_string() }) {
                warn!(%del_err, "could not roll back memory backend");
            }
            return Err(err);
        }
        Ok(())
    }

    // -- lifecycle ------------------------------------------------------

    pub fn query_status(&mut self) -> Result<qmp::RunState> {
        let status = self.execute(&qmp::query_status {})?;
        Ok(status.status)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.execute(&qmp::stop {})?;
        Ok(())
    }

    pub fn cont(&mut self) -> Result<()> {
        self.execute(&qmp::cont {})?;
        Ok(())
    }

    pub fn quit(&mut self) -> Result<()> {
        self.execute(&qmp::quit {})?;
        Ok(())
    }

    // -- migration ------------------------------------------------------

    pub fn set_migration_caps(
        &mut self,
        caps: &[(qmp::MigrationCapability, bool)],
    ) -> Result<()> {
        self.execute(&qmp::migrate_set_capabilities {
            capabilities: caps
                .iter()
                .map(|(capability, state)| qmp::MigrationCapabilityStatus {
                    capability: *capability,
                    state: *state,
                })
                .collect(),
        })?;
        Ok(())
    }

    /// Start an outgoing migration, e.g. `exec:cat ><path>` for a
    /// template snapshot.
    pub fn migrate(&mut self, uri: &str) -> Result<()> {
        self.execute(&qmp::migrate {
            uri: uri.to_string(),
            blk: None,
            detach: None,
            inc: None,
            resume: None,
        })?;
        Ok(())
    }

    pub fn migrate_incoming(&mut self, uri: &str) -> Result<()> {
        self.execute(&qmp::migrate_incoming {
            uri: uri.to_string(),
        })?;
        Ok(())
    }

    pub fn query_migration(&mut self) -> Result<Option<qmp::MigrationStatus>> {
        let info = self.execute(&qmp::query_migrate {})?;
        Ok(info.status)
    }
}

/// Memory backend flavor for hot-added DIMMs.
#[derive(Debug, Clone, Copy)]
pub enum MemoryBackend<'a> {
    File(&'a Utf8Path),
    Ram,
}

fn memory_backend_properties(size: u64, share: Option<bool>) -> qmp::MemoryBackendProperties {
    qmp::MemoryBackendProperties {
        size,
        share,
        dump: None,
        host_nodes: None,
        merge: None,
        policy: None,
        prealloc: None,
        prealloc_context: None,
        prealloc_threads: None,
        reserve: None,
        x_use_canonical_path_for_ramblock_id: None,
    }
}
