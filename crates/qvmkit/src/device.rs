//! Typed descriptors for every device the controller can attach.
//!
//! Two families live here. [`Device`] is what the orchestrator hands to
//! `add_device`/`hotplug_*`: descriptors carrying host resources (paths,
//! file descriptors) plus the fields the controller fills back in
//! (guest addresses, derived ids). [`LaunchDevice`] is the accumulator
//! element of the static launch configuration, rendered to argv by
//! [`crate::cmdline`].

use std::os::fd::OwnedFd;

use camino::Utf8PathBuf;
use uuid::Uuid;

use crate::bridge::BusType;

/// QEMU rejects device ids longer than this.
pub(crate) const MAX_DEV_ID_LEN: usize = 31;

pub(crate) fn truncate_id(id: &str) -> String {
    if id.len() > MAX_DEV_ID_LEN {
        id[..MAX_DEV_ID_LEN].to_string()
    } else {
        id.to_string()
    }
}

/// `<prefix>-<16 random hex chars>`, truncated to the QEMU id limit.
pub(crate) fn make_name_id(prefix: &str) -> String {
    let rand = Uuid::new_v4().simple().to_string();
    truncate_id(&format!("{prefix}-{}", &rand[..16]))
}

/// A block drive, either part of the boot configuration or hot-plugged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDrive {
    /// User-facing drive id; the guest device id derives from it.
    pub id: String,
    pub file: Utf8PathBuf,
    /// Image format, e.g. `raw`.
    pub format: String,
    /// Attach order; used to derive the SCSI id and LUN.
    pub index: u32,
    pub read_only: bool,
    /// Guest PCI address (`<bridge>/<slot>`), recorded by a successful
    /// virtio-blk hotplug.
    pub pci_addr: Option<String>,
    /// Guest CCW device number, recorded by a successful virtio-blk-ccw
    /// hotplug.
    pub ccw_devno: Option<String>,
    /// NVDIMM ordinal, recorded when the drive is mapped as an NVDIMM.
    pub nvdimm_id: Option<String>,
}

impl BlockDrive {
    /// The id `device_add` uses for the guest-visible device.
    pub fn device_id(&self) -> String {
        format!("virtio-{}", self.id)
    }
}

/// VFIO passthrough flavor: a regular PCI function or a mediated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VfioKind {
    /// Host Bus/Device/Function, e.g. `0000:3a:00.1`.
    Normal { bdf: String },
    /// Sysfs path of a mediated device.
    Mediated { sysfs_dev: Utf8PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfioDevice {
    pub id: String,
    pub kind: VfioKind,
}

/// Host/guest socket device. The vhost fd is owned here and its ownership
/// moves to QEMU when the VM is launched.
#[derive(Debug)]
pub struct VsockDevice {
    pub context_id: u64,
    pub vhost_fd: OwnedFd,
}

/// A tap device plus the fds the VMM uses to reach it.
#[derive(Debug, Default)]
pub struct TapInterface {
    pub id: String,
    pub name: String,
    /// Guest MAC address.
    pub hard_addr: String,
    pub vm_fds: Vec<OwnedFd>,
    pub vhost_fds: Vec<OwnedFd>,
}

/// Network endpoint flavors the orchestrator can attach.
#[derive(Debug)]
pub enum Endpoint {
    /// veth pair bridged to a tap.
    Veth {
        tap: TapInterface,
        pci_addr: Option<String>,
    },
    /// Plain tap device.
    Tap {
        tap: TapInterface,
        pci_addr: Option<String>,
    },
    /// macvtap; attachable at boot only.
    Macvtap {
        tap: TapInterface,
        pci_addr: Option<String>,
    },
}

impl Endpoint {
    pub fn tap(&self) -> &TapInterface {
        match self {
            Endpoint::Veth { tap, .. }
            | Endpoint::Tap { tap, .. }
            | Endpoint::Macvtap { tap, .. } => tap,
        }
    }

    pub fn tap_mut(&mut self) -> &mut TapInterface {
        match self {
            Endpoint::Veth { tap, .. }
            | Endpoint::Tap { tap, .. }
            | Endpoint::Macvtap { tap, .. } => tap,
        }
    }

    pub fn set_pci_addr(&mut self, addr: String) {
        match self {
            Endpoint::Veth { pci_addr, .. }
            | Endpoint::Tap { pci_addr, .. }
            | Endpoint::Macvtap { pci_addr, .. } => *pci_addr = Some(addr),
        }
    }

    pub fn pci_addr(&self) -> Option<&str> {
        match self {
            Endpoint::Veth { pci_addr, .. }
            | Endpoint::Tap { pci_addr, .. }
            | Endpoint::Macvtap { pci_addr, .. } => pci_addr.as_deref(),
        }
    }

    /// Take the tap (and with it the owned fds) out of the endpoint.
    pub fn into_tap(self) -> TapInterface {
        match self {
            Endpoint::Veth { tap, .. }
            | Endpoint::Tap { tap, .. }
            | Endpoint::Macvtap { tap, .. } => tap,
        }
    }
}

/// A host directory exported to the guest over the shared filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub mount_tag: String,
    pub host_path: Utf8PathBuf,
}

/// A virtio-serial port backed by a unix socket on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPort {
    pub device_id: String,
    pub id: String,
    pub host_path: Utf8PathBuf,
    pub name: String,
}

/// vhost-user device attributes (currently only the fs flavor is built).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostUserFsDevice {
    pub dev_id: String,
    pub socket_path: Utf8PathBuf,
    pub tag: String,
    pub cache_size_mib: u32,
}

/// Memory to hot-add, and where it landed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryDevice {
    /// DIMM slot; assigned from the guest-reported maximum plus one.
    pub slot: i64,
    pub size_mib: u32,
    /// Guest physical address, filled in when `probe` is requested.
    pub addr: u64,
    /// Guest kernel lacks the ACPI hotplug interrupt and needs the
    /// address probed back.
    pub probe: bool,
}

/// Everything `add_device` accepts before launch.
#[derive(Debug)]
pub enum Device {
    Volume(Volume),
    SerialPort(SerialPort),
    Vsock(VsockDevice),
    Network(Endpoint),
    Block(BlockDrive),
    VhostUserFs(VhostUserFsDevice),
    Vfio(VfioDevice),
}

// ---------------------------------------------------------------------------
// Launch configuration elements.

/// Console/serial driver flavors used by the launch devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharDriver {
    /// `virtconsole` attached to the virtio-serial bus.
    Console,
    /// `virtserialport` attached to the virtio-serial bus.
    SerialPort,
}

/// One element of the static device list passed to QEMU.
#[derive(Debug)]
pub enum LaunchDevice {
    /// PCI/PCIe bridge; must precede everything that plugs into it.
    Bridge {
        bus: BusType,
        id: String,
        /// Root bus the bridge itself sits on.
        root_bus: &'static str,
        chassis: u32,
        addr: u32,
    },
    /// virtio-serial controller.
    SerialController { id: String, disable_modern: bool },
    /// Socket-backed character device plus its virtio device half.
    Char {
        driver: CharDriver,
        device_id: String,
        id: String,
        path: Utf8PathBuf,
        name: Option<String>,
    },
    /// 9p export.
    NinePFs {
        id: String,
        path: Utf8PathBuf,
        mount_tag: String,
        disable_modern: bool,
    },
    Vsock {
        id: String,
        context_id: u64,
        vhost_fd_num: i32,
        disable_modern: bool,
    },
    Net {
        id: String,
        ifname: String,
        mac: String,
        vhost: bool,
        fd_nums: Vec<i32>,
        vhost_fd_nums: Vec<i32>,
        disable_modern: bool,
    },
    Block {
        id: String,
        file: Utf8PathBuf,
        format: String,
        read_only: bool,
        disable_modern: bool,
    },
    ScsiController {
        id: String,
        io_thread: Option<String>,
        disable_modern: bool,
    },
    VhostUserFs {
        char_id: String,
        dev_id: String,
        socket_path: Utf8PathBuf,
        tag: String,
        cache_size_mib: u32,
    },
    Vfio { bdf: String },
    Rng { id: String, filename: Utf8PathBuf },
    /// Root image mapped as a read-only NVDIMM (x86 only).
    NvdimmImage {
        id: String,
        memdev_id: String,
        file: Utf8PathBuf,
        size: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_id() {
        let long = "a".repeat(40);
        assert_eq!(truncate_id(&long).len(), MAX_DEV_ID_LEN);
        assert_eq!(truncate_id("short"), "short");
    }

    #[test]
    fn test_make_name_id_shape() {
        let id = make_name_id("image");
        assert!(id.starts_with("image-"));
        assert!(id.len() <= MAX_DEV_ID_LEN);
        assert_ne!(make_name_id("image"), id);
    }

    #[test]
    fn test_block_drive_device_id() {
        let drive = BlockDrive {
            id: "drive-0".into(),
            ..Default::default()
        };
        assert_eq!(drive.device_id(), "virtio-drive-0");
    }
}
