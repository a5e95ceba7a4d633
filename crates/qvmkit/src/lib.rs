//! QEMU/KVM controller core for sandbox virtual machines.
//!
//! This crate drives a single QEMU instance per sandbox on behalf of a
//! container-runtime orchestrator: it composes the static launch
//! configuration, supervises the virtiofsd daemon, brings the VM up
//! through a bounded QMP handshake, and afterwards executes live
//! hot-plug and hot-unplug of block devices, network interfaces, VFIO
//! functions, vCPUs and memory while keeping an authoritative, persisted
//! model of the guest topology.
//!
//! # Features
//!
//! - **Launch assembly**: machine/CPU/memory topology, kernel command
//!   line, bridges, console, RNG and shared-fs devices, rendered into a
//!   QEMU argv
//! - **Hotplug with rollback**: every multi-step flow unwinds host and
//!   guest resources in reverse on a mid-path failure
//! - **Persistent state**: bridge slot maps and hot-plugged CPU/memory
//!   bookkeeping survive a controller restart
//! - **VM templating**: save a running VM to a snapshot and boot clones
//!   from it via incoming migration
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use qvmkit::{Controller, HypervisorConfig, SharedFs};
//!
//! # fn example() -> color_eyre::Result<()> {
//! let config = HypervisorConfig {
//!     kernel_path: "/usr/share/vm/vmlinuz".into(),
//!     initrd_path: Some("/usr/share/vm/initrd.img".into()),
//!     shared_fs: SharedFs::VirtioFs,
//!     num_vcpus: 1,
//!     default_max_vcpus: 8,
//!     ..Default::default()
//! };
//!
//! let controller = Controller::create_sandbox("sandbox-1", config)?;
//! controller.start_sandbox(Duration::from_secs(10))?;
//!
//! // Grow the guest to 4 vCPUs.
//! let (before, after) = controller.resize_vcpus(4)?;
//! assert_eq!((before, after), (1, 4));
//!
//! controller.stop_sandbox()?;
//! # Ok(())
//! # }
//! ```

mod arch;
mod bridge;
mod cmdline;
mod config;
mod controller;
mod device;
mod hotplug;
mod launch;
mod qmp;
mod state;
mod virtiofsd;

pub use arch::{ArchBase, ArchOps, Capabilities, Machine};
pub use bridge::{Bridge, BridgeTable, BusType, SlotRef};
pub use cmdline::{Incoming, Knobs, LaunchSpec, MemorySpec, Smp};
pub use config::{
    host_memory_mib, serialize_params, BlockDriver, HypervisorConfig, KernelParam, MachineType,
    SharedFs,
};
pub use controller::Controller;
pub use device::{
    BlockDrive, CharDriver, Device, Endpoint, LaunchDevice, MemoryDevice, SerialPort,
    TapInterface, VfioDevice, VfioKind, VhostUserFsDevice, VsockDevice, Volume,
};
pub use hotplug::{HotplugDevice, HotplugResult};
pub use qmp::{HotpluggableCpu, MemoryBackend, MemoryDeviceRecord, QmpSession};
pub use state::{ControllerState, StateStore};
pub use virtiofsd::{VirtiofsdHandle, VirtiofsdSupervisor};
