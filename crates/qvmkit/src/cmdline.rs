//! Launch specification assembly and rendering.
//!
//! [`LaunchSpec`] is the static half of the controller: everything QEMU
//! must know at exec time. [`build_launch_spec`] assembles it from the
//! hypervisor configuration and the arch backend, enforcing the memory
//! and templating policies; [`LaunchSpec::to_args`] renders the argv.

use camino::Utf8PathBuf;
use color_eyre::eyre::bail;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::arch::ArchOps;
use crate::config::{
    serialize_params, BlockDriver, HypervisorConfig, KernelParam, SharedFs,
};
use crate::device::{CharDriver, LaunchDevice};

const FALLBACK_FILE_BACKED_MEM_DIR: &str = "/dev/shm";

/// Error text for the one configuration combination that can never work:
/// template VMs require shared=off for the clones, virtio-fs requires
/// shared=on, always.
pub(crate) const TEMPLATING_CONFLICT: &str = "VM templating has been enabled with either \
virtio-fs or file backed memory and this configuration will not work";

/// Guest CPU topology. Also part of the cross-process handoff blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Smp {
    pub cpus: u32,
    pub cores: u32,
    pub threads: u32,
    pub sockets: u32,
    pub max_cpus: u32,
}

/// Guest memory sizing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySpec {
    /// Boot memory, e.g. `2048M`.
    pub size: String,
    /// DIMM slots available for hotplug.
    pub slots: u32,
    /// Address space ceiling, e.g. `4096M`.
    pub max_mem: String,
    /// Backing file directory when memory is file backed.
    pub path: Option<Utf8PathBuf>,
}

/// Boolean switches of the launch configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Knobs {
    pub no_user_config: bool,
    pub no_defaults: bool,
    pub no_graphic: bool,
    pub daemonize: bool,
    pub huge_pages: bool,
    pub mem_prealloc: bool,
    pub realtime: bool,
    pub mlock: bool,
    pub file_backed_mem: bool,
    pub mem_shared: bool,
}

/// How the VM receives its initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Wait for a `migrate-incoming` command after launch.
    Deferred,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSpec {
    pub path: Utf8PathBuf,
    pub initrd: Option<Utf8PathBuf>,
    /// Fully serialized command line.
    pub params: String,
}

/// The complete static launch configuration for one VM.
#[derive(Debug, Default)]
pub struct LaunchSpec {
    pub name: String,
    pub uuid: String,
    pub qemu_path: Utf8PathBuf,
    pub machine_type: String,
    pub machine_options: String,
    pub cpu_model: String,
    pub smp: Smp,
    pub memory: MemorySpec,
    pub kernel: KernelSpec,
    pub knobs: Knobs,
    pub incoming: Option<Incoming>,
    pub firmware: Option<Utf8PathBuf>,
    pub qmp_socket: Utf8PathBuf,
    pub pid_file: Utf8PathBuf,
    /// Set only in debug mode.
    pub log_file: Option<Utf8PathBuf>,
    pub devices: Vec<LaunchDevice>,
    pub io_threads: Vec<String>,
    /// Device name suffix of the virtio transport (`-pci` or `-ccw`).
    pub transport_suffix: &'static str,
}

/// Assemble the kernel command line. Each later segment overrides earlier
/// keys because the guest kernel honours the last occurrence.
pub(crate) fn kernel_parameters(config: &HypervisorConfig, arch: &dyn ArchOps) -> String {
    let mut params = arch.kernel_params_base(config.debug);
    params.push(KernelParam::new("panic", "1"));
    params.push(KernelParam::new(
        "nr_cpus",
        config.default_max_vcpus.to_string(),
    ));
    params.push(KernelParam::new(
        "agent.use_vsock",
        config.use_vsock.to_string(),
    ));
    params.extend(config.kernel_params.iter().cloned());
    serialize_params(&params)
}

fn setup_template(
    config: &HypervisorConfig,
    knobs: &mut Knobs,
    memory: &mut MemorySpec,
) -> Option<Incoming> {
    if !config.templating() {
        return None;
    }
    knobs.file_backed_mem = true;
    memory.path = config.memory_path.clone();
    if config.boot_to_be_template {
        knobs.mem_shared = true;
    }
    config.boot_from_template.then_some(Incoming::Deferred)
}

fn setup_file_backed_mem(config: &HypervisorConfig, knobs: &mut Knobs, memory: &mut MemorySpec) {
    let target = config
        .file_backed_mem_root_dir
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from(FALLBACK_FILE_BACKED_MEM_DIR));
    if !target.exists() {
        // Downgrade rather than fail: the VM still boots, just without
        // file backed memory.
        error!(%target, "file backed memory location does not exist");
        return;
    }
    knobs.file_backed_mem = true;
    knobs.mem_shared = true;
    memory.path = Some(target);
}

/// Resolve the QEMU binary: config override first, arch table otherwise.
/// Either way the binary must exist on disk.
fn qemu_path(config: &HypervisorConfig, arch: &dyn ArchOps) -> Result<Utf8PathBuf> {
    let path = match &config.hypervisor_path {
        Some(p) if !p.as_str().is_empty() => p.clone(),
        _ => arch.qemu_path()?,
    };
    if !path.exists() {
        bail!("QEMU path ({path}) does not exist");
    }
    Ok(path)
}

/// Build the launch specification. This is the config-time half of
/// sandbox creation: every policy violation must surface here, before
/// any process exists.
pub(crate) fn build_launch_spec(
    id: &str,
    uuid: &str,
    config: &HypervisorConfig,
    arch: &mut dyn ArchOps,
) -> Result<LaunchSpec> {
    if uuid.is_empty() {
        bail!("UUID should not be empty");
    }

    let machine = arch.machine()?;
    let smp = arch.cpu_topology(config.num_vcpus, config.default_max_vcpus);
    let host_mem_mib = crate::config::host_memory_mib()?;
    let mut memory =
        arch.memory_topology(u64::from(config.memory_size_mib), host_mem_mib, config.mem_slots);

    let mut knobs = Knobs {
        no_user_config: true,
        no_defaults: true,
        no_graphic: true,
        daemonize: true,
        huge_pages: config.huge_pages,
        mem_prealloc: config.mem_prealloc,
        realtime: config.realtime,
        mlock: config.mlock,
        file_backed_mem: false,
        mem_shared: false,
    };

    let incoming = setup_template(config, &mut knobs, &mut memory);

    if config.shared_fs == SharedFs::VirtioFs || config.file_backed_mem_root_dir.is_some() {
        if config.templating() {
            bail!(TEMPLATING_CONFLICT);
        }
        setup_file_backed_mem(config, &mut knobs, &mut memory);
        if config.huge_pages {
            knobs.mem_prealloc = true;
        }
    }

    let mut devices = Vec::new();

    // Bridges first so they take the lowest root-bus addresses.
    arch.append_bridges(&mut devices);
    arch.append_console(&mut devices, &config.console_socket(id));

    if config.initrd_path.is_none() {
        if let Some(image) = &config.image_path {
            arch.append_image(&mut devices, image)?;
        }
    }

    let mut io_threads = Vec::new();
    if config.block_device_driver == BlockDriver::VirtioScsi {
        if let Some(io_thread) =
            arch.append_scsi_controller(&mut devices, config.enable_io_threads)
        {
            io_threads.push(io_thread);
        }
    }

    arch.append_rng(&mut devices, &config.entropy_source);

    Ok(LaunchSpec {
        name: format!("sandbox-{id}"),
        uuid: uuid.to_string(),
        qemu_path: qemu_path(config, arch)?,
        machine_type: machine.mtype.to_string(),
        machine_options: format!("{}{}", machine.options, config.accelerator_suffix()),
        cpu_model: arch.cpu_model(),
        smp,
        memory,
        kernel: KernelSpec {
            path: config.kernel_path.clone(),
            initrd: config.initrd_path.clone(),
            params: kernel_parameters(config, arch),
        },
        knobs,
        incoming,
        firmware: config.firmware_path.clone(),
        qmp_socket: config.qmp_socket(id),
        pid_file: config.pid_file(id),
        log_file: config.debug.then(|| config.log_file(id)),
        devices,
        io_threads,
        transport_suffix: arch.transport_suffix(),
    })
}

impl LaunchSpec {
    /// Render the full QEMU argv (binary not included).
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let suffix = self.transport_suffix;

        args.extend(["-name".into(), self.name.clone()]);
        args.extend(["-uuid".into(), self.uuid.clone()]);
        args.extend([
            "-machine".into(),
            format!("{}{}", self.machine_type, opt_suffix(&self.machine_options)),
        ]);
        args.extend(["-cpu".into(), self.cpu_model.clone()]);

        args.extend([
            "-qmp".into(),
            format!("unix:{},server=on,wait=off", self.qmp_socket),
        ]);

        let mut mem = self.memory.size.clone();
        if self.memory.slots > 0 {
            mem += &format!(",slots={}", self.memory.slots);
        }
        if !self.memory.max_mem.is_empty() {
            mem += &format!(",maxmem={}", self.memory.max_mem);
        }
        args.extend(["-m".into(), mem]);

        args.extend([
            "-smp".into(),
            format!(
                "{},cores={},threads={},sockets={},maxcpus={}",
                self.smp.cpus, self.smp.cores, self.smp.threads, self.smp.sockets, self.smp.max_cpus
            ),
        ]);

        self.append_knob_args(&mut args);

        for id in &self.io_threads {
            args.extend(["-object".into(), format!("iothread,id={id}")]);
        }
        for device in &self.devices {
            args.extend(device_args(device, suffix));
        }

        args.extend(["-rtc".into(), "base=utc,driftfix=slew".into()]);
        args.extend([
            "-global".into(),
            "kvm-pit.lost_tick_policy=discard".into(),
        ]);
        args.extend(["-vga".into(), "none".into()]);

        if let Some(firmware) = &self.firmware {
            args.extend(["-bios".into(), firmware.to_string()]);
        }

        args.extend(["-kernel".into(), self.kernel.path.to_string()]);
        if let Some(initrd) = &self.kernel.initrd {
            args.extend(["-initrd".into(), initrd.to_string()]);
        }
        if !self.kernel.params.is_empty() {
            args.extend(["-append".into(), self.kernel.params.clone()]);
        }

        if let Some(Incoming::Deferred) = self.incoming {
            args.extend(["-incoming".into(), "defer".into()]);
        }

        args.extend(["-pidfile".into(), self.pid_file.to_string()]);
        if let Some(log_file) = &self.log_file {
            args.extend(["-D".into(), log_file.to_string()]);
        }

        args
    }

    fn append_knob_args(&self, args: &mut Vec<String>) {
        let knobs = &self.knobs;
        if knobs.no_user_config {
            args.push("-no-user-config".into());
        }
        if knobs.no_defaults {
            args.push("-nodefaults".into());
        }
        if knobs.no_graphic {
            args.push("-nographic".into());
        }
        if knobs.daemonize {
            args.push("-daemonize".into());
        }

        if knobs.huge_pages {
            args.extend(["-mem-path".into(), "/dev/hugepages".into()]);
            if !knobs.mem_prealloc {
                args.push("-mem-prealloc".into());
            }
        } else if knobs.file_backed_mem {
            if let Some(path) = &self.memory.path {
                let share = if knobs.mem_shared { ",share=on" } else { "" };
                args.extend([
                    "-object".into(),
                    format!(
                        "memory-backend-file,id=dimm1,size={},mem-path={path}{share}",
                        self.memory.size
                    ),
                ]);
                args.extend(["-numa".into(), "node,memdev=dimm1".into()]);
            } else {
                warn!("file backed memory requested without a backing path");
            }
        }
        if knobs.mem_prealloc {
            args.push("-mem-prealloc".into());
        }
        if knobs.realtime {
            let mlock = if knobs.mlock { "mlock=on" } else { "mlock=off" };
            args.extend(["-realtime".into(), mlock.into()]);
        }
    }
}

fn opt_suffix(options: &str) -> String {
    if options.is_empty() {
        String::new()
    } else {
        format!(",{options}")
    }
}

fn disable_modern_suffix(disable: bool, suffix: &str) -> &'static str {
    // disable-modern is a property of the PCI transport only.
    if disable && suffix == "-pci" {
        ",disable-modern=true"
    } else {
        ""
    }
}

fn device_args(device: &LaunchDevice, suffix: &str) -> Vec<String> {
    match device {
        LaunchDevice::Bridge {
            bus,
            id,
            root_bus,
            chassis,
            addr,
        } => {
            let driver = match bus {
                crate::bridge::BusType::Pcie => "pcie-pci-bridge",
                _ => "pci-bridge",
            };
            let chassis_opts = match bus {
                crate::bridge::BusType::Pcie => String::new(),
                _ => format!(",chassis_nr={chassis},shpc=on"),
            };
            vec![
                "-device".into(),
                format!("{driver},bus={root_bus},id={id}{chassis_opts},addr={addr}"),
            ]
        }
        LaunchDevice::SerialController { id, disable_modern } => vec![
            "-device".into(),
            format!(
                "virtio-serial{suffix},id={id}{}",
                disable_modern_suffix(*disable_modern, suffix)
            ),
        ],
        LaunchDevice::Char {
            driver,
            device_id,
            id,
            path,
            name,
        } => {
            let device = match driver {
                CharDriver::Console => format!("virtconsole,chardev={id},id={device_id}"),
                CharDriver::SerialPort => {
                    let name = name.as_deref().unwrap_or_default();
                    format!("virtserialport,chardev={id},id={device_id},name={name}")
                }
            };
            vec![
                "-chardev".into(),
                format!("socket,id={id},path={path},server=on,wait=off"),
                "-device".into(),
                device,
            ]
        }
        LaunchDevice::NinePFs {
            id,
            path,
            mount_tag,
            disable_modern,
        } => vec![
            "-fsdev".into(),
            format!("local,id={id},path={path},security_model=none"),
            "-device".into(),
            format!(
                "virtio-9p{suffix},fsdev={id},mount_tag={mount_tag}{}",
                disable_modern_suffix(*disable_modern, suffix)
            ),
        ],
        LaunchDevice::Vsock {
            id,
            context_id,
            vhost_fd_num,
            disable_modern,
        } => vec![
            "-device".into(),
            format!(
                "vhost-vsock{suffix},id={id},guest-cid={context_id},vhostfd={vhost_fd_num}{}",
                disable_modern_suffix(*disable_modern, suffix)
            ),
        ],
        LaunchDevice::Net {
            id,
            ifname,
            mac,
            vhost,
            fd_nums,
            vhost_fd_nums,
            disable_modern,
        } => {
            let mut netdev = format!("tap,id={id}");
            if fd_nums.is_empty() {
                netdev += &format!(",ifname={ifname},script=no,downscript=no");
            } else {
                netdev += &format!(",fds={}", join_fds(fd_nums));
            }
            if *vhost {
                netdev += ",vhost=on";
                if !vhost_fd_nums.is_empty() {
                    netdev += &format!(",vhostfds={}", join_fds(vhost_fd_nums));
                }
            }
            let mut dev = format!(
                "virtio-net{suffix},netdev={id},mac={mac}{}",
                disable_modern_suffix(*disable_modern, suffix)
            );
            if fd_nums.len() > 1 {
                // One queue per fd; QEMU wants 2*N+2 MSI-X vectors.
                dev += &format!(",mq=on,vectors={}", 2 * fd_nums.len() + 2);
            }
            vec!["-netdev".into(), netdev, "-device".into(), dev]
        }
        LaunchDevice::Block {
            id,
            file,
            format,
            read_only,
            disable_modern,
        } => {
            let ro = if *read_only { ",readonly=on" } else { "" };
            vec![
                "-drive".into(),
                format!("id={id},file={file},aio=threads,format={format},if=none{ro}"),
                "-device".into(),
                format!(
                    "virtio-blk{suffix},drive={id}{}",
                    disable_modern_suffix(*disable_modern, suffix)
                ),
            ]
        }
        LaunchDevice::ScsiController {
            id,
            io_thread,
            disable_modern,
        } => {
            let iothread = io_thread
                .as_ref()
                .map(|t| format!(",iothread={t}"))
                .unwrap_or_default();
            vec![
                "-device".into(),
                format!(
                    "virtio-scsi{suffix},id={id}{iothread}{}",
                    disable_modern_suffix(*disable_modern, suffix)
                ),
            ]
        }
        LaunchDevice::VhostUserFs {
            char_id,
            dev_id,
            socket_path,
            tag,
            cache_size_mib,
        } => {
            let cache = if *cache_size_mib > 0 {
                format!(",cache-size={cache_size_mib}M")
            } else {
                String::new()
            };
            vec![
                "-chardev".into(),
                format!("socket,id={char_id},path={socket_path}"),
                "-device".into(),
                format!("vhost-user-fs{suffix},chardev={char_id},id={dev_id},tag={tag}{cache}"),
            ]
        }
        LaunchDevice::Vfio { bdf } => {
            vec!["-device".into(), format!("vfio{suffix},host={bdf}")]
        }
        LaunchDevice::Rng { id, filename } => vec![
            "-object".into(),
            format!("rng-random,id={id},filename={filename}"),
            "-device".into(),
            format!("virtio-rng{suffix},rng={id}"),
        ],
        LaunchDevice::NvdimmImage {
            id,
            memdev_id,
            file,
            size,
        } => vec![
            "-device".into(),
            format!("nvdimm,id={id},memdev={memdev_id}"),
            "-object".into(),
            format!("memory-backend-file,id={memdev_id},mem-path={file},size={size}"),
        ],
    }
}

fn join_fds(fds: &[i32]) -> String {
    fds.iter()
        .map(|fd| fd.to_string())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchBase;
    use crate::bridge::BusType;
    use camino::Utf8Path;

    #[test]
    fn test_kernel_parameters_order_and_overrides() {
        let config = HypervisorConfig {
            default_max_vcpus: 8,
            use_vsock: false,
            debug: true,
            kernel_params: vec![
                KernelParam::new("foo", "foo"),
                KernelParam::new("bar", "bar"),
            ],
            ..Default::default()
        };
        let arch = ArchBase::default();
        assert_eq!(
            kernel_parameters(&config, &arch),
            "panic=1 nr_cpus=8 agent.use_vsock=false foo=foo bar=bar"
        );

        let config = HypervisorConfig {
            debug: false,
            ..config
        };
        assert_eq!(
            kernel_parameters(&config, &arch),
            "panic=1 nr_cpus=8 agent.use_vsock=false foo=foo bar=bar"
        );
    }

    #[test]
    fn test_user_params_come_last() {
        let config = HypervisorConfig {
            default_max_vcpus: 2,
            kernel_params: vec![KernelParam::new("panic", "0")],
            ..Default::default()
        };
        let arch = ArchBase::default();
        let params = kernel_parameters(&config, &arch);
        // The kernel keeps the last value, so the user override must
        // serialize after the default.
        assert!(params.starts_with("panic=1"));
        assert!(params.ends_with("panic=0"));
    }

    #[test]
    fn test_template_knobs() {
        let config = HypervisorConfig {
            boot_to_be_template: true,
            memory_path: Some("/run/template/memory".into()),
            ..Default::default()
        };
        let mut knobs = Knobs::default();
        let mut memory = MemorySpec::default();
        let incoming = setup_template(&config, &mut knobs, &mut memory);
        assert!(incoming.is_none());
        assert!(knobs.file_backed_mem);
        assert!(knobs.mem_shared);
        assert_eq!(memory.path.as_deref().map(Utf8Path::as_str), Some("/run/template/memory"));

        let config = HypervisorConfig {
            boot_from_template: true,
            boot_to_be_template: false,
            ..config
        };
        let mut knobs = Knobs::default();
        let incoming = setup_template(&config, &mut knobs, &mut memory);
        assert_eq!(incoming, Some(Incoming::Deferred));
        assert!(!knobs.mem_shared);
    }

    #[test]
    fn test_file_backed_mem_downgrades_on_missing_dir() {
        let config = HypervisorConfig {
            file_backed_mem_root_dir: Some("/nonexistent/qvmkit-test".into()),
            ..Default::default()
        };
        let mut knobs = Knobs::default();
        let mut memory = MemorySpec::default();
        setup_file_backed_mem(&config, &mut knobs, &mut memory);
        assert!(!knobs.file_backed_mem);
        assert!(!knobs.mem_shared);
        assert!(memory.path.is_none());
    }

    #[test]
    fn test_file_backed_mem_uses_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = HypervisorConfig {
            file_backed_mem_root_dir: Some(
                Utf8Path::from_path(dir.path()).unwrap().to_owned(),
            ),
            ..Default::default()
        };
        let mut knobs = Knobs::default();
        let mut memory = MemorySpec::default();
        setup_file_backed_mem(&config, &mut knobs, &mut memory);
        assert!(knobs.file_backed_mem);
        assert!(knobs.mem_shared);
        assert_eq!(
            memory.path.as_deref(),
            Some(Utf8Path::from_path(dir.path()).unwrap())
        );
    }

    #[test]
    fn test_bridge_device_args() {
        let args = device_args(
            &LaunchDevice::Bridge {
                bus: BusType::Pci,
                id: "pci-bridge-0".into(),
                root_bus: "pci.0",
                chassis: 1,
                addr: 2,
            },
            "-pci",
        );
        assert_eq!(
            args,
            [
                "-device",
                "pci-bridge,bus=pci.0,id=pci-bridge-0,chassis_nr=1,shpc=on,addr=2"
            ]
        );
    }

    #[test]
    fn test_net_device_multiqueue() {
        let args = device_args(
            &LaunchDevice::Net {
                id: "network-0".into(),
                ifname: "tap0".into(),
                mac: "02:00:ca:fe:00:01".into(),
                vhost: true,
                fd_nums: vec![10, 11],
                vhost_fd_nums: vec![12, 13],
                disable_modern: false,
            },
            "-pci",
        );
        assert_eq!(args[1], "tap,id=network-0,fds=10:11,vhost=on,vhostfds=12:13");
        assert_eq!(
            args[3],
            "virtio-net-pci,netdev=network-0,mac=02:00:ca:fe:00:01,mq=on,vectors=6"
        );
    }

    #[test]
    fn test_ccw_suffix_used_for_devices() {
        let args = device_args(
            &LaunchDevice::SerialController {
                id: "serial0".into(),
                disable_modern: true,
            },
            "-ccw",
        );
        // disable-modern never applies to the CCW transport.
        assert_eq!(args[1], "virtio-serial-ccw,id=serial0");
    }

    #[test]
    fn test_to_args_skeleton() {
        let spec = LaunchSpec {
            name: "sandbox-test".into(),
            uuid: "be3bbce8-398f-4e40-a299-8d2b9d591b1b".into(),
            qemu_path: "/usr/bin/qemu-system-x86_64".into(),
            machine_type: "q35".into(),
            machine_options: "accel=kvm".into(),
            cpu_model: "host".into(),
            smp: Smp {
                cpus: 1,
                cores: 1,
                threads: 1,
                sockets: 8,
                max_cpus: 8,
            },
            memory: MemorySpec {
                size: "2048M".into(),
                slots: 10,
                max_mem: "4096M".into(),
                path: None,
            },
            kernel: KernelSpec {
                path: "/boot/vmlinuz".into(),
                initrd: None,
                params: "panic=1".into(),
            },
            knobs: Knobs {
                no_user_config: true,
                no_defaults: true,
                no_graphic: true,
                daemonize: true,
                ..Default::default()
            },
            qmp_socket: "/run/qvm/vm/test/qmp.sock".into(),
            pid_file: "/run/qvm/vm/test/pid".into(),
            transport_suffix: "-pci",
            ..Default::default()
        };
        let args = spec.to_args();
        let joined = args.join(" ");
        assert!(joined.contains("-name sandbox-test"));
        assert!(joined.contains("-machine q35,accel=kvm"));
        assert!(joined.contains("-m 2048M,slots=10,maxmem=4096M"));
        assert!(joined.contains("-smp 1,cores=1,threads=1,sockets=8,maxcpus=8"));
        assert!(joined.contains("-qmp unix:/run/qvm/vm/test/qmp.sock,server=on,wait=off"));
        assert!(joined.contains("-daemonize"));
        assert!(joined.contains("-append panic=1"));
        assert!(joined.contains("-pidfile /run/qvm/vm/test/pid"));
        assert!(!joined.contains("-incoming"));
    }
}
