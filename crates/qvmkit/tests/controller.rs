//! Controller tests against a scripted QMP endpoint.
//!
//! A real QEMU is not available here, but everything up to the QMP
//! socket is: these tests run the controller against a fake monitor
//! that speaks just enough of the protocol (greeting, capability
//! negotiation, a handful of commands) to exercise the full flows.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use qvmkit::{
    Controller, ControllerState, HypervisorConfig, QmpSession, SharedFs, StateStore,
};

const GREETING: &str = r#"{"QMP":{"version":{"qemu":{"major":7,"minor":2,"micro":0},"package":""},"capabilities":[]}}"#;

/// Serve one QMP client connection, answering from a canned table.
fn serve_qmp(listener: UnixListener, hotpluggable_cpus: usize) {
    let Ok((stream, _)) = listener.accept() else {
        return;
    };
    let mut writer = stream.try_clone().expect("clone stream");
    let reader = BufReader::new(stream);

    writeln!(writer, "{GREETING}").ok();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let response = if line.contains("query-hotpluggable-cpus") {
            let mut cpus = vec![
                // Boot CPU, already occupied.
                r#"{"type":"host-x86_64-cpu","vcpus-count":1,"qom-path":"/machine/unattached/device[0]","props":{"socket-id":0,"die-id":0,"core-id":0,"thread-id":0}}"#.to_string(),
            ];
            for socket in 1..=hotpluggable_cpus {
                cpus.push(format!(
                    r#"{{"type":"host-x86_64-cpu","vcpus-count":1,"props":{{"socket-id":{socket},"die-id":0,"core-id":0,"thread-id":0}}}}"#
                ));
            }
            format!(r#"{{"return":[{}]}}"#, cpus.join(","))
        } else if line.contains("query-status") {
            r#"{"return":{"status":"running","singlestep":false,"running":true}}"#.to_string()
        } else {
            // qmp_capabilities, device_add, device_del, quit, ...
            r#"{"return":{}}"#.to_string()
        };
        if writeln!(writer, "{response}").is_err() {
            break;
        }
        if line.contains("\"quit\"") {
            break;
        }
    }
}

struct TestSandbox {
    _dir: tempfile::TempDir,
    config: HypervisorConfig,
    id: &'static str,
}

impl TestSandbox {
    fn new(id: &'static str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8Path::from_path(dir.path()).expect("utf8 tempdir");

        // The launch builder insists the binaries exist.
        let qemu = root.join("qemu-system-fake");
        std::fs::write(&qemu, b"").expect("fake qemu");
        let kernel = root.join("vmlinuz");
        std::fs::write(&kernel, b"").expect("fake kernel");

        let config = HypervisorConfig {
            hypervisor_path: Some(qemu),
            kernel_path: kernel,
            initrd_path: Some(root.join("vmlinuz")),
            num_vcpus: 1,
            default_max_vcpus: 8,
            run_store_path: root.join("vm"),
            host_shared_path: root.join("shared"),
            ..Default::default()
        };
        Self {
            _dir: dir,
            config,
            id,
        }
    }

    /// Start a fake monitor on the sandbox's QMP socket path.
    fn spawn_qmp(&self, hotpluggable_cpus: usize) -> std::thread::JoinHandle<()> {
        let socket = self.config.qmp_socket(self.id);
        std::fs::create_dir_all(socket.parent().unwrap()).expect("vm dir");
        let listener = UnixListener::bind(&socket).expect("bind qmp socket");
        std::thread::spawn(move || serve_qmp(listener, hotpluggable_cpus))
    }

    fn wire_state(&self, controller: &Controller) -> serde_json::Value {
        let blob = controller.to_wire().expect("to_wire");
        serde_json::from_slice(&blob).expect("wire blob is json")
    }
}

#[test]
fn test_create_sandbox_persists_state() {
    let sandbox = TestSandbox::new("sb-create");
    let controller =
        Controller::create_sandbox(sandbox.id, sandbox.config.clone()).expect("create");

    let wire = sandbox.wire_state(&controller);
    let uuid = wire["state"]["uuid"].as_str().expect("uuid");
    assert!(!uuid.is_empty());
    assert_eq!(wire["smp"]["cpus"], 1);
    assert_eq!(wire["smp"]["max_cpus"], 8);

    // State survives on disk for a reattach.
    let store = StateStore::new(sandbox.config.run_store_path.clone());
    let state = store.load(sandbox.id).expect("load").expect("present");
    assert_eq!(state.uuid, uuid);
    assert_eq!(state.bridges.len(), 1);
}

#[test]
fn test_reattach_reuses_uuid_and_pids() {
    let sandbox = TestSandbox::new("sb-reattach");
    let store = StateStore::new(sandbox.config.run_store_path.clone());
    store
        .save(
            sandbox.id,
            &ControllerState {
                uuid: "f1db1c12-5e4e-4f62-97d2-7b9b35a4b463".to_string(),
                virtiofsd_pid: 200,
                ..Default::default()
            },
        )
        .expect("seed state");

    let controller =
        Controller::create_sandbox(sandbox.id, sandbox.config.clone()).expect("create");
    let wire = sandbox.wire_state(&controller);
    assert_eq!(
        wire["state"]["uuid"].as_str(),
        Some("f1db1c12-5e4e-4f62-97d2-7b9b35a4b463")
    );

    std::fs::write(sandbox.config.pid_file(sandbox.id), "100\n").expect("pid file");
    assert_eq!(controller.get_pids(), vec![100, 200]);
}

#[test]
fn test_get_pids_without_pid_file() {
    let sandbox = TestSandbox::new("sb-nopid");
    let controller =
        Controller::create_sandbox(sandbox.id, sandbox.config.clone()).expect("create");
    assert_eq!(controller.get_pids(), vec![0]);
}

#[test]
fn test_templating_with_virtio_fs_is_rejected() {
    let mut sandbox = TestSandbox::new("sb-template");
    sandbox.config.shared_fs = SharedFs::VirtioFs;
    sandbox.config.boot_to_be_template = true;
    sandbox.config.memory_path = Some("/dev/shm".into());

    let err = Controller::create_sandbox(sandbox.id, sandbox.config.clone())
        .expect_err("templating plus virtio-fs cannot work");
    assert_eq!(
        err.to_string(),
        "VM templating has been enabled with either virtio-fs or file backed memory \
and this configuration will not work"
    );
}

#[test]
fn test_resize_vcpus_hotplug_and_lifo_remove() {
    let sandbox = TestSandbox::new("sb-cpus");
    let controller =
        Controller::create_sandbox(sandbox.id, sandbox.config.clone()).expect("create");

    let server = sandbox.spawn_qmp(7);
    let (before, after) = controller.resize_vcpus(3).expect("resize up");
    assert_eq!((before, after), (1, 3));

    let wire = sandbox.wire_state(&controller);
    let cpus: Vec<&str> = wire["state"]["hotplugged_vcpus"]
        .as_array()
        .expect("vcpu list")
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(cpus, ["cpu-0", "cpu-1"]);
    server.join().ok();

    // to_wire dropped the session; the next flow reconnects.
    let server = sandbox.spawn_qmp(7);
    let (before, after) = controller.resize_vcpus(1).expect("resize down");
    assert_eq!((before, after), (3, 1));
    let wire = sandbox.wire_state(&controller);
    assert_eq!(
        wire["state"]["hotplugged_vcpus"].as_array().map(Vec::len),
        Some(0)
    );
    server.join().ok();
}

#[test]
fn test_resize_vcpus_clamps_at_max() {
    let sandbox = TestSandbox::new("sb-clamp");
    let controller =
        Controller::create_sandbox(sandbox.id, sandbox.config.clone()).expect("create");

    let server = sandbox.spawn_qmp(7);
    // Max is 8 with 1 booted: a request for 20 clamps to 7 hot-added.
    let (before, after) = controller.resize_vcpus(20).expect("clamped resize");
    assert_eq!((before, after), (1, 8));
    server.join().ok();
}

#[test]
fn test_check_reports_running() {
    let sandbox = TestSandbox::new("sb-check");
    let controller =
        Controller::create_sandbox(sandbox.id, sandbox.config.clone()).expect("create");
    let server = sandbox.spawn_qmp(0);
    controller.check().expect("running guest passes the check");
    drop(controller);
    server.join().ok();
}

#[test]
fn test_stop_sandbox_is_idempotent() {
    let sandbox = TestSandbox::new("sb-stop");
    let controller =
        Controller::create_sandbox(sandbox.id, sandbox.config.clone()).expect("create");

    let server = sandbox.spawn_qmp(0);
    controller.stop_sandbox().expect("first stop");
    server.join().ok();

    // The VM directory is gone and the second stop is a no-op.
    assert!(!sandbox.config.vm_dir(sandbox.id).exists());
    controller.stop_sandbox().expect("second stop");
}

#[test]
fn test_stop_without_vm_succeeds() {
    let sandbox = TestSandbox::new("sb-stopdead");
    let controller =
        Controller::create_sandbox(sandbox.id, sandbox.config.clone()).expect("create");
    // Nothing listens on the QMP socket: the VM never ran or is gone.
    controller.stop_sandbox().expect("stopping a dead VM succeeds");
}

#[test]
fn test_qmp_open_times_out_without_listener() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = Utf8PathBuf::from_path_buf(dir.path().join("missing.sock")).unwrap();
    let start = Instant::now();
    let err = QmpSession::open(&socket, Instant::now() + Duration::from_millis(300))
        .expect_err("no listener");
    assert!(err.to_string().contains("timed out"));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[test]
fn test_qmp_open_negotiates_against_listener() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = Utf8PathBuf::from_path_buf(dir.path().join("qmp.sock")).unwrap();
    let listener = UnixListener::bind(&socket).expect("bind");
    let server = std::thread::spawn(move || serve_qmp(listener, 0));

    let mut session =
        QmpSession::open(&socket, Instant::now() + Duration::from_secs(2)).expect("open");
    let status = session.query_status().expect("query-status");
    assert_eq!(status, qapi_qmp::RunState::running);
    session.close();
    drop(UnixStream::connect(&socket).ok());
    server.join().ok();
}
