//! VM startup orchestration.
//!
//! Brings one sandbox VM from a built launch specification to a running,
//! QMP-reachable guest: runtime directory, virtiofsd (when configured),
//! the QEMU process itself, the bounded QMP handshake, and the optional
//! resume from a template snapshot. The whole sequence runs under the
//! controller mutex and inside the caller-supplied timeout budget.

use std::os::fd::OwnedFd;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use scopeguard::ScopeGuard;
use tracing::{debug, info, warn};

use crate::cmdline::LaunchSpec;
use crate::config::{serialize_params, SharedFs};
use crate::controller::ControllerInner;
use crate::qmp::QmpSession;
use crate::virtiofsd::VirtiofsdSupervisor;

/// Template resumes must converge within this window; the poll runs at a
/// fixed 100 ms interval.
const MIGRATION_TIMEOUT: Duration = Duration::from_secs(10);
const MIGRATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Launch the QEMU process described by `spec`.
///
/// QEMU daemonizes itself, so a successful return means the monitor
/// socket exists and the guest is set up. The staged fds lose their
/// close-on-exec flag right before the spawn so the child inherits them
/// under the numbers already rendered into the argv.
pub(crate) fn launch_qemu(spec: &LaunchSpec, staged_fds: &[OwnedFd]) -> Result<()> {
    for fd in staged_fds {
        rustix::io::fcntl_setfd(fd, rustix::io::FdFlags::empty())
            .context("clearing close-on-exec on a staged fd")?;
    }

    let args = spec.to_args();
    debug!(qemu = %spec.qemu_path, ?args, "launching QEMU");

    let output = Command::new(&spec.qemu_path)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("spawning {}", spec.qemu_path))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!(
            "failed to launch QEMU: {}, error messages from qemu log: {}",
            output.status,
            stderr.trim()
        ));
    }
    Ok(())
}

impl ControllerInner {
    /// Start the VM. `virtiofsd_exit` fires (from the supervisor thread)
    /// whenever the shared-fs daemon dies, however the startup itself
    /// ends.
    pub(crate) fn start_vm(
        &mut self,
        timeout: Duration,
        virtiofsd_exit: Box<dyn FnOnce() + Send>,
    ) -> Result<()> {
        if self.config.debug {
            let params = serialize_params(&self.arch.kernel_params_base(true));
            debug!(default_kernel_parameters = %params, "debug launch");
        }

        let vm_dir = self.config.vm_dir(&self.id);
        std::fs::create_dir_all(&vm_dir)
            .with_context(|| format!("creating VM directory {vm_dir}"))?;
        // A failed startup must not leave a half-populated run dir.
        let dir_guard = scopeguard::guard(vm_dir, |dir| {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                warn!(%dir, %err, "could not clean up VM directory");
            }
        });

        let result = self.start_vm_steps(timeout, virtiofsd_exit);

        // QEMU owns its copies now, whether or not the launch stuck.
        self.close_staged_fds();

        match result {
            Ok(()) => {
                ScopeGuard::into_inner(dir_guard);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn start_vm_steps(
        &mut self,
        timeout: Duration,
        virtiofsd_exit: Box<dyn FnOnce() + Send>,
    ) -> Result<()> {
        let mut remaining = timeout;

        if self.config.shared_fs == SharedFs::VirtioFs {
            remaining = self.start_virtiofsd(remaining, virtiofsd_exit)?;
            self.store_state()?;
        }

        launch_qemu(&self.launch, &self.staged_fds)?;

        // Bounded handshake; the session is dropped right away and
        // reopened lazily by whoever talks QMP next.
        QmpSession::open(&self.launch.qmp_socket, Instant::now() + remaining)?.close();

        if self.config.boot_from_template {
            self.resume_from_template()?;
        }
        Ok(())
    }

    fn start_virtiofsd(
        &mut self,
        budget: Duration,
        on_exit: Box<dyn FnOnce() + Send>,
    ) -> Result<Duration> {
        let supervisor = VirtiofsdSupervisor {
            binary: self.config.virtio_fs_daemon.clone(),
            socket_path: self.config.vhost_fs_socket(&self.id),
            source: self.config.shared_dir(&self.id),
            cache: self.config.virtio_fs_cache.clone(),
            debug: self.config.debug,
            extra_args: self.config.virtio_fs_extra_args.clone(),
        };
        let handle = supervisor.spawn(on_exit)?;
        let remaining = handle.wait_ready(budget)?;
        info!(pid = handle.pid(), "virtiofsd ready");
        self.state.virtiofsd_pid = handle.pid();
        Ok(remaining)
    }

    /// Feed a saved template snapshot into the freshly launched VM.
    fn resume_from_template(&mut self) -> Result<()> {
        self.ensure_qmp()?;
        let ControllerInner { arch, qmp, .. } = &mut *self;
        let session = qmp
            .as_mut()
            .ok_or_else(|| eyre!("QMP session vanished during template resume"))?;
        arch.set_ignore_shared_memory_migration_caps(session)?;

        let state_path = self
            .config
            .devices_state_path
            .as_ref()
            .ok_or_else(|| eyre!("boot from template requires a devices state path"))?;
        let uri = format!("exec:cat {state_path}");
        self.qmp_mut()?.migrate_incoming(&uri)?;

        let result = self.wait_migration();
        self.qmp_shutdown();
        result
    }

    /// Poll `query-migrate` until the migration completed or the fixed
    /// window closed.
    pub(crate) fn wait_migration(&mut self) -> Result<()> {
        let deadline = Instant::now() + MIGRATION_TIMEOUT;
        loop {
            let status = self.qmp_mut()?.query_migration()?;
            if status == Some(qapi_qmp::MigrationStatus::completed) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(eyre!(
                    "timed out after {}s waiting for migration to complete",
                    MIGRATION_TIMEOUT.as_secs()
                ));
            }
            debug!(?status, "migration in progress");
            std::thread::sleep(MIGRATION_POLL_INTERVAL);
        }
    }
}
