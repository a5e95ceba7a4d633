//! virtiofsd daemon supervision.
//!
//! When the shared filesystem is virtio-fs, the VM depends on an
//! external vhost-user-fs daemon. The supervisor spawns it, watches its
//! stderr for the socket-ready announcement, and cascades its death into
//! a sandbox stop: the guest cannot survive its filesystem backend.

use std::io::BufRead;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use color_eyre::eyre::{bail, eyre, Context};
use color_eyre::Result;
use tracing::{debug, info, warn};

/// Line virtiofsd prints on stderr once its vhost-user socket listens.
const SOCKET_READY_MARKER: &str = "Waiting for vhost-user socket connection...";

/// Launch parameters for one virtiofsd instance.
#[derive(Debug, Clone)]
pub struct VirtiofsdSupervisor {
    pub binary: Utf8PathBuf,
    /// vhost-user socket QEMU will connect to.
    pub socket_path: Utf8PathBuf,
    /// Host directory exported to the guest.
    pub source: Utf8PathBuf,
    /// Cache mode (`none`, `auto`, `always`).
    pub cache: String,
    pub debug: bool,
    pub extra_args: Vec<String>,
}

/// A running daemon. The stderr scanner thread owns the child process;
/// the handle only carries what the controller needs.
pub struct VirtiofsdHandle {
    pid: u32,
    ready_rx: mpsc::Receiver<Result<()>>,
}

impl VirtiofsdSupervisor {
    /// The daemon argument list. Foreground (`-f`) unless debug asked for
    /// verbose output (`-d`).
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("vhost_user_socket={}", self.socket_path),
            "-o".to_string(),
            format!("source={}", self.source),
            "-o".to_string(),
            format!("cache={}", self.cache),
        ];
        if self.debug {
            args.push("-d".to_string());
        } else {
            args.push("-f".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn validate(&self) -> Result<()> {
        if !self.source.is_dir() {
            bail!("virtiofsd source directory {} does not exist", self.source);
        }
        if self.socket_path.as_str().is_empty() {
            bail!("virtiofsd socket path cannot be empty");
        }
        Ok(())
    }

    /// Spawn the daemon. `on_exit` runs from the scanner thread after the
    /// daemon terminates, however it terminates.
    pub fn spawn(self, on_exit: Box<dyn FnOnce() + Send>) -> Result<VirtiofsdHandle> {
        self.validate()?;

        let mut child = Command::new(&self.binary)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning virtiofsd at {}", self.binary))?;
        let pid = child.id();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| eyre!("virtiofsd child has no stderr pipe"))?;

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let debug_output = self.debug;
        std::thread::spawn(move || {
            scan_stderr(std::io::BufReader::new(stderr), debug_output, &ready_tx);
            info!(pid, "virtiofsd quit");
            // Reap before announcing the death so the pid is gone.
            let _ = child.wait();
            on_exit();
        });

        debug!(pid, socket = %self.socket_path, source = %self.source, "spawned virtiofsd");
        Ok(VirtiofsdHandle { pid, ready_rx })
    }
}

/// Drain stderr. The first marker line resolves the readiness channel;
/// stream end without a marker resolves it with the scan error.
fn scan_stderr<R: BufRead>(reader: R, debug_output: bool, ready_tx: &mpsc::SyncSender<Result<()>>) {
    let mut sent = false;
    let mut lines = reader.lines();
    loop {
        match lines.next() {
            Some(Ok(line)) => {
                if debug_output {
                    debug!(source = "virtiofsd", "{line}");
                }
                if !sent && line.contains(SOCKET_READY_MARKER) {
                    let _ = ready_tx.send(Ok(()));
                    sent = true;
                }
            }
            Some(Err(err)) => {
                if !sent {
                    let _ = ready_tx.send(Err(eyre!("reading virtiofsd stderr: {err}")));
                    sent = true;
                }
                break;
            }
            None => {
                if !sent {
                    let _ = ready_tx
                        .send(Err(eyre!("virtiofsd did not announce socket connection")));
                    sent = true;
                }
                break;
            }
        }
    }
    // Keep draining so the daemon never blocks on a full pipe.
    for line in lines.flatten() {
        if debug_output {
            debug!(source = "virtiofsd", "{line}");
        }
    }
}

impl VirtiofsdHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the daemon announced its socket or `timeout` elapsed.
    /// Returns the unspent part of the timeout so the caller can put it
    /// toward the rest of the startup budget. The daemon is killed on
    /// failure.
    pub fn wait_ready(&self, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        let outcome = match self.ready_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(eyre!(
                "timed out waiting for virtiofsd (pid={}) socket",
                self.pid
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(eyre!("virtiofsd (pid={}) scanner went away", self.pid))
            }
        };
        if let Err(err) = outcome {
            self.kill();
            return Err(err);
        }
        Ok(timeout.saturating_sub(start.elapsed()))
    }

    fn kill(&self) {
        use rustix::process::{kill_process, Pid, Signal};
        let Some(pid) = Pid::from_raw(self.pid as i32) else {
            return;
        };
        if let Err(err) = kill_process(pid, Signal::KILL) {
            warn!(pid = self.pid, %err, "could not kill virtiofsd");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn supervisor(id: &str, socket: &str, debug: bool) -> VirtiofsdSupervisor {
        VirtiofsdSupervisor {
            binary: "/usr/libexec/virtiofsd".into(),
            socket_path: socket.into(),
            source: Utf8PathBuf::from("test-share-dir").join(id),
            cache: "none".into(),
            debug,
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn test_args_debug() {
        let args = supervisor("foo", "bar1", true).args();
        assert_eq!(
            args.join(" "),
            "-o vhost_user_socket=bar1 -o source=test-share-dir/foo -o cache=none -d"
        );
    }

    #[test]
    fn test_args_foreground() {
        let args = supervisor("foo", "bar2", false).args();
        assert_eq!(
            args.join(" "),
            "-o vhost_user_socket=bar2 -o source=test-share-dir/foo -o cache=none -f"
        );
    }

    #[test]
    fn test_args_extra_appended() {
        let mut sup = supervisor("foo", "bar", false);
        sup.extra_args = vec!["--thread-pool-size=16".to_string()];
        assert!(sup.args().join(" ").ends_with("-f --thread-pool-size=16"));
    }

    #[test]
    fn test_scanner_announces_ready() {
        let (tx, rx) = mpsc::sync_channel(1);
        let stderr = format!("starting up\n{SOCKET_READY_MARKER}\nmore output\n");
        scan_stderr(Cursor::new(stderr), false, &tx);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_scanner_reports_silent_exit() {
        let (tx, rx) = mpsc::sync_channel(1);
        scan_stderr(Cursor::new("some error and gone\n"), false, &tx);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(err.to_string().contains("did not announce"));
    }

    #[test]
    fn test_wait_ready_remaining_budget() {
        let (tx, rx) = mpsc::sync_channel(1);
        tx.send(Ok(())).unwrap();
        let handle = VirtiofsdHandle {
            pid: u32::MAX, // never a live process
            ready_rx: rx,
        };
        let remain = handle.wait_ready(Duration::from_secs(5)).unwrap();
        assert!(remain <= Duration::from_secs(5));
    }
}
