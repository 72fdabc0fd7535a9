//! Ownership wrapper around one spawned `cloudflared` process.
//! Handles spawning with piped output, liveness checks and bounded termination.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::error::SpawnError;

/// Grace period between the termination signal and a forced kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// A live (or recently exited) tunnel process.
///
/// The handle is the only owner of the child. `terminate` consumes it, so a
/// process can never be terminated twice through stale references.
#[derive(Debug)]
pub struct ProcessHandle {
    program: PathBuf,
    pid: Option<u32>,
    child: Child,
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Launches `program` with `args`, piping stdout and stderr.
    ///
    /// `path_env` replaces the child's `PATH` when set. The child is killed if
    /// the handle is dropped without being terminated.
    pub fn spawn(
        program: &Path,
        args: &[String],
        path_env: Option<&str>,
    ) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(path) = path_env {
            debug!("Using PATH for tunnel process: {path}");
            cmd.env("PATH", path);
        }

        let child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(program, e))?;
        let pid = child.id();
        info!("Spawned {} {:?} (pid {:?})", program.display(), args, pid);

        Ok(Self {
            program: program.to_path_buf(),
            pid,
            child,
            exit: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Takes the output pipes. Can only succeed once per process.
    pub fn take_output(&mut self) -> Result<(ChildStdout, ChildStderr), SpawnError> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe { stream: "stdout" })?;
        let stderr = self
            .child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe { stream: "stderr" })?;
        Ok((stdout, stderr))
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// Exit status if the process has exited, without blocking.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit.is_some() {
            return self.exit;
        }
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                self.exit = Some(status);
                self.exit
            }
            Err(e) => {
                // Treat an unreadable status as alive; terminate() still bounds the wait.
                warn!("Failed to poll tunnel process {:?}: {}", self.pid, e);
                None
            }
        }
    }

    /// Sends a graceful termination signal, escalates to a forced kill after
    /// `grace`, and always reaps the child before returning.
    pub async fn terminate(mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit_status() {
            debug!("Tunnel process {:?} already exited", self.pid);
            return Ok(status);
        }

        self.signal_graceful();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "Tunnel process {:?} did not exit within {:?}, killing it",
                    self.pid, grace
                );
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }

    #[cfg(unix)]
    fn signal_graceful(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        // SAFETY: plain kill(2) on a pid we own and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                "Failed to send SIGTERM to {}: {}",
                pid,
                io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn signal_graceful(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to stop tunnel process {:?}: {}", self.pid, e);
        }
    }
}

/// Human-readable exit status: "exited with code 1", "killed by SIGKILL (signal 9)".
pub fn format_exit_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            let name = match sig {
                libc::SIGKILL => "SIGKILL",
                libc::SIGTERM => "SIGTERM",
                libc::SIGSEGV => "SIGSEGV",
                libc::SIGABRT => "SIGABRT",
                libc::SIGINT => "SIGINT",
                _ => return format!("killed by signal {sig}"),
            };
            return format!("killed by {name} (signal {sig})");
        }
    }

    "exited (unknown status)".to_string()
}
