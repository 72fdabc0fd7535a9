//! Local port inspection through the OS listener table.
//!
//! On Linux the listener table is read from `/proc/net/tcp{,6}` and socket
//! owners are found through `/proc/<pid>/fd`. Elsewhere `lsof` is queried.
//! Every query runs on the blocking pool under a bounded timeout.

use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::error::ProbeError;
use crate::platform::{PortProbe, PortReaper};

/// Upper bound for a single listener-table query.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// [`PortProbe`] and [`PortReaper`] backed by the host's listener table.
#[derive(Debug, Clone)]
pub struct SystemPorts {
    timeout: Duration,
}

impl Default for SystemPorts {
    fn default() -> Self {
        Self::new(PROBE_TIMEOUT)
    }
}

impl SystemPorts {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Whether a TCP listener is bound to `port`.
    pub async fn query(&self, port: u16) -> Result<bool, ProbeError> {
        self.run_blocking(move || sys::is_listening(port)).await
    }

    /// Pids of processes holding a TCP listener on `port`.
    pub async fn listener_pids(&self, port: u16) -> Result<Vec<u32>, ProbeError> {
        self.run_blocking(move || sys::listener_pids(port)).await
    }

    async fn run_blocking<T, F>(&self, job: F) -> Result<T, ProbeError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ProbeError> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(job)).await {
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
            Ok(Err(join)) => Err(ProbeError::Query(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

#[async_trait]
impl PortProbe for SystemPorts {
    async fn is_port_active(&self, port: u16) -> bool {
        match self.query(port).await {
            Ok(active) => active,
            Err(e) => {
                warn!("Port probe for {} failed, treating as inactive: {}", port, e);
                false
            }
        }
    }
}

#[async_trait]
impl PortReaper for SystemPorts {
    async fn clear_port(&self, port: u16) -> usize {
        let pids = match self.listener_pids(port).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!("Could not list processes on port {}: {}", port, e);
                return 0;
            }
        };

        let own = std::process::id();
        pids.into_iter()
            .filter(|pid| *pid != own)
            .filter(|pid| force_kill(*pid, port))
            .count()
    }
}

#[cfg(unix)]
fn force_kill(pid: u32, port: u16) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        info!("Killed process {} still bound to port {}", pid, port);
        true
    } else {
        warn!(
            "Failed to kill process {} on port {}: {}",
            pid,
            port,
            std::io::Error::last_os_error()
        );
        false
    }
}

#[cfg(not(unix))]
fn force_kill(pid: u32, port: u16) -> bool {
    warn!("Cannot kill process {} on port {} on this platform", pid, port);
    false
}

#[cfg(target_os = "linux")]
mod sys {
    use std::collections::HashSet;
    use std::fs;
    use std::io;

    use crate::error::ProbeError;

    const TABLES: &[&str] = &["/proc/net/tcp", "/proc/net/tcp6"];
    const TCP_LISTEN: &str = "0A";

    pub fn is_listening(port: u16) -> Result<bool, ProbeError> {
        Ok(!listening_inodes(port)?.is_empty())
    }

    pub fn listener_pids(port: u16) -> Result<Vec<u32>, ProbeError> {
        let inodes = listening_inodes(port)?;
        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut pids = Vec::new();
        for entry in fs::read_dir("/proc")?.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes of other users are unreadable; skip them.
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let holds_socket = fds.flatten().any(|fd| {
                fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| socket_inode(&target.to_string_lossy()))
                    .is_some_and(|inode| inodes.contains(&inode))
            });
            if holds_socket {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    fn listening_inodes(port: u16) -> Result<HashSet<u64>, ProbeError> {
        let mut inodes = HashSet::new();
        let mut read_any = false;

        for table in TABLES {
            match fs::read_to_string(table) {
                Ok(contents) => {
                    read_any = true;
                    inodes.extend(parse_listener_table(&contents, port));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !read_any {
            return Err(ProbeError::Query("no TCP listener table available".into()));
        }
        Ok(inodes)
    }

    /// Inodes of sockets in LISTEN state on `port` in one `/proc/net/tcp*` table.
    pub(super) fn parse_listener_table(contents: &str, port: u16) -> Vec<u64> {
        contents
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[3] != TCP_LISTEN {
                    return None;
                }
                let (_, port_hex) = fields[1].rsplit_once(':')?;
                if u16::from_str_radix(port_hex, 16).ok()? != port {
                    return None;
                }
                fields[9].parse().ok()
            })
            .collect()
    }

    fn socket_inode(link: &str) -> Option<u64> {
        link.strip_prefix("socket:[")?
            .strip_suffix(']')?
            .parse()
            .ok()
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::process::Command;

    use crate::error::ProbeError;

    pub fn is_listening(port: u16) -> Result<bool, ProbeError> {
        Ok(!listener_pids(port)?.is_empty())
    }

    pub fn listener_pids(port: u16) -> Result<Vec<u32>, ProbeError> {
        let filter = format!("-iTCP:{port}");
        let output = Command::new("lsof")
            .args(["-nP", "-t", filter.as_str(), "-sTCP:LISTEN"])
            .output()?;

        // lsof exits 1 when nothing matches.
        if !output.status.success() && !output.stderr.is_empty() {
            return Err(ProbeError::Query(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }
}
