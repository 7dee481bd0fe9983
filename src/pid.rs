//! Daemon liveness.
//!
//! The pid file says which process owns the data directory; the socket says
//! whether that process is serving requests yet. A daemon that wrote its pid
//! but is still loading its config or killing leftover servers is
//! [`DaemonState::Starting`].

use crate::paths::Paths;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use std::fs;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PidError {
    #[error("daemon is already running (pid {0})")]
    AlreadyRunning(u32),
    #[error("pid file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// No pid file, or one left behind by a dead process.
    Stopped,
    /// The process is alive but its socket does not accept connections.
    Starting(u32),
    Ready(u32),
}

fn read_pid(paths: &Paths) -> Option<u32> {
    fs::read_to_string(paths.pid_file())
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // EPERM: the process exists but belongs to someone else.
    matches!(signal::kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Inspect the data directory. A pid file naming a dead process is removed
/// along with the socket it left behind.
pub fn daemon_state(paths: &Paths) -> DaemonState {
    let Some(pid) = read_pid(paths) else {
        return DaemonState::Stopped;
    };
    if !is_alive(pid) {
        tracing::debug!(pid, "removing stale pid file");
        let _ = fs::remove_file(paths.pid_file());
        let _ = fs::remove_file(paths.socket_file());
        return DaemonState::Stopped;
    }
    if UnixStream::connect(paths.socket_file()).is_ok() {
        DaemonState::Ready(pid)
    } else {
        DaemonState::Starting(pid)
    }
}

/// The running daemon's claim on the data directory. Dropping it removes
/// the pid file, unless another process has rewritten it since.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    pub fn claim(paths: &Paths) -> Result<Self, PidError> {
        let path = paths.pid_file();
        let io_err = |source| PidError::Io {
            path: path.clone(),
            source,
        };
        match daemon_state(paths) {
            DaemonState::Stopped => {}
            DaemonState::Starting(pid) | DaemonState::Ready(pid) => {
                return Err(PidError::AlreadyRunning(pid));
            }
        }

        let pid = std::process::id();
        // create_new: of two daemons racing past the state check only one wins.
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(PidError::AlreadyRunning(read_pid(paths).unwrap_or(0)));
            }
            Err(e) => return Err(io_err(e)),
        };
        file.write_all(pid.to_string().as_bytes()).map_err(io_err)?;
        Ok(Self { path, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            == Some(self.pid);
        if ours {
            let _ = fs::remove_file(&self.path);
        }
    }
}
