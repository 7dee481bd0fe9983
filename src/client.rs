use crate::paths::Paths;
use crate::pid::{self, DaemonState};
use crate::protocol::{self, Request, Response};
use color_eyre::eyre::{WrapErr, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

/// How long a spawned or still-starting daemon gets to open its socket.
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL: Duration = Duration::from_millis(100);

pub fn send_request(paths: &Paths, request: &Request) -> color_eyre::Result<Response> {
    let mut stream = connect(paths)?;

    let encoded = protocol::encode_request(request)?;
    stream.write_all(&encoded)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.is_empty() {
        bail!("daemon closed the connection without replying");
    }

    Ok(protocol::decode_response(&line)?)
}

/// Connect to the daemon, starting one when the data directory has a config
/// but no live daemon.
fn connect(paths: &Paths) -> color_eyre::Result<UnixStream> {
    let mut spawned = match pid::daemon_state(paths) {
        DaemonState::Ready(_) => {
            if let Ok(stream) = UnixStream::connect(paths.socket_file()) {
                return Ok(stream);
            }
            // Shut down between the state check and the connect.
            None
        }
        DaemonState::Starting(pid) => {
            tracing::debug!(pid, "daemon still starting");
            None
        }
        DaemonState::Stopped => {
            if !paths.config_file().exists() {
                bail!(
                    "no daemon running and no config at {}",
                    paths.config_file().display()
                );
            }
            Some(spawn_daemon(paths)?)
        }
    };
    wait_until_ready(paths, spawned.as_mut(), READY_TIMEOUT)
}

/// The daemon's own output goes to `daemon.log` in the data directory.
fn spawn_daemon(paths: &Paths) -> color_eyre::Result<Child> {
    let exe = std::env::current_exe().wrap_err("failed to get current executable path")?;
    let log_path = paths.daemon_log();
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .wrap_err_with(|| format!("failed to open {}", log_path.display()))?;

    std::process::Command::new(exe)
        .arg("--daemon")
        .env("GAMEHOST_DATA_DIR", paths.data_dir())
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0)
        .spawn()
        .wrap_err("failed to spawn daemon")
}

/// Poll the socket until it accepts a connection. When `spawned` is our own
/// daemon child and it exits first (a bad config, usually), fail right away
/// instead of waiting out the deadline.
fn wait_until_ready(
    paths: &Paths,
    mut spawned: Option<&mut Child>,
    timeout: Duration,
) -> color_eyre::Result<UnixStream> {
    let socket = paths.socket_file();
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(&socket) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(e).wrap_err_with(|| {
                    format!("daemon did not open {} within {timeout:?}", socket.display())
                });
            }
            Err(_) => {}
        }
        if let Some(child) = spawned.as_deref_mut()
            && let Some(status) = child.try_wait()?
        {
            bail!(
                "daemon exited during startup ({status}); see {}",
                paths.daemon_log().display()
            );
        }
        std::thread::sleep(READY_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        (dir, paths)
    }

    #[test]
    fn test_connect_without_config_or_daemon() {
        let (_dir, paths) = paths();
        let err = connect(&paths).unwrap_err();
        assert!(
            err.to_string().contains("no daemon running and no config"),
            "{err}"
        );
    }

    #[test]
    fn test_wait_until_ready_times_out() {
        let (_dir, paths) = paths();
        let started = Instant::now();
        let err = wait_until_ready(&paths, None, Duration::from_millis(250)).unwrap_err();
        assert!(err.to_string().contains("did not open"), "{err}");
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_wait_until_ready_sees_late_socket() {
        let (_dir, paths) = paths();
        let socket = paths.socket_file();
        let binder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            let listener = UnixListener::bind(socket).unwrap();
            let _ = listener.accept();
        });
        assert!(wait_until_ready(&paths, None, Duration::from_secs(5)).is_ok());
        binder.join().unwrap();
    }

    #[test]
    fn test_wait_until_ready_fails_fast_when_child_exits() {
        let (_dir, paths) = paths();
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let started = Instant::now();
        let err = wait_until_ready(&paths, Some(&mut child), Duration::from_secs(10)).unwrap_err();
        assert!(err.to_string().contains("daemon exited during startup"), "{err}");
        assert!(err.to_string().contains("daemon.log"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
