use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

#[derive(Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var("GAMEHOST_DATA_DIR") {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self {
            data_dir: base.join("gamehost"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("gamehost.pid")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.data_dir.join("gamehost.sock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("gamehost.toml")
    }

    /// Output of a daemon the client started in the background.
    pub fn daemon_log(&self) -> PathBuf {
        self.data_dir.join("daemon.log")
    }

    /// Default directory for instance logs when the config does not set one.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Per-instance log file, named after the instance's unique id.
pub fn instance_log(log_dir: &Path, id: &str) -> PathBuf {
    log_dir.join(format!("{id}.txt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_data_dir_linux() {
        let paths = Paths::new().unwrap();
        let data_dir = paths.data_dir().to_str().unwrap();
        assert!(
            data_dir.ends_with(".local/share/gamehost") || data_dir.contains("gamehost"),
            "expected Linux data dir, got: {data_dir}"
        );
    }

    #[test]
    fn test_pid_file_under_data_dir() {
        let paths = Paths::with_base(PathBuf::from("/tmp/gamehost-test"));
        let pid = paths.pid_file();
        assert!(pid.starts_with(paths.data_dir()));
        assert!(pid.ends_with("gamehost.pid"));
    }

    #[test]
    fn test_socket_and_config_under_data_dir() {
        let paths = Paths::with_base(PathBuf::from("/tmp/gamehost-test"));
        assert!(paths.socket_file().ends_with("gamehost.sock"));
        assert!(paths.config_file().ends_with("gamehost.toml"));
        assert!(paths.log_dir().ends_with("logs"));
        assert!(paths.daemon_log().ends_with("daemon.log"));
    }

    #[test]
    fn test_instance_log_uses_id() {
        let log = instance_log(Path::new("/srv/logs"), "abcd1234");
        assert_eq!(log, PathBuf::from("/srv/logs/abcd1234.txt"));
    }
}
