use crate::launch::LaunchSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::watch;

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle stage of one supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Launching,
    Running,
    Stopped,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Launching => write!(f, "launching"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Secrets {
    hostname: String,
    rcon_password: String,
    join_password: String,
    connect_password: String,
}

// ---------------------------------------------------------------------------
// ServerInstance
// ---------------------------------------------------------------------------

/// One supervised game-server child and its metadata.
///
/// Shared between the supervisor task and the registry. Control flags are
/// atomics so readers never block on a running read loop.
pub struct ServerInstance {
    spec: LaunchSpec,
    log_path: PathBuf,
    started_at: chrono::DateTime<chrono::Local>,
    started_instant: std::time::Instant,
    port: AtomicU16,
    pid: AtomicU32,
    last_activity: AtomicI64,
    restart_count: u32,
    recovering: AtomicBool,
    running: AtomicBool,
    being_killed: AtomicBool,
    being_killed_by_owner: AtomicBool,
    hide_stop_message: AtomicBool,
    protected: AtomicBool,
    auto_restart: AtomicBool,
    address: Mutex<Option<String>>,
    secrets: Mutex<Secrets>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill_tx: watch::Sender<bool>,
}

impl ServerInstance {
    pub fn new(
        spec: LaunchSpec,
        log_path: PathBuf,
        restart_count: u32,
        recovering: bool,
    ) -> (Self, watch::Receiver<bool>) {
        let (kill_tx, kill_rx) = watch::channel(false);
        let secrets = Secrets {
            hostname: spec.hostname.clone(),
            rcon_password: spec.credentials.rcon_password.clone(),
            join_password: spec.credentials.connect_password.clone(),
            connect_password: spec.credentials.connect_password.clone(),
        };
        let auto_restart = spec.auto_restart;
        let instance = Self {
            spec,
            log_path,
            started_at: chrono::Local::now(),
            started_instant: std::time::Instant::now(),
            port: AtomicU16::new(0),
            pid: AtomicU32::new(0),
            last_activity: AtomicI64::new(now_millis()),
            restart_count,
            recovering: AtomicBool::new(recovering),
            running: AtomicBool::new(false),
            being_killed: AtomicBool::new(false),
            being_killed_by_owner: AtomicBool::new(false),
            hide_stop_message: AtomicBool::new(false),
            protected: AtomicBool::new(false),
            auto_restart: AtomicBool::new(auto_restart),
            address: Mutex::new(None),
            secrets: Mutex::new(secrets),
            stdin: tokio::sync::Mutex::new(None),
            kill_tx,
        };
        (instance, kill_rx)
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn id(&self) -> &str {
        &self.spec.credentials.id
    }

    pub fn owner(&self) -> &str {
        &self.spec.owner
    }

    pub fn version_name(&self) -> &str {
        &self.spec.version.name
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Local> {
        self.started_at
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_instant.elapsed().as_secs()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    // ----- port / pid / address -----

    /// Port the child reported binding, 0 until known.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn address(&self) -> Option<String> {
        lock(&self.address).clone()
    }

    pub fn set_address(&self, address: String) {
        *lock(&self.address) = Some(address);
    }

    // ----- activity -----

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    /// Move `last_activity` forward to `at`. Never moves it backwards.
    pub fn touch(&self, at: i64) {
        self.last_activity.fetch_max(at, Ordering::SeqCst);
    }

    pub fn touch_now(&self) {
        self.touch(now_millis());
    }

    // ----- control flags -----

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    pub fn clear_recovering(&self) {
        self.recovering.store(false, Ordering::SeqCst);
    }

    pub fn being_killed(&self) -> bool {
        self.being_killed.load(Ordering::SeqCst)
    }

    pub fn being_killed_by_owner(&self) -> bool {
        self.being_killed_by_owner.load(Ordering::SeqCst)
    }

    pub fn hide_stop_message(&self) -> bool {
        self.hide_stop_message.load(Ordering::SeqCst)
    }

    pub fn set_hide_stop_message(&self, hide: bool) {
        self.hide_stop_message.store(hide, Ordering::SeqCst);
    }

    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::SeqCst)
    }

    pub fn set_protected(&self, protected: bool) {
        self.protected.store(protected, Ordering::SeqCst);
    }

    pub fn auto_restart(&self) -> bool {
        self.auto_restart.load(Ordering::SeqCst)
    }

    /// Flag an explicit kill. Explicit kills never auto-restart.
    pub fn mark_killed(&self, by_owner: bool) {
        self.being_killed.store(true, Ordering::SeqCst);
        if by_owner {
            self.being_killed_by_owner.store(true, Ordering::SeqCst);
        }
        self.auto_restart.store(false, Ordering::SeqCst);
    }

    /// Ask the supervisor task to kill the child.
    pub fn request_kill(&self) {
        let _ = self.kill_tx.send(true);
    }

    // ----- credentials -----

    pub fn hostname(&self) -> String {
        lock(&self.secrets).hostname.clone()
    }

    pub fn set_hostname(&self, hostname: &str) {
        lock(&self.secrets).hostname = hostname.to_string();
    }

    pub fn rcon_password(&self) -> String {
        lock(&self.secrets).rcon_password.clone()
    }

    pub fn join_password(&self) -> String {
        lock(&self.secrets).join_password.clone()
    }

    pub fn connect_password(&self) -> String {
        lock(&self.secrets).connect_password.clone()
    }

    pub fn set_rcon_password(&self, value: &str) {
        lock(&self.secrets).rcon_password = value.to_string();
    }

    pub fn set_join_password(&self, value: &str) {
        lock(&self.secrets).join_password = value.to_string();
    }

    pub fn set_connect_password(&self, value: &str) {
        lock(&self.secrets).connect_password = value.to_string();
    }

    // ----- stdin -----

    pub async fn attach_stdin(&self, stdin: ChildStdin) {
        *self.stdin.lock().await = Some(stdin);
    }

    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Write one console line to the child. Fails once stdin is closed.
    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "server console is closed",
            ));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    pub fn summary(&self) -> InstanceSummary {
        let state = if self.is_running() {
            InstanceState::Running
        } else if self.being_killed() {
            InstanceState::Stopped
        } else {
            InstanceState::Launching
        };
        InstanceSummary {
            id: self.id().to_string(),
            port: self.port(),
            owner: self.owner().to_string(),
            hostname: self.hostname(),
            version: self.version_name().to_string(),
            iwad: self.spec.iwad.clone(),
            wads: self.spec.wads.iter().map(|w| w.name.clone()).collect(),
            state,
            pid: self.pid(),
            uptime: self.uptime_secs(),
            restarts: self.restart_count,
            protected: self.is_protected(),
            auto_restart: self.auto_restart(),
            last_activity: self.last_activity(),
        }
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("id", &self.id())
            .field("owner", &self.owner())
            .field("port", &self.port())
            .field("pid", &self.pid())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Read-only view of an instance, sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub port: u16,
    pub owner: String,
    pub hostname: String,
    pub version: String,
    pub iwad: String,
    #[serde(default)]
    pub wads: Vec<String>,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub uptime: u64,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub auto_restart: bool,
    pub last_activity: i64,
}

/// Passwords and log location, shown only to the owner or staff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSecrets {
    pub id: String,
    pub port: u16,
    pub rcon_password: String,
    pub join_password: String,
    pub connect_password: String,
    pub log_path: String,
}

impl ServerInstance {
    pub fn secrets(&self) -> InstanceSecrets {
        let s = lock(&self.secrets).clone();
        InstanceSecrets {
            id: self.id().to_string(),
            port: self.port(),
            rcon_password: s.rcon_password,
            join_password: s.join_password,
            connect_password: s.connect_password,
            log_path: self.log_path.to_string_lossy().into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::fixtures;

    fn instance() -> ServerInstance {
        let mut spec = fixtures::spec("alice");
        spec.auto_restart = true;
        ServerInstance::new(spec, PathBuf::from("/tmp/x.txt"), 0, false).0
    }

    #[test]
    fn test_last_activity_only_moves_forward() {
        let inst = instance();
        let start = inst.last_activity();
        inst.touch(start + 1000);
        assert_eq!(inst.last_activity(), start + 1000);
        inst.touch(start - 5000);
        assert_eq!(inst.last_activity(), start + 1000);
    }

    #[test]
    fn test_mark_killed_disables_auto_restart() {
        let inst = instance();
        assert!(inst.auto_restart());
        inst.mark_killed(true);
        assert!(inst.being_killed());
        assert!(inst.being_killed_by_owner());
        assert!(!inst.auto_restart());
    }

    #[test]
    fn test_mark_killed_by_staff_is_not_owner_kill() {
        let inst = instance();
        inst.mark_killed(false);
        assert!(inst.being_killed());
        assert!(!inst.being_killed_by_owner());
    }

    #[test]
    fn test_passwords_start_from_credentials() {
        let inst = instance();
        assert_eq!(inst.rcon_password(), "0123456789abcdef");
        assert_eq!(inst.connect_password(), "0123456789abcdef");
        assert_eq!(inst.join_password(), inst.connect_password());
        inst.set_join_password("hunter22");
        assert_eq!(inst.secrets().join_password, "hunter22");
    }

    #[test]
    fn test_pid_zero_means_none() {
        let inst = instance();
        assert_eq!(inst.pid(), None);
        inst.set_pid(Some(42));
        assert_eq!(inst.pid(), Some(42));
    }

    #[test]
    fn test_summary_reflects_state() {
        let inst = instance();
        inst.set_port(10666);
        assert_eq!(inst.summary().state, InstanceState::Launching);
        inst.mark_running();
        let summary = inst.summary();
        assert_eq!(summary.state, InstanceState::Running);
        assert_eq!(summary.port, 10666);
        assert_eq!(summary.owner, "alice");
        assert_eq!(summary.hostname, "Test");
    }

    #[tokio::test]
    async fn test_write_line_without_stdin_fails() {
        let inst = instance();
        let err = inst.write_line("say hi").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
