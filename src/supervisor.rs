use crate::account::AccountLevel;
use crate::config::Config;
use crate::dispatch;
use crate::instance::ServerInstance;
use crate::launch::{
    FlagValue, Gamemode, LaunchSpec, WadLocation, WadRef, clean_file_name, dedup_preserving_order,
};
use crate::log::{self, Banner, InstanceLog, OutputPipe, format_uptime_long};
use crate::notify::Notifier;
use crate::paths;
use crate::ports::{PortAllocator, PortReservation};
use crate::recognizer::{Credential, LineRecognizer, LogEvent};
use crate::registry::ServerRegistry;
use crate::reputation::ReputationChecker;
use crate::store::Persistence;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

const LINE_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("working directory {0} does not exist")]
    MissingWorkingDir(PathBuf),
    #[error("failed to spawn server: {0}")]
    Spawn(std::io::Error),
    #[error("failed to create output pipe: {0}")]
    OutputPipe(std::io::Error),
    #[error("failed to prepare per-owner files: {0}")]
    OwnerFiles(std::io::Error),
    #[error("failed to open instance log: {0}")]
    LogFile(std::io::Error),
    #[error("invalid log recognizer: {0}")]
    Recognizer(#[from] regex::Error),
    #[error(transparent)]
    Reputation(#[from] crate::reputation::ReputationError),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Instances whose process is up but which have not reported startup yet.
#[derive(Debug, Clone, Default)]
pub struct LaunchingSet {
    inner: Arc<Mutex<HashMap<String, Arc<ServerInstance>>>>,
}

impl LaunchingSet {
    fn insert(&self, instance: &Arc<ServerInstance>) {
        self.lock()
            .insert(instance.id().to_string(), Arc::clone(instance));
    }

    fn remove(&self, instance: &ServerInstance) {
        self.lock().remove(instance.id());
    }

    pub fn snapshot(&self) -> Vec<Arc<ServerInstance>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ServerInstance>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything a supervisor task needs; cheap to clone.
#[derive(Clone)]
pub struct SupervisorContext {
    pub config: Arc<Config>,
    pub registry: ServerRegistry,
    pub store: Arc<dyn Persistence>,
    pub notifier: Arc<dyn Notifier>,
    pub ports: PortAllocator,
    pub log_dir: PathBuf,
    pub recognizer: Arc<LineRecognizer>,
    pub reputation: Option<Arc<ReputationChecker>>,
    pub launching: LaunchingSet,
}

impl SupervisorContext {
    pub fn new(
        config: Arc<Config>,
        registry: ServerRegistry,
        store: Arc<dyn Persistence>,
        notifier: Arc<dyn Notifier>,
        ports: PortAllocator,
        log_dir: PathBuf,
    ) -> Result<Self, SupervisorError> {
        let reputation = if config.reputation.enabled {
            Some(Arc::new(ReputationChecker::new(config.reputation.clone())?))
        } else {
            None
        };
        Ok(Self {
            config,
            registry,
            store,
            notifier,
            ports,
            log_dir,
            recognizer: Arc::new(LineRecognizer::new()?),
            reputation,
            launching: LaunchingSet::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Argument vector
// ---------------------------------------------------------------------------

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn owner_file(dir: &Path, owner: &str) -> PathBuf {
    dir.join(format!("{}.txt", clean_file_name(owner)))
}

/// Wads passed with `-file`, in load order: bundled data first (when asked
/// for), then the user's wads, then the configured extras, deduplicated.
pub fn load_order(config: &Config, spec: &LaunchSpec) -> Vec<WadRef> {
    let mut wads = Vec::new();
    if spec.include_data {
        wads.extend(spec.version.data.iter().map(|d| WadRef::wad(d)));
    }
    wads.extend(spec.wads.iter().cloned());
    wads.extend(config.host.extra_wads.iter().map(|w| WadRef::wad(w)));
    dedup_preserving_order(wads)
}

/// Command line for one launch. Deterministic for a given spec and port.
pub fn build_argv(config: &Config, spec: &LaunchSpec, port: u16) -> Vec<String> {
    let host = &config.host;
    let mut argv = vec![path_arg(&spec.version.path)];
    let mut param = |name: &str, value: String| {
        argv.push(name.to_string());
        argv.push(value);
    };

    param("-port", port.to_string());
    param("+exec", path_arg(&host.config_dir.join("global.cfg")));
    param("-iwad", path_arg(&host.iwad_dir.join(&spec.iwad)));

    for wad in load_order(config, spec) {
        let in_iwad_dir = wad.location == WadLocation::IwadDir
            || host.iwads.iter().any(|i| i.eq_ignore_ascii_case(&wad.name));
        let dir = if in_iwad_dir {
            &host.iwad_dir
        } else {
            &host.wad_dir
        };
        param("-file", path_arg(&dir.join(&wad.name)));
    }
    for wad in &spec.optional_wads {
        param("-optfile", path_arg(&host.wad_dir.join(wad)));
    }

    let mut maps = spec.maps.iter();
    if let Some(first) = maps.next() {
        param("+map", first.clone());
    }
    for map in maps {
        param("+addmap", map.clone());
    }

    param("+skill", spec.skill_or_default().to_string());

    match spec.gamemode {
        Some(Gamemode::Cooperative) => param("+cooperative", "1".to_string()),
        Some(mode) => {
            param("+cooperative", "0".to_string());
            param(&format!("+{}", mode.cvar()), "1".to_string());
        }
        None => {}
    }

    for (name, value) in &spec.flags {
        if let FlagValue::Mask(mask) = value
            && *mask > 0
        {
            param(&format!("+{name}"), mask.to_string());
        }
    }
    if spec.instagib {
        param("+instagib", "1".to_string());
    }
    if spec.buckshot {
        param("+buckshot", "1".to_string());
    }
    for (name, value) in &spec.flags {
        if let FlagValue::Toggle(on) = value {
            param(&format!("+sv_{name}"), u8::from(*on).to_string());
        }
    }

    if let Some(cfg) = &spec.config {
        param("+exec", path_arg(&host.config_dir.join(cfg)));
    }

    param(
        "+sv_hostname",
        format!("{} {}", host.hostname_base, spec.hostname),
    );
    param("+sv_rconpassword", spec.credentials.rcon_password.clone());
    param("+sv_password", spec.credentials.connect_password.clone());
    param("+sv_joinpassword", spec.credentials.connect_password.clone());
    param(
        "+sv_banfile",
        path_arg(&owner_file(&host.banlist_dir, &spec.owner)),
    );
    param(
        "+sv_adminlistfile",
        path_arg(&owner_file(&host.adminlist_dir, &spec.owner)),
    );
    param(
        "+sv_banexemptionfile",
        path_arg(&owner_file(&host.whitelist_dir, &spec.owner)),
    );

    argv.push("-host".to_string());
    argv
}

/// Create the owner's ban, admin and whitelist files if they are missing.
pub fn ensure_owner_files(config: &Config, owner: &str) -> std::io::Result<()> {
    let host = &config.host;
    for dir in [&host.banlist_dir, &host.adminlist_dir, &host.whitelist_dir] {
        std::fs::create_dir_all(dir)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(owner_file(dir, owner))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

struct Launched {
    instance: Arc<ServerInstance>,
    child: Child,
    output: pipe::Receiver,
    kill_rx: watch::Receiver<bool>,
    log: InstanceLog,
    reservation: PortReservation,
}

/// Spawn the server for `spec` on the reserved port and hand it to a
/// supervisor task. Returns once the process is running; startup is
/// reported later through the notifier and the registry.
pub async fn start(
    ctx: &SupervisorContext,
    spec: LaunchSpec,
    restart_count: u32,
    recovering: bool,
    reservation: PortReservation,
) -> Result<Arc<ServerInstance>, SupervisorError> {
    let launched = launch(ctx, spec, restart_count, recovering, reservation).await?;
    let instance = Arc::clone(&launched.instance);
    tokio::spawn(supervise(ctx.clone(), launched));
    Ok(instance)
}

async fn launch(
    ctx: &SupervisorContext,
    spec: LaunchSpec,
    restart_count: u32,
    recovering: bool,
    reservation: PortReservation,
) -> Result<Launched, SupervisorError> {
    let port = reservation.port();
    let argv = build_argv(&ctx.config, &spec, port);

    let workdir = spec
        .version
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    if !workdir.is_dir() {
        return Err(SupervisorError::MissingWorkingDir(workdir));
    }

    ensure_owner_files(&ctx.config, &spec.owner).map_err(SupervisorError::OwnerFiles)?;

    let OutputPipe {
        reader: output,
        stdout,
        stderr,
    } = OutputPipe::new().map_err(SupervisorError::OutputPipe)?;

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(&workdir)
        .stdin(std::process::Stdio::piped())
        .stdout(stdout)
        .stderr(stderr);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
    // Closes the parent's write ends so the reader sees EOF when the child exits.
    drop(cmd);

    let log_path = paths::instance_log(&ctx.log_dir, &spec.credentials.id);
    let (instance, kill_rx) = ServerInstance::new(spec, log_path, restart_count, recovering);
    instance.set_pid(child.id());
    if let Some(stdin) = child.stdin.take() {
        instance.attach_stdin(stdin).await;
    }

    let banner = Banner {
        owner: instance.owner(),
        service: &ctx.config.service.name,
        node: &ctx.config.service.node,
        argv: &argv,
    };
    let log = match InstanceLog::create(instance.log_path(), &banner, instance.started_at()).await {
        Ok(log) => log,
        Err(e) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(SupervisorError::LogFile(e));
        }
    };

    let instance = Arc::new(instance);
    ctx.launching.insert(&instance);
    tracing::info!(
        id = instance.id(),
        owner = instance.owner(),
        version = instance.version_name(),
        port,
        pid = ?instance.pid(),
        restarts = restart_count,
        "server launched"
    );

    Ok(Launched {
        instance,
        child,
        output,
        kill_rx,
        log,
        reservation,
    })
}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

async fn supervise(ctx: SupervisorContext, mut launched: Launched) {
    loop {
        let Launched {
            instance,
            child,
            output,
            kill_rx,
            log,
            reservation,
        } = launched;
        let launch_port = reservation.port();

        let bound = run(&ctx, &instance, child, output, kill_rx, log, reservation).await;
        report_exit(&ctx, &instance, bound).await;

        let removed = ctx.registry.remove(&instance).await;
        tracing::debug!(id = instance.id(), port = bound, removed, "server left registry");

        let max = ctx.config.host.max_restarts;
        if !(instance.auto_restart()
            && !instance.being_killed()
            && bound != 0
            && instance.restart_count() < max)
        {
            return;
        }

        let Some(reservation) = reserve_for_restart(&ctx.ports, bound, launch_port) else {
            ctx.notifier.error(&format!(
                "{}'s server '{}' could not be restarted: no free port",
                instance.owner(),
                instance.hostname()
            ));
            return;
        };

        let mut spec = instance.spec().clone();
        spec.requested_port = Some(bound);
        let attempt = instance.restart_count() + 1;
        tracing::info!(id = instance.id(), port = bound, attempt, max, "restarting server");
        ctx.notifier.owner(
            instance.owner(),
            &format!(
                "Server '{}' is being restarted (attempt {attempt} of {max}).",
                instance.hostname()
            ),
        );

        launched = match launch(&ctx, spec, attempt, false, reservation).await {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(id = instance.id(), error = %e, "restart failed");
                ctx.notifier
                    .error(&format!("Server '{}' failed to restart: {e}", instance.hostname()));
                return;
            }
        };
    }
}

fn reserve_for_restart(ports: &PortAllocator, bound: u16, launch_port: u16) -> Option<PortReservation> {
    ports
        .reserve(bound)
        .or_else(|_| ports.reserve(launch_port))
        .ok()
        .or_else(|| ports.reserve_first_available())
}

/// Read loop over the merged stdout/stderr stream. Returns the port the
/// server reported, 0 if it never did.
async fn run(
    ctx: &SupervisorContext,
    instance: &Arc<ServerInstance>,
    mut child: Child,
    output: pipe::Receiver,
    mut kill_rx: watch::Receiver<bool>,
    mut log: InstanceLog,
    reservation: PortReservation,
) -> u16 {
    let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);
    log::spawn_line_forwarder(output, tx);

    let mut reservation = Some(reservation);
    let mut kill_watch = true;

    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = log.line(line.trim_end()).await {
                    tracing::warn!(id = instance.id(), error = %e, "instance log write failed");
                }
                for event in ctx.recognizer.recognize(&line) {
                    apply_event(ctx, instance, event, &mut reservation).await;
                }
            }
            changed = kill_rx.changed(), if kill_watch => {
                match changed {
                    Ok(()) if *kill_rx.borrow() => {
                        if let Err(e) = child.start_kill() {
                            tracing::debug!(id = instance.id(), error = %e, "start_kill failed");
                        }
                    }
                    Ok(()) => {}
                    Err(_) => kill_watch = false,
                }
            }
        }
    }

    if let Err(e) = child.wait().await {
        tracing::warn!(id = instance.id(), error = %e, "waiting for server exit failed");
    }
    drop(reservation);

    let uptime = instance.uptime_secs();
    if let Err(e) = log.finish(uptime).await {
        tracing::warn!(id = instance.id(), error = %e, "instance log footer failed");
    }
    instance.close_stdin().await;
    instance.set_pid(None);
    ctx.launching.remove(instance);
    instance.port()
}

async fn apply_event(
    ctx: &SupervisorContext,
    instance: &Arc<ServerInstance>,
    event: LogEvent,
    reservation: &mut Option<PortReservation>,
) {
    match event {
        LogEvent::AlternatePort(port) | LogEvent::BindRetry { port } => {
            // The registry key is fixed once the server is running.
            if instance.is_running() {
                tracing::warn!(id = instance.id(), port, "port change after startup ignored");
            } else {
                instance.set_port(port);
            }
        }
        LogEvent::BoundAddress(address) => instance.set_address(address),
        LogEvent::Initialized => {
            if instance.is_running() {
                return;
            }
            if instance.port() == 0
                && let Some(r) = reservation.as_ref()
            {
                instance.set_port(r.port());
            }
            on_started(ctx, instance).await;
            // The server now holds its port and the registry tracks it.
            reservation.take();
        }
        LogEvent::PlayerSeen {
            name,
            ip,
            check_reputation,
        } => on_player(ctx, instance, &name, &ip, check_reputation).await,
        LogEvent::CredentialChanged { credential, value } => {
            on_credential(ctx, instance, credential, &value).await;
        }
        LogEvent::Activity => instance.touch_now(),
    }
}

fn connect_uri(ctx: &SupervisorContext, instance: &ServerInstance) -> String {
    let address = instance
        .address()
        .unwrap_or_else(|| format!("{}:{}", ctx.config.host.game_address, instance.port()));
    format!("zds://{address}/za")
}

async fn on_started(ctx: &SupervisorContext, instance: &Arc<ServerInstance>) {
    instance.mark_running();

    // A live instance is always in `launching` or the registry.
    let inserted = ctx.registry.insert(Arc::clone(instance)).await;
    ctx.launching.remove(instance);
    if let Err(e) = inserted {
        tracing::error!(id = instance.id(), error = %e, "could not register started server");
        ctx.notifier.error(&format!(
            "{}'s server '{}' could not be registered: {e}",
            instance.owner(),
            instance.hostname()
        ));
        instance.set_hide_stop_message(true);
        instance.mark_killed(false);
        kill_process(instance);
        return;
    }

    let port = instance.port();
    let hostname = instance.hostname();
    if instance.is_recovering() {
        tracing::info!(id = instance.id(), port, "recovered server started");
    } else {
        tracing::info!(id = instance.id(), owner = instance.owner(), port, "server started");
        let owner = instance.owner();
        let n = &ctx.notifier;
        n.owner(
            owner,
            &format!(
                "Server '{hostname}' started successfully on port {port}! {}",
                connect_uri(ctx, instance)
            ),
        );
        n.owner(
            owner,
            &format!("To kill your server, type: kill {port}"),
        );
        n.owner(
            owner,
            &format!(
                "Your unique server ID is: {}. You can view your logfile at {}",
                instance.id(),
                instance.log_path().display()
            ),
        );
        n.owner(
            owner,
            &format!(
                "Your RCON password is {}. Your server's connect and join passwords are {} if you have either of those enabled.",
                instance.rcon_password(),
                instance.connect_password()
            ),
        );
        if let Err(e) = ctx
            .store
            .record_server_started(&hostname, instance.id(), owner)
        {
            tracing::warn!(id = instance.id(), error = %e, "could not record server start");
        }
    }
    instance.clear_recovering();
}

async fn on_player(
    ctx: &SupervisorContext,
    instance: &Arc<ServerInstance>,
    name: &str,
    ip: &str,
    check_reputation: bool,
) {
    match ctx.store.is_whitelisted(ip) {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => tracing::warn!(%ip, error = %e, "whitelist lookup failed"),
    }

    let short = ctx.config.service.short.clone();
    if check_reputation
        && let Some(checker) = ctx.reputation.as_ref().filter(|c| c.is_enabled())
    {
        let checker = Arc::clone(checker);
        let target = Arc::clone(instance);
        let ip = ip.to_string();
        let short = short.clone();
        tokio::spawn(async move {
            if checker.should_ban(&ip).await {
                tracing::warn!(%ip, port = target.port(), "proxy connection banned");
                if let Err(e) = target
                    .write_line(&dispatch::proxy_ban_command(&ip, &short))
                    .await
                {
                    tracing::debug!(error = %e, "proxy ban not delivered");
                }
            }
        });
    }

    match ctx.store.check_banned(ip) {
        Ok(Some(reason)) => {
            tracing::error!(
                player = name,
                %ip,
                owner = instance.owner(),
                port = instance.port(),
                %reason,
                "globally banned player kicked"
            );
            if let Err(e) = instance
                .write_line(&dispatch::ban_command(ip, &short, &reason))
                .await
            {
                tracing::warn!(error = %e, "ban command not delivered");
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(%ip, error = %e, "ban lookup failed"),
    }
}

async fn on_credential(
    ctx: &SupervisorContext,
    instance: &Arc<ServerInstance>,
    credential: Credential,
    value: &str,
) {
    if value.trim().is_empty() {
        return;
    }
    let port = instance.port();
    let hostname = instance.hostname();

    if credential == Credential::Hostname {
        if hostname == value {
            return;
        }
        instance.set_hostname(value);
        if !instance.spec().owner_level.at_least(AccountLevel::Vip) {
            let enforced = format!(
                "sv_hostname \"{} {}\";",
                ctx.config.host.hostname_base,
                dispatch::escape_quotes(value)
            );
            if let Err(e) = instance.write_line(&enforced).await {
                tracing::warn!(error = %e, "hostname prefix not enforced");
            }
        }
        tracing::info!(owner = instance.owner(), port, hostname = value, "hostname changed");
        ctx.notifier.owner(
            instance.owner(),
            &format!("Hostname for '{hostname}' on port {port} has been changed to: '{value}'"),
        );
        return;
    }

    let min = ctx.config.host.password_min_length;
    if value.chars().count() < min {
        ctx.notifier.error(&format!(
            "{} change for '{hostname}' on port {port} failed: Must be {min} or more characters!",
            credential.label()
        ));
        return;
    }
    let old = match credential {
        Credential::RconPassword => instance.rcon_password(),
        Credential::JoinPassword => instance.join_password(),
        Credential::ConnectPassword => instance.connect_password(),
        Credential::Hostname => return,
    };
    if old == value {
        return;
    }
    match credential {
        Credential::RconPassword => instance.set_rcon_password(value),
        Credential::JoinPassword => instance.set_join_password(value),
        Credential::ConnectPassword => instance.set_connect_password(value),
        Credential::Hostname => {}
    }
    ctx.notifier.owner(
        instance.owner(),
        &format!(
            "{} for '{hostname}' on port {port} has been changed to: '{value}'",
            credential.label()
        ),
    );
}

async fn report_exit(ctx: &SupervisorContext, instance: &ServerInstance, port: u16) {
    if instance.hide_stop_message() {
        return;
    }
    let hostname = instance.hostname();
    let owner = instance.owner();
    let ran = format_uptime_long(instance.uptime_secs());

    if port != 0 {
        if instance.being_killed() {
            let msg = format!("Server '{hostname}' on port {port} stopped! Server ran for {ran}");
            ctx.notifier.owner(owner, &msg);
            if !instance.being_killed_by_owner() {
                ctx.notifier.moderation(&format!("{owner}'s server '{hostname}' on port {port} stopped! Server ran for {ran}"));
            }
        } else {
            ctx.notifier.owner(
                owner,
                &format!("Server '{hostname}' on port {port} crashed! Server ran for {ran}"),
            );
            ctx.notifier.error(&format!(
                "{owner}'s server '{hostname}' on port {port} crashed! Server ran for {ran}"
            ));
            tracing::error!(
                %owner,
                port,
                log = %instance.log_path().display(),
                "server crashed"
            );
        }
    } else if !instance.is_recovering() {
        ctx.notifier.owner(
            owner,
            &format!(
                "Server '{hostname}' was unable to start. This is most likely due to a wad error, incorrect load order, missing required wads or requires a later game version. See your log file for more details."
            ),
        );
        ctx.notifier.owner(
            owner,
            &format!("You can view your logfile at {}", instance.log_path().display()),
        );
        tracing::info!(%owner, hostname = %hostname, "server was unable to start");
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// SIGKILL the server's process group, then the pid itself. Returns false
/// when no signal could be delivered.
fn kill_process(instance: &ServerInstance) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::Pid;

        if let Some(raw) = instance.pid() {
            let pid = Pid::from_raw(raw as i32);
            if killpg(pid, Signal::SIGKILL)
                .or_else(|_| kill(pid, Signal::SIGKILL))
                .is_ok()
            {
                return true;
            }
        }
    }
    instance.request_kill();
    false
}

/// Remove from the registry, then kill. Safe to call repeatedly and while
/// the read loop is exiting on its own. Returns whether this call removed
/// the instance from the registry.
pub async fn terminate(registry: &ServerRegistry, instance: &Arc<ServerInstance>) -> bool {
    let removed = registry.remove(instance).await;
    if !kill_process(instance) {
        tracing::debug!(id = instance.id(), "signal delivery failed, asked supervisor to kill");
    }
    removed
}

/// Explicit kill: never restarts.
pub async fn kill(registry: &ServerRegistry, instance: &Arc<ServerInstance>, by_owner: bool) -> bool {
    instance.mark_killed(by_owner);
    terminate(registry, instance).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::fixtures;

    fn argv_for(edit: impl FnOnce(&mut LaunchSpec)) -> Vec<String> {
        let config = fixtures::config(Path::new("/srv"), 10666, 10700);
        let mut spec = fixtures::spec("alice");
        edit(&mut spec);
        build_argv(&config, &spec, 10666)
    }

    fn position(argv: &[String], needle: &str) -> usize {
        argv.iter()
            .position(|a| a == needle)
            .unwrap_or_else(|| panic!("{needle} missing from {argv:?}"))
    }

    #[test]
    fn test_argv_fixed_prefix_and_suffix() {
        let argv = argv_for(|_| {});
        assert_eq!(argv[0], "/opt/zandronum/zandronum-server");
        assert_eq!(&argv[1..3], ["-port", "10666"]);
        assert_eq!(&argv[3..5], ["+exec", "/srv/cfg/global.cfg"]);
        assert_eq!(&argv[5..7], ["-iwad", "/srv/iwads/doom2.wad"]);
        assert_eq!(argv.last().unwrap(), "-host");

        let n = argv.len();
        assert_eq!(
            &argv[n - 15..n - 1],
            [
                "+sv_hostname",
                "[T] Test",
                "+sv_rconpassword",
                "0123456789abcdef",
                "+sv_password",
                "0123456789abcdef",
                "+sv_joinpassword",
                "0123456789abcdef",
                "+sv_banfile",
                "/srv/bans/alice.txt",
                "+sv_adminlistfile",
                "/srv/admins/alice.txt",
                "+sv_banexemptionfile",
                "/srv/white/alice.txt",
            ]
        );
    }

    #[test]
    fn test_argv_defaults_skill_and_omits_gamemode() {
        let argv = argv_for(|_| {});
        let i = position(&argv, "+skill");
        assert_eq!(argv[i + 1], "3");
        assert!(!argv.contains(&"+cooperative".to_string()));
    }

    #[test]
    fn test_argv_gamemode() {
        let argv = argv_for(|s| s.gamemode = Some(Gamemode::Ctf));
        let i = position(&argv, "+cooperative");
        assert_eq!(&argv[i..i + 4], ["+cooperative", "0", "+ctf", "1"]);

        let argv = argv_for(|s| s.gamemode = Some(Gamemode::Cooperative));
        let i = position(&argv, "+cooperative");
        assert_eq!(argv[i + 1], "1");
        assert_eq!(argv.iter().filter(|a| *a == "+cooperative").count(), 1);
    }

    #[test]
    fn test_argv_wad_order_data_first_extras_last_deduped() {
        let mut config = fixtures::config(Path::new("/srv"), 10666, 10700);
        config.host.extra_wads = vec!["c.wad".to_string(), "a.wad".to_string()];
        let mut spec = fixtures::spec("alice");
        spec.include_data = true;
        spec.version.data = vec!["data.pk3".to_string()];
        spec.wads = vec![WadRef::wad("a.wad"), WadRef::wad("b.wad"), WadRef::wad("a.wad")];

        let names: Vec<String> = load_order(&config, &spec).into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["data.pk3", "a.wad", "b.wad", "c.wad"]);

        let argv = build_argv(&config, &spec, 10666);
        let files: Vec<&String> = argv
            .windows(2)
            .filter(|w| w[0] == "-file")
            .map(|w| &w[1])
            .collect();
        assert_eq!(
            files,
            vec![
                "/srv/wads/data.pk3",
                "/srv/wads/a.wad",
                "/srv/wads/b.wad",
                "/srv/wads/c.wad"
            ]
        );
    }

    #[test]
    fn test_argv_iwad_files_use_iwad_dir() {
        let argv = argv_for(|s| {
            s.wads = vec![
                WadRef {
                    name: "nerve.wad".to_string(),
                    location: WadLocation::IwadDir,
                },
                WadRef::wad("doom2.wad"),
            ];
        });
        let files: Vec<&String> = argv
            .windows(2)
            .filter(|w| w[0] == "-file")
            .map(|w| &w[1])
            .collect();
        assert_eq!(files, vec!["/srv/iwads/nerve.wad", "/srv/iwads/doom2.wad"]);
    }

    #[test]
    fn test_argv_flags_only_when_nonzero() {
        let argv = argv_for(|s| {
            s.flags.insert("dmflags".to_string(), FlagValue::Mask(0));
            s.flags.insert("dmflags2".to_string(), FlagValue::Mask(512));
            s.flags.insert("weaponstay".to_string(), FlagValue::Toggle(false));
            s.instagib = true;
            s.config = Some("duel.cfg".to_string());
            s.maps = vec!["MAP01".to_string(), "MAP07".to_string()];
            s.optional_wads = vec!["music.wad".to_string()];
        });
        assert!(!argv.contains(&"+dmflags".to_string()));
        let i = position(&argv, "+dmflags2");
        assert_eq!(argv[i + 1], "512");
        let i = position(&argv, "+sv_weaponstay");
        assert_eq!(argv[i + 1], "0");
        position(&argv, "+instagib");
        assert!(!argv.contains(&"+buckshot".to_string()));
        let i = position(&argv, "+map");
        assert_eq!(&argv[i..i + 4], ["+map", "MAP01", "+addmap", "MAP07"]);
        let i = position(&argv, "-optfile");
        assert_eq!(argv[i + 1], "/srv/wads/music.wad");
        let execs: Vec<&String> = argv
            .windows(2)
            .filter(|w| w[0] == "+exec")
            .map(|w| &w[1])
            .collect();
        assert_eq!(execs, vec!["/srv/cfg/global.cfg", "/srv/cfg/duel.cfg"]);
    }

    #[test]
    fn test_argv_is_deterministic() {
        assert_eq!(argv_for(|_| {}), argv_for(|_| {}));
    }

    #[test]
    fn test_ensure_owner_files_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixtures::config(dir.path(), 10666, 10700);
        ensure_owner_files(&config, "alice").unwrap();
        let ban = dir.path().join("bans").join("alice.txt");
        assert!(ban.is_file());
        std::fs::write(&ban, "1.2.3.4\n").unwrap();
        ensure_owner_files(&config, "alice").unwrap();
        assert_eq!(std::fs::read_to_string(&ban).unwrap(), "1.2.3.4\n");
        assert!(dir.path().join("admins").join("alice.txt").is_file());
        assert!(dir.path().join("white").join("alice.txt").is_file());
    }

    #[test]
    fn test_owner_file_name_cannot_escape_dir() {
        assert_eq!(
            owner_file(Path::new("/srv/bans"), "../../etc/x"),
            PathBuf::from("/srv/bans/....etcx.txt")
        );
    }
}
