use crate::account::AccountLevel;
use crate::cleanup::{self, CleanupScheduler};
use crate::dispatch::{self, DispatchError};
use crate::instance::{InstanceSecrets, InstanceSummary, ServerInstance, now_millis};
use crate::launch::{LaunchBuilder, LaunchError};
use crate::log::tail_file;
use crate::options::{OptionsError, parse_options};
use crate::ports::PortError;
use crate::protocol::{Request, Response};
use crate::query::{QueryError, QueryManager, QueryReport, RegistryProbe};
use crate::registry::ServerRegistry;
use crate::store::StoreError;
use crate::supervisor::{self, SupervisorContext, SupervisorError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const QUERY_TAIL_LINES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("new servers are not being accepted right now")]
    NotAccepting,
    #[error("you must be {0} or higher to do that")]
    Permission(AccountLevel),
    #[error("you have reached your server quota ({0})")]
    QuotaExceeded(u32),
    #[error("there is no server running on port {0}")]
    NotFound(u16),
    #[error("you do not own the server on port {0}")]
    NotOwner(u16),
    #[error("unknown version `{0}`")]
    UnknownVersion(String),
    #[error("number of days must be greater than zero")]
    InvalidDays,
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

fn join_ports(instances: &[Arc<ServerInstance>]) -> String {
    instances
        .iter()
        .map(|i| i.port().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Quota claims
// ---------------------------------------------------------------------------

/// Hosting requests per owner that passed the quota check but whose server
/// is not in `launching` yet. Owners are keyed lowercase.
#[derive(Debug, Clone, Default)]
struct PendingHosts {
    inner: Arc<Mutex<HashMap<String, usize>>>,
}

impl PendingHosts {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count(&self, owner: &str) -> usize {
        self.lock()
            .get(&owner.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    fn claim(&self, owner: &str) -> QuotaClaim {
        let owner = owner.to_ascii_lowercase();
        *self.lock().entry(owner.clone()).or_default() += 1;
        QuotaClaim {
            pending: self.clone(),
            owner,
        }
    }
}

/// One slot of an owner's quota, held from the quota check until the
/// server is spawned (or the request fails).
struct QuotaClaim {
    pending: PendingHosts,
    owner: String,
}

impl Drop for QuotaClaim {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if let Some(n) = pending.get_mut(&self.owner) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                pending.remove(&self.owner);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Entry point the daemon drives: hosting, kills, commands and queries,
/// each gated by the requester's account level.
#[derive(Clone)]
pub struct Manager {
    ctx: SupervisorContext,
    cleanup: CleanupScheduler,
    queries: QueryManager,
    accepting: Arc<AtomicBool>,
    quota_gate: Arc<tokio::sync::Mutex<()>>,
    pending: PendingHosts,
}

impl Manager {
    /// Must be called inside a tokio runtime; starts the query worker.
    pub fn new(ctx: SupervisorContext) -> Self {
        let host = &ctx.config.host;
        let cleanup = CleanupScheduler::new(
            ctx.registry.clone(),
            Arc::clone(&ctx.notifier),
            host.cleanup_interval_days,
            Duration::from_secs(host.cleanup_period_secs),
        );
        let queries = QueryManager::spawn(RegistryProbe::new(ctx.registry.clone(), QUERY_TAIL_LINES));
        Self {
            ctx,
            cleanup,
            queries,
            accepting: Arc::new(AtomicBool::new(true)),
            quota_gate: Arc::new(tokio::sync::Mutex::new(())),
            pending: PendingHosts::default(),
        }
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.ctx
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.ctx.registry
    }

    pub fn spawn_cleanup(&self, shutdown_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let handle = self.cleanup.clone().spawn(shutdown_rx)?;
        tracing::info!(
            days = self.cleanup.interval_days(),
            "inactivity cleanup scheduled"
        );
        Some(handle)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Store failures count as the lowest level.
    fn level(&self, who: &str) -> AccountLevel {
        match self.ctx.store.account_level(who) {
            Ok(level) => level,
            Err(e) => {
                tracing::warn!(%who, error = %e, "account level lookup failed");
                AccountLevel::None
            }
        }
    }

    fn require(&self, who: &str, required: AccountLevel) -> Result<AccountLevel, ManagerError> {
        let level = self.level(who);
        if level.at_least(required) {
            Ok(level)
        } else {
            Err(ManagerError::Permission(required))
        }
    }

    async fn lookup(&self, port: u16) -> Result<Arc<ServerInstance>, ManagerError> {
        self.ctx
            .registry
            .lookup(port)
            .await
            .ok_or(ManagerError::NotFound(port))
    }

    /// Look up a server the requester may act on: their own, or any when
    /// they are a moderator.
    async fn lookup_controlled(
        &self,
        port: u16,
        who: &str,
        level: AccountLevel,
    ) -> Result<(Arc<ServerInstance>, bool), ManagerError> {
        let instance = self.lookup(port).await?;
        let owns = instance.owner().eq_ignore_ascii_case(who);
        if !owns && !level.at_least(AccountLevel::Moderator) {
            return Err(ManagerError::NotOwner(port));
        }
        Ok((instance, owns))
    }

    // ----- hosting -----

    /// Check the owner's quota and take a slot in one step. Counts are read
    /// pending, then launching, then registered: the order an instance moves
    /// through them, each move entering the next set before leaving the last.
    async fn claim_quota(&self, owner: &str) -> Result<QuotaClaim, ManagerError> {
        let quota = self.ctx.store.get_quota(owner)?;
        let _gate = self.quota_gate.lock().await;

        let pending = self.pending.count(owner);
        let launching = self
            .ctx
            .launching
            .snapshot()
            .iter()
            .filter(|i| i.owner().eq_ignore_ascii_case(owner))
            .count();
        let registered = self.ctx.registry.list_by_owner(owner).await.len();
        if pending + launching + registered >= quota as usize {
            return Err(ManagerError::QuotaExceeded(quota));
        }
        Ok(self.pending.claim(owner))
    }

    pub async fn build_and_launch(
        &self,
        owner: &str,
        raw_options: &str,
        requested_port: Option<u16>,
        recovering: bool,
    ) -> Result<InstanceSummary, ManagerError> {
        if !recovering && !self.is_accepting() {
            return Err(ManagerError::NotAccepting);
        }
        let level = self.require(owner, AccountLevel::Registered)?;

        let claim = if recovering {
            None
        } else {
            Some(self.claim_quota(owner).await?)
        };

        let options = parse_options(raw_options)?;
        let builder = LaunchBuilder::new(
            Arc::clone(&self.ctx.config),
            Arc::clone(&self.ctx.store),
            self.ctx.ports.clone(),
            self.ctx.registry.ports().await,
        );
        let who = owner.to_string();
        let spec = tokio::task::spawn_blocking(move || {
            builder.build(&who, level, &options, requested_port, recovering)
        })
        .await
        .map_err(|e| ManagerError::Internal(e.to_string()))??;

        let reservation = match spec.requested_port {
            Some(port) => self.ctx.ports.reserve(port).map_err(|e| match e {
                PortError::OutOfRange { port, .. } => LaunchError::InvalidPort(port.to_string()),
                PortError::Reserved(port) | PortError::InUse(port) => LaunchError::PortInUse(port),
            })?,
            None => self
                .ctx
                .ports
                .reserve_first_available()
                .ok_or(LaunchError::CapacityReached)?,
        };
        let port = reservation.port();

        let instance = supervisor::start(&self.ctx, spec, 0, recovering, reservation).await?;
        // The instance is in `launching` now and counts on its own.
        drop(claim);
        tracing::info!(%owner, port, id = instance.id(), "hosting request accepted");

        let mut summary = instance.summary();
        summary.port = port;
        Ok(summary)
    }

    // ----- termination -----

    pub async fn terminate(&self, port: u16, who: &str) -> Result<String, ManagerError> {
        let level = self.require(who, AccountLevel::Registered)?;
        let (instance, owns) = self.lookup_controlled(port, who, level).await?;
        supervisor::kill(&self.ctx.registry, &instance, owns).await;
        tracing::info!(port, %who, by_owner = owns, "server killed on request");
        Ok(format!("Server on port {port} killed."))
    }

    pub async fn kill_mine(&self, who: &str) -> Result<String, ManagerError> {
        self.require(who, AccountLevel::Registered)?;
        let mine = self.ctx.registry.list_by_owner(who).await;
        if mine.is_empty() {
            return Ok("You do not have any servers running.".to_string());
        }
        for instance in &mine {
            instance.set_hide_stop_message(true);
            supervisor::kill(&self.ctx.registry, instance, true).await;
        }
        let n = mine.len();
        Ok(format!(
            "Killed your {n} server{} ({})",
            plural(n),
            join_ports(&mine)
        ))
    }

    async fn kill_many(&self, targets: &[Arc<ServerInstance>]) -> usize {
        for instance in targets {
            instance.set_hide_stop_message(true);
            supervisor::kill(&self.ctx.registry, instance, false).await;
        }
        targets.len()
    }

    pub async fn kill_all(&self, who: &str) -> Result<String, ManagerError> {
        self.require(who, AccountLevel::Admin)?;
        let snapshot = self.ctx.registry.list_all().await;
        if snapshot.is_empty() {
            return Ok("There are no servers running.".to_string());
        }
        let n = self.kill_many(&snapshot).await;
        let message = format!("Killed a total of {n} server{}.", plural(n));
        self.ctx.notifier.moderation(&format!("{who}: {message}"));
        Ok(message)
    }

    pub async fn kill_by_version(&self, version: &str, who: &str) -> Result<String, ManagerError> {
        self.require(who, AccountLevel::Admin)?;
        let Some(entry) = self.ctx.config.catalog.get(version) else {
            return Err(ManagerError::UnknownVersion(version.to_string()));
        };
        let snapshot = self.ctx.registry.list_by_version(&entry.name).await;
        if snapshot.is_empty() {
            return Ok("No servers to kill.".to_string());
        }
        let n = self.kill_many(&snapshot).await;
        self.ctx
            .notifier
            .moderation(&format!("{who} killed all {n} {} servers", entry.name));
        Ok(format!("Killed a total of {n} server{}.", plural(n)))
    }

    pub async fn kill_inactive(&self, days: u64, who: &str) -> Result<String, ManagerError> {
        self.require(who, AccountLevel::Moderator)?;
        if days == 0 {
            return Err(ManagerError::InvalidDays);
        }
        let killed = cleanup::kill_inactive(&self.ctx.registry, days, now_millis()).await;
        if killed == 0 {
            return Ok("No servers were killed.".to_string());
        }
        let message = cleanup::summary(killed, days);
        self.ctx.notifier.moderation(&format!("{who}: {message}"));
        Ok(message)
    }

    pub async fn cleanup_now(&self, who: &str) -> Result<String, ManagerError> {
        self.require(who, AccountLevel::Moderator)?;
        if self.cleanup.interval_days() == 0 {
            return Ok("Inactivity cleanup is disabled.".to_string());
        }
        let killed = self.cleanup.sweep().await;
        Ok(cleanup::summary(killed, self.cleanup.interval_days()))
    }

    /// Kill every instance, launching ones included. Used on daemon exit.
    pub async fn shutdown_all(&self) {
        let mut targets = self.ctx.registry.list_all().await;
        for launching in self.ctx.launching.snapshot() {
            if !targets.iter().any(|t| Arc::ptr_eq(t, &launching)) {
                targets.push(launching);
            }
        }
        let n = self.kill_many(&targets).await;
        tracing::info!(killed = n, "all servers terminated");
    }

    // ----- listing and inspection -----

    pub async fn list(&self, owner: Option<&str>) -> Vec<InstanceSummary> {
        let instances = match owner {
            Some(owner) => self.ctx.registry.list_by_owner(owner).await,
            None => self.ctx.registry.list_all().await,
        };
        instances.iter().map(|i| i.summary()).collect()
    }

    pub async fn info(&self, port: u16, who: &str) -> Result<InstanceSecrets, ManagerError> {
        let level = self.require(who, AccountLevel::Registered)?;
        let (instance, _) = self.lookup_controlled(port, who, level).await?;
        Ok(instance.secrets())
    }

    pub async fn log(&self, port: u16, lines: usize, who: &str) -> Result<Vec<String>, ManagerError> {
        let level = self.require(who, AccountLevel::Registered)?;
        let (instance, _) = self.lookup_controlled(port, who, level).await?;
        let path = instance.log_path().to_path_buf();
        tokio::task::spawn_blocking(move || tail_file(&path, lines))
            .await
            .map_err(|e| ManagerError::Internal(e.to_string()))?
            .map_err(|e| ManagerError::Internal(e.to_string()))
    }

    pub async fn query(&self, port: u16) -> Result<QueryReport, ManagerError> {
        Ok(self.queries.query(port).await?)
    }

    /// Flip the protected flag. Returns the new value.
    pub async fn protect(&self, port: u16, who: &str) -> Result<bool, ManagerError> {
        let level = self.require(who, AccountLevel::Vip)?;
        let (instance, _) = self.lookup_controlled(port, who, level).await?;
        let protected = !instance.is_protected();
        instance.set_protected(protected);
        tracing::info!(port, %who, protected, "protection changed");
        Ok(protected)
    }

    pub fn set_accepting(&self, enabled: bool, who: &str) -> Result<String, ManagerError> {
        self.require(who, AccountLevel::Admin)?;
        let was = self.accepting.swap(enabled, Ordering::SeqCst);
        let state = if enabled { "enabled" } else { "disabled" };
        if was != enabled {
            self.ctx.notifier.moderation(&format!("{who} {state} hosting"));
        }
        Ok(format!("Hosting {state}."))
    }

    // ----- console -----

    pub async fn send_command(&self, port: u16, command: &str, who: &str) -> Result<(), ManagerError> {
        let level = self.require(who, AccountLevel::Registered)?;
        let (instance, _) = self.lookup_controlled(port, who, level).await?;
        dispatch::send(&instance, command, who, &self.ctx.config.host.hostname_base).await?;
        Ok(())
    }

    pub async fn send_all(&self, command: &str, who: &str) -> Result<usize, ManagerError> {
        self.require(who, AccountLevel::Admin)?;
        let snapshot = self.ctx.registry.list_all().await;
        Ok(dispatch::send_all(&snapshot, command, who).await?)
    }

    pub async fn broadcast(&self, message: &str, who: &str) -> Result<usize, ManagerError> {
        self.require(who, AccountLevel::Moderator)?;
        let snapshot = self.ctx.registry.list_all().await;
        Ok(dispatch::broadcast(&snapshot, message).await)
    }

    // ----- protocol -----

    pub async fn dispatch(&self, request: Request, shutdown_tx: &watch::Sender<bool>) -> Response {
        let result = match request {
            Request::Host {
                owner,
                options,
                port,
                recovering,
            } => {
                return match self.build_and_launch(&owner, &options, port, recovering).await {
                    Ok(server) => Response::Hosted {
                        server: Box::new(server),
                    },
                    Err(e) => Response::error(e),
                };
            }
            Request::List { owner } => {
                return Response::ServerList {
                    servers: self.list(owner.as_deref()).await,
                };
            }
            Request::Info { requester, port } => {
                return match self.info(port, &requester).await {
                    Ok(info) => Response::ServerInfo {
                        info: Box::new(info),
                    },
                    Err(e) => Response::error(e),
                };
            }
            Request::Log {
                requester,
                port,
                lines,
            } => {
                return match self.log(port, lines, &requester).await {
                    Ok(lines) => Response::LogLines { port, lines },
                    Err(e) => Response::error(e),
                };
            }
            Request::Query { port } => {
                return match self.query(port).await {
                    Ok(report) => Response::QueryResult {
                        report: Box::new(report),
                    },
                    Err(e) => Response::error(e),
                };
            }
            Request::Shutdown => {
                let _ = shutdown_tx.send(true);
                return Response::success("daemon shutting down");
            }
            Request::Kill { requester, port } => self.terminate(port, &requester).await,
            Request::KillMine { requester } => self.kill_mine(&requester).await,
            Request::KillAll { requester } => self.kill_all(&requester).await,
            Request::KillVersion { requester, version } => {
                self.kill_by_version(&version, &requester).await
            }
            Request::KillInactive { requester, days } => {
                self.kill_inactive(days, &requester).await
            }
            Request::Cleanup { requester } => self.cleanup_now(&requester).await,
            Request::Accepting { requester, enabled } => self.set_accepting(enabled, &requester),
            Request::Protect { requester, port } => {
                self.protect(port, &requester).await.map(|on| {
                    if on {
                        format!("Server on port {port} is now protected.")
                    } else {
                        format!("Server on port {port} is no longer protected.")
                    }
                })
            }
            Request::Send {
                requester,
                port,
                command,
            } => self
                .send_command(port, &command, &requester)
                .await
                .map(|()| format!("Sent command to port {port}.")),
            Request::SendAll { requester, command } => self
                .send_all(&command, &requester)
                .await
                .map(|n| format!("Sent command to {n} server{}.", plural(n))),
            Request::Broadcast { requester, message } => self
                .broadcast(&message, &requester)
                .await
                .map(|n| format!("Announced on {n} server{}.", plural(n))),
        };
        match result {
            Ok(message) => Response::success(message),
            Err(e) => Response::error(e),
        }
    }
}
