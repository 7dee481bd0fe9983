use crate::instance::now_millis;
use crate::notify::Notifier;
use crate::registry::ServerRegistry;
use crate::supervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Kill every unprotected server idle for longer than `days` as of `now`
/// (epoch millis). Stop notices are suppressed. Returns how many were
/// killed.
pub async fn kill_inactive(registry: &ServerRegistry, days: u64, now: i64) -> usize {
    let threshold = DAY_MS.saturating_mul(i64::try_from(days).unwrap_or(i64::MAX));
    let snapshot = registry.list_all().await;
    let mut killed = 0;
    for instance in snapshot {
        if instance.is_protected() || now - instance.last_activity() <= threshold {
            continue;
        }
        instance.set_hide_stop_message(true);
        supervisor::kill(registry, &instance, false).await;
        tracing::info!(
            port = instance.port(),
            owner = instance.owner(),
            idle_ms = now - instance.last_activity(),
            "killed inactive server"
        );
        killed += 1;
    }
    killed
}

pub fn summary(killed: usize, days: u64) -> String {
    let s = if killed == 1 { "" } else { "s" };
    format!("Killed {killed} inactive server{s} (inactive for {days} days).")
}

/// Periodic inactivity sweep over the registry.
#[derive(Clone)]
pub struct CleanupScheduler {
    registry: ServerRegistry,
    notifier: Arc<dyn Notifier>,
    interval_days: u64,
    period: Duration,
}

impl CleanupScheduler {
    pub fn new(
        registry: ServerRegistry,
        notifier: Arc<dyn Notifier>,
        interval_days: u64,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            notifier,
            interval_days,
            period,
        }
    }

    pub fn interval_days(&self) -> u64 {
        self.interval_days
    }

    pub async fn sweep_at(&self, now: i64) -> usize {
        let killed = kill_inactive(&self.registry, self.interval_days, now).await;
        if killed > 0 {
            self.notifier.moderation(&summary(killed, self.interval_days));
        }
        killed
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(now_millis()).await
    }

    /// Run `sweep` every period until `shutdown_rx` flips to true. A zero
    /// interval or period disables the task.
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.interval_days == 0 || self.period.is_zero() {
            tracing::info!("inactivity cleanup disabled");
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let killed = self.sweep().await;
                        tracing::debug!(killed, "cleanup sweep finished");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServerInstance;
    use crate::launch::fixtures;
    use crate::notify::{Notice, RecordingNotifier};
    use std::path::PathBuf;

    async fn register(registry: &ServerRegistry, port: u16) -> Arc<ServerInstance> {
        let (inst, _rx) =
            ServerInstance::new(fixtures::spec("alice"), PathBuf::from("/tmp/x.txt"), 0, false);
        inst.set_port(port);
        let inst = Arc::new(inst);
        registry.insert(Arc::clone(&inst)).await.unwrap();
        inst
    }

    #[tokio::test]
    async fn test_inactive_unprotected_server_is_killed() {
        let registry = ServerRegistry::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let scheduler = CleanupScheduler::new(
            registry.clone(),
            notifier.clone(),
            3,
            Duration::from_secs(3600),
        );
        let idle = register(&registry, 20001).await;
        let protected = register(&registry, 20002).await;
        protected.set_protected(true);
        let start = idle.last_activity().max(protected.last_activity());

        // Four days later neither server has seen activity.
        let later = start + 4 * DAY_MS;
        assert_eq!(scheduler.sweep_at(later).await, 1);

        assert!(registry.lookup(20001).await.is_none());
        assert!(registry.lookup(20002).await.is_some());
        assert!(idle.hide_stop_message());
        assert!(idle.being_killed());
        assert!(!idle.auto_restart());
        assert!(!protected.being_killed());
        assert_eq!(
            notifier.notices(),
            vec![Notice::Moderation(
                "Killed 1 inactive server (inactive for 3 days).".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_recent_activity_survives_sweep() {
        let registry = ServerRegistry::new();
        let inst = register(&registry, 20003).await;
        let start = inst.last_activity();
        inst.touch(start + 3 * DAY_MS);

        assert_eq!(kill_inactive(&registry, 3, start + 4 * DAY_MS).await, 0);
        assert!(registry.lookup(20003).await.is_some());
        assert_eq!(kill_inactive(&registry, 3, start + 7 * DAY_MS).await, 1);
    }

    #[test]
    fn test_summary_pluralizes() {
        assert_eq!(summary(2, 3), "Killed 2 inactive servers (inactive for 3 days).");
    }

    #[tokio::test]
    async fn test_zero_interval_disables_task() {
        let (_tx, rx) = watch::channel(false);
        let scheduler = CleanupScheduler::new(
            ServerRegistry::new(),
            Arc::new(RecordingNotifier::new()),
            0,
            Duration::from_secs(1),
        );
        assert!(scheduler.spawn(rx).is_none());
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let scheduler = CleanupScheduler::new(
            ServerRegistry::new(),
            Arc::new(RecordingNotifier::new()),
            3,
            Duration::from_millis(10),
        );
        let handle = scheduler.spawn(rx).unwrap();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
