//! Serialized status probes.
//!
//! Probes go through a small bounded queue drained by a single consumer
//! task, so a burst of requests is rejected instead of piling up work.

use crate::instance::InstanceSummary;
use crate::log::tail_file;
use crate::registry::ServerRegistry;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};

/// Queued probes beyond the one in flight.
pub const MAX_REQUESTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReport {
    pub summary: InstanceSummary,
    /// Most recent instance log lines, oldest first.
    #[serde(default)]
    pub recent: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("too many queries queued, try again later")]
    Busy,
    #[error("no server on port {0}")]
    NotFound(u16),
    #[error("query worker is not running")]
    Stopped,
    #[error("query failed: {0}")]
    Failed(String),
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<QueryReport, QueryError>> + Send + 'a>>;

/// One status probe against the server on `port`.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, port: u16) -> ProbeFuture<'_>;
}

struct Job {
    port: u16,
    reply: oneshot::Sender<Result<QueryReport, QueryError>>,
}

// ---------------------------------------------------------------------------
// QueryManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueryManager {
    tx: mpsc::Sender<Job>,
}

impl QueryManager {
    /// Start the consumer task. It exits once every handle is dropped.
    pub fn spawn<P: Probe>(probe: P) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(MAX_REQUESTS);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = probe.probe(job.port).await;
                if let Err(e) = &result {
                    tracing::debug!(port = job.port, error = %e, "query failed");
                }
                // Requester may have given up.
                let _ = job.reply.send(result);
            }
            tracing::debug!("query worker stopped");
        });
        Self { tx }
    }

    /// Enqueue a probe without waiting. Fails with `Busy` when the queue is
    /// full.
    pub fn submit(
        &self,
        port: u16,
    ) -> Result<oneshot::Receiver<Result<QueryReport, QueryError>>, QueryError> {
        let (reply, rx) = oneshot::channel();
        match self.tx.try_send(Job { port, reply }) {
            Ok(()) => Ok(rx),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(port, "query queue full");
                Err(QueryError::Busy)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueryError::Stopped),
        }
    }

    pub async fn query(&self, port: u16) -> Result<QueryReport, QueryError> {
        let rx = self.submit(port)?;
        rx.await.map_err(|_| QueryError::Stopped)?
    }
}

// ---------------------------------------------------------------------------
// RegistryProbe
// ---------------------------------------------------------------------------

/// Reports on instances the registry knows about, with the tail of their
/// log.
#[derive(Debug, Clone)]
pub struct RegistryProbe {
    registry: ServerRegistry,
    tail_lines: usize,
}

impl RegistryProbe {
    pub fn new(registry: ServerRegistry, tail_lines: usize) -> Self {
        Self {
            registry,
            tail_lines,
        }
    }
}

impl Probe for RegistryProbe {
    fn probe(&self, port: u16) -> ProbeFuture<'_> {
        Box::pin(async move {
            let instance = self
                .registry
                .lookup(port)
                .await
                .ok_or(QueryError::NotFound(port))?;
            let summary = instance.summary();
            let path = instance.log_path().to_path_buf();
            let n = self.tail_lines;
            let recent = tokio::task::spawn_blocking(move || tail_file(&path, n))
                .await
                .map_err(|e| QueryError::Failed(e.to_string()))?
                .map_err(|e| QueryError::Failed(e.to_string()))?;
            Ok(QueryReport { summary, recent })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServerInstance;
    use crate::launch::fixtures;
    use std::sync::Arc;
    use tokio::sync::{Notify, Semaphore};

    fn report(port: u16) -> QueryReport {
        let (inst, _rx) =
            ServerInstance::new(fixtures::spec("alice"), "/tmp/x.txt".into(), 0, false);
        inst.set_port(port);
        QueryReport {
            summary: inst.summary(),
            recent: Vec::new(),
        }
    }

    /// Holds every probe until the gate opens.
    struct GatedProbe {
        started: Arc<Notify>,
        gate: Arc<Semaphore>,
    }

    impl Probe for GatedProbe {
        fn probe(&self, port: u16) -> ProbeFuture<'_> {
            Box::pin(async move {
                self.started.notify_one();
                let _permit = self.gate.acquire().await.map_err(|_| QueryError::Stopped)?;
                Ok(report(port))
            })
        }
    }

    #[tokio::test]
    async fn test_queue_rejects_when_full() {
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));
        let manager = QueryManager::spawn(GatedProbe {
            started: Arc::clone(&started),
            gate: Arc::clone(&gate),
        });

        let first = manager.submit(1).unwrap();
        started.notified().await;

        let mut queued = Vec::new();
        for port in 2..2 + MAX_REQUESTS as u16 {
            queued.push(manager.submit(port).unwrap());
        }
        assert!(matches!(manager.submit(99), Err(QueryError::Busy)));

        gate.add_permits(16);
        assert_eq!(first.await.unwrap().unwrap().summary.port, 1);
        for (i, rx) in queued.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap().unwrap().summary.port, 2 + i as u16);
        }
        // Capacity is available again.
        assert_eq!(manager.query(7).await.unwrap().summary.port, 7);
    }

    #[tokio::test]
    async fn test_registry_probe_reports_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("server.txt");
        std::fs::write(&log_path, "one\ntwo\nthree\n").unwrap();

        let registry = ServerRegistry::new();
        let (inst, _rx) = ServerInstance::new(fixtures::spec("alice"), log_path, 0, false);
        inst.set_port(10700);
        registry.insert(Arc::new(inst)).await.unwrap();

        let manager = QueryManager::spawn(RegistryProbe::new(registry, 2));
        let report = manager.query(10700).await.unwrap();
        assert_eq!(report.summary.owner, "alice");
        assert_eq!(report.recent, vec!["two".to_string(), "three".to_string()]);

        assert!(matches!(
            manager.query(10701).await,
            Err(QueryError::NotFound(10701))
        ));
    }
}
