//! Heal chain element.
//!
//! `HealClient` sits in a client chain, forwards requests and closes to the
//! next element, and keeps every successful connection in its registry. A
//! background reconciliation loop watches the connection monitor and
//! replays the last accepted request for any connection the server loses.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meshgrid_core::{
    ChainResult, Connection, ConnectionId, HealConfig, MonitorConnectionClient,
    NetworkServiceClient, NetworkServiceRequest,
};

use crate::reconcile::ReconciliationLoop;
use crate::registry::TrackedRegistry;
use crate::scheduler::HealScheduler;
use crate::stats::{HealStats, HealStatsSnapshot};

/// Builder for [`HealClient`].
pub struct HealClientBuilder {
    monitor: Arc<dyn MonitorConnectionClient>,
    next: Arc<dyn NetworkServiceClient>,
    heal_target: Option<Arc<dyn NetworkServiceClient>>,
    config: HealConfig,
}

impl HealClientBuilder {
    /// Chain that heals are replayed through. Defaults to `next`.
    ///
    /// The target must not route back through this element.
    pub fn heal_target(mut self, target: Arc<dyn NetworkServiceClient>) -> Self {
        self.heal_target = Some(target);
        self
    }

    pub fn config(mut self, config: HealConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the element. Its reconciliation loop runs until `chain` is
    /// cancelled or the element is shut down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self, chain: CancellationToken) -> HealClient {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(HealStats::new());
        let registry = Arc::new(TrackedRegistry::new(shutdown.child_token()));
        let target = self.heal_target.unwrap_or_else(|| self.next.clone());
        let scheduler = Arc::new(HealScheduler::new(
            registry.clone(),
            target,
            self.config.clone(),
            stats.clone(),
        ));

        let reconciler = ReconciliationLoop::new(
            self.monitor,
            registry.clone(),
            scheduler.clone(),
            stats.clone(),
            self.config.resubscribe_backoff,
        );
        let monitor_task = tokio::spawn(reconciler.run(chain, shutdown.clone()));

        info!(
            resubscribe_backoff = ?self.config.resubscribe_backoff,
            heal_timeout = ?self.config.heal_timeout,
            max_attempts = self.config.retry.max_attempts,
            "heal client started"
        );

        HealClient {
            next: self.next,
            registry,
            scheduler,
            stats,
            shutdown,
            monitor_task: Mutex::new(Some(monitor_task)),
        }
    }
}

/// Chain element that keeps connections alive across control-plane loss.
pub struct HealClient {
    next: Arc<dyn NetworkServiceClient>,
    registry: Arc<TrackedRegistry>,
    scheduler: Arc<HealScheduler>,
    stats: Arc<HealStats>,
    /// Element teardown; distinct from the chain lifetime.
    shutdown: CancellationToken,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl HealClient {
    /// Start building a heal element over `monitor` that forwards to `next`.
    pub fn builder(
        monitor: Arc<dyn MonitorConnectionClient>,
        next: Arc<dyn NetworkServiceClient>,
    ) -> HealClientBuilder {
        HealClientBuilder {
            monitor,
            next,
            heal_target: None,
            config: HealConfig::default(),
        }
    }

    /// Start a heal element with default configuration.
    pub fn new(
        chain: CancellationToken,
        monitor: Arc<dyn MonitorConnectionClient>,
        next: Arc<dyn NetworkServiceClient>,
    ) -> Self {
        Self::builder(monitor, next).spawn(chain)
    }

    /// Ids currently tracked.
    pub fn tracked_ids(&self) -> HashSet<ConnectionId> {
        self.registry.snapshot_ids()
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    pub fn stats(&self) -> HealStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the reconciliation loop and abort outstanding heals.
    ///
    /// Unlike cancelling the chain lifetime this issues no heals.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.scheduler.shutdown();
        let task = self
            .monitor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        info!(tracked = self.registry.len(), "heal client stopped");
    }
}

impl Drop for HealClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl NetworkServiceClient for HealClient {
    async fn request(&self, request: NetworkServiceRequest) -> ChainResult<Connection> {
        let requested_id = request.connection_id().to_string();
        let aborted_heal = self.registry.supersede(&requested_id);
        if aborted_heal {
            debug!(conn_id = %requested_id, "explicit request supersedes pending heal");
        }

        let conn = match self.next.request(request.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                // The connection is still known to be lost; put the heal back.
                if aborted_heal && self.scheduler.schedule_heal(&requested_id) {
                    warn!(conn_id = %requested_id, error = %e, "explicit request failed, heal rescheduled");
                }
                return Err(e);
            }
        };

        debug!(conn_id = %conn.id, network_service = %conn.network_service, "tracking connection");
        self.registry.put(&conn.id, request, conn.clone());
        Ok(conn)
    }

    async fn close(&self, conn: &Connection) -> ChainResult<()> {
        // Untrack first so a DELETE raised by the close itself cannot heal it.
        if self.registry.remove(&conn.id).is_some() {
            debug!(conn_id = %conn.id, "connection untracked");
        }
        self.next.close(conn).await
    }
}
