//! Heal scheduler — deduplicated background re-establishment.
//!
//! Each heal runs as a task in a `JoinSet` owned by the scheduler, so
//! stopping the element aborts every outstanding heal. A heal replays the
//! entry's last accepted request through the heal target and commits the
//! new connection only if the entry was neither closed nor superseded in
//! the meantime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use meshgrid_core::{ChainError, Connection, HealConfig, NetworkServiceClient, NetworkServiceRequest};

use crate::registry::{HealTicket, TrackedRegistry};
use crate::retry::HealBackoff;
use crate::stats::HealStats;

/// Issues at most one heal per connection id at a time.
pub struct HealScheduler {
    registry: Arc<TrackedRegistry>,
    /// Chain that receives replayed requests.
    target: Arc<dyn NetworkServiceClient>,
    config: HealConfig,
    stats: Arc<HealStats>,
    tasks: Mutex<JoinSet<()>>,
}

impl HealScheduler {
    pub fn new(
        registry: Arc<TrackedRegistry>,
        target: Arc<dyn NetworkServiceClient>,
        config: HealConfig,
        stats: Arc<HealStats>,
    ) -> Self {
        Self {
            registry,
            target,
            config,
            stats,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Schedule a heal for `id`.
    ///
    /// Returns `false` without doing anything when the id is not tracked or
    /// a heal for it is already in flight. Must be called from within a
    /// tokio runtime.
    pub fn schedule_heal(&self, id: &str) -> bool {
        let Some(ticket) = self.registry.begin_heal(id) else {
            if self.registry.contains(id) {
                self.stats.heal_deduplicated();
                debug!(conn_id = %id, "heal already in flight");
            } else {
                debug!(conn_id = %id, "heal skipped, connection not tracked");
            }
            return false;
        };

        self.stats.heal_scheduled();
        debug!(conn_id = %id, "heal scheduled");

        let registry = self.registry.clone();
        let target = self.target.clone();
        let config = self.config.clone();
        let stats = self.stats.clone();

        let mut tasks = self.tasks();
        // Reap finished heals so the set only holds live tasks.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(run_heal(ticket, registry, target, config, stats));
        true
    }

    /// Schedule a heal for every tracked id. Returns how many were issued.
    pub fn heal_all(&self) -> usize {
        let ids = self.registry.snapshot_ids();
        let total = ids.len();
        let scheduled = ids.iter().filter(|id| self.schedule_heal(id)).count();
        info!(tracked = total, scheduled, "healing all tracked connections");
        scheduled
    }

    /// Number of heal tasks that have not yet finished.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Abort every outstanding heal.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            debug!(outstanding = tasks.len(), "aborting heal tasks");
        }
        tasks.abort_all();
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replay one request until it succeeds, the retry policy is exhausted, or
/// the entry's lifecycle ends.
async fn run_heal(
    ticket: HealTicket,
    registry: Arc<TrackedRegistry>,
    target: Arc<dyn NetworkServiceClient>,
    config: HealConfig,
    stats: Arc<HealStats>,
) {
    let HealTicket {
        id,
        request,
        generation,
        lifecycle,
    } = ticket;
    let mut backoff = HealBackoff::new(config.retry);

    loop {
        let attempt = backoff.attempt();
        debug!(conn_id = %id, attempt, "heal attempt starting");

        let result = tokio::select! {
            _ = lifecycle.cancelled() => {
                stats.heal_aborted();
                debug!(conn_id = %id, attempt, "heal aborted, connection closed or superseded");
                return;
            }
            result = attempt_heal(target.as_ref(), &request, &config) => result,
        };

        match result {
            Ok(conn) => {
                if registry.complete_heal(&id, generation, conn) {
                    stats.heal_succeeded();
                    info!(conn_id = %id, attempt, "connection healed");
                } else {
                    stats.heal_aborted();
                }
                return;
            }
            Err(e) => {
                warn!(conn_id = %id, attempt, error = %e, "heal attempt failed");
                match backoff.record_failure() {
                    Some(delay) => {
                        tokio::select! {
                            _ = lifecycle.cancelled() => {
                                stats.heal_aborted();
                                debug!(conn_id = %id, "heal aborted during backoff");
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        registry.end_heal(&id, generation);
                        stats.heal_failed();
                        warn!(conn_id = %id, attempts = attempt, "heal abandoned until next trigger");
                        return;
                    }
                }
            }
        }
    }
}

async fn attempt_heal(
    target: &dyn NetworkServiceClient,
    request: &NetworkServiceRequest,
    config: &HealConfig,
) -> Result<Connection, ChainError> {
    match tokio::time::timeout(config.heal_timeout, target.request(request.clone())).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout(config.heal_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use meshgrid_core::{ChainResult, RetryPolicy};
    use tokio::sync::{mpsc, Semaphore};
    use tokio_util::sync::CancellationToken;

    /// Records replayed requests and answers from a script of results.
    struct ScriptedTarget {
        calls: mpsc::UnboundedSender<NetworkServiceRequest>,
        /// Number of leading calls that fail.
        failures: Mutex<u32>,
        /// Permits gate each call when set.
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl NetworkServiceClient for ScriptedTarget {
        async fn request(&self, request: NetworkServiceRequest) -> ChainResult<Connection> {
            let _ = self.calls.send(request.clone());
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let fail = {
                let mut failures = self.failures.lock().unwrap();
                let fail = *failures > 0;
                *failures = failures.saturating_sub(1);
                fail
            };
            if fail {
                return Err(ChainError::Forward("scripted failure".to_string()));
            }
            let mut conn = request.connection;
            conn.network_service_endpoint_name = "healed".to_string();
            Ok(conn)
        }

        async fn close(&self, _conn: &Connection) -> ChainResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<TrackedRegistry>,
        scheduler: HealScheduler,
        stats: Arc<HealStats>,
        calls: mpsc::UnboundedReceiver<NetworkServiceRequest>,
        gate: Arc<Semaphore>,
    }

    fn fixture(failures: u32, gated: bool, config: HealConfig) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let target = ScriptedTarget {
            calls: tx,
            failures: Mutex::new(failures),
            gate: gated.then(|| gate.clone()),
        };
        let registry = Arc::new(TrackedRegistry::new(CancellationToken::new()));
        let stats = Arc::new(HealStats::new());
        let scheduler = HealScheduler::new(registry.clone(), Arc::new(target), config, stats.clone());
        Fixture {
            registry,
            scheduler,
            stats,
            calls: rx,
            gate,
        }
    }

    fn track(registry: &TrackedRegistry, id: &str) {
        let conn = Connection::new(id, "ns-1");
        registry.put(id, NetworkServiceRequest::new(conn.clone()), conn);
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn heal_replays_last_request_and_commits() {
        let mut f = fixture(0, false, HealConfig::default());
        track(&f.registry, "conn-1");

        assert!(f.scheduler.schedule_heal("conn-1"));
        let replayed = f.calls.recv().await.unwrap();
        assert_eq!(replayed, NetworkServiceRequest::new(Connection::new("conn-1", "ns-1")));

        let registry = f.registry.clone();
        wait_until(move || {
            registry
                .get("conn-1")
                .is_some_and(|e| e.last_known_connection.network_service_endpoint_name == "healed")
        })
        .await;
        assert!(!f.registry.get("conn-1").unwrap().heal_in_flight);
        assert_eq!(f.stats.snapshot().heals_succeeded, 1);
    }

    #[tokio::test]
    async fn untracked_id_is_a_no_op() {
        let f = fixture(0, false, HealConfig::default());
        assert!(!f.scheduler.schedule_heal("missing"));
        assert_eq!(f.stats.snapshot().heals_scheduled, 0);
    }

    #[tokio::test]
    async fn second_trigger_while_in_flight_is_deduplicated() {
        let mut f = fixture(0, true, HealConfig::default());
        track(&f.registry, "conn-1");

        assert!(f.scheduler.schedule_heal("conn-1"));
        f.calls.recv().await.unwrap();
        assert!(!f.scheduler.schedule_heal("conn-1"));

        f.gate.add_permits(1);
        let stats = f.stats.clone();
        wait_until(move || stats.snapshot().heals_succeeded == 1).await;

        let snap = f.stats.snapshot();
        assert_eq!(snap.heals_scheduled, 1);
        assert_eq!(snap.heals_deduplicated, 1);
        assert!(f.calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_heal_clears_flag_without_retry() {
        let mut f = fixture(1, false, HealConfig::default());
        track(&f.registry, "conn-1");

        assert!(f.scheduler.schedule_heal("conn-1"));
        f.calls.recv().await.unwrap();

        let stats = f.stats.clone();
        wait_until(move || stats.snapshot().heals_failed == 1).await;
        assert!(!f.registry.get("conn-1").unwrap().heal_in_flight);
        assert!(f.calls.try_recv().is_err());

        // A later trigger heals again.
        assert!(f.scheduler.schedule_heal("conn-1"));
        f.calls.recv().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_retries_with_backoff() {
        let config = HealConfig::default().with_retry(RetryPolicy::exponential(
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
        ));
        let mut f = fixture(2, false, config);
        track(&f.registry, "conn-1");

        assert!(f.scheduler.schedule_heal("conn-1"));
        for _ in 0..3 {
            f.calls.recv().await.unwrap();
        }

        let stats = f.stats.clone();
        wait_until(move || stats.snapshot().heals_succeeded == 1).await;
        assert_eq!(f.stats.snapshot().heals_failed, 0);
    }

    #[tokio::test]
    async fn heal_aborts_when_entry_removed() {
        let mut f = fixture(0, true, HealConfig::default());
        track(&f.registry, "conn-1");

        assert!(f.scheduler.schedule_heal("conn-1"));
        f.calls.recv().await.unwrap();

        f.registry.remove("conn-1");
        let stats = f.stats.clone();
        wait_until(move || stats.snapshot().heals_aborted == 1).await;

        f.gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!f.registry.contains("conn-1"));
        assert_eq!(f.stats.snapshot().heals_succeeded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heal_timeout_counts_as_failure() {
        let config = HealConfig::default().with_heal_timeout(Duration::from_secs(2));
        let mut f = fixture(0, true, config);
        track(&f.registry, "conn-1");

        assert!(f.scheduler.schedule_heal("conn-1"));
        f.calls.recv().await.unwrap();

        let stats = f.stats.clone();
        wait_until(move || stats.snapshot().heals_failed == 1).await;
        assert!(!f.registry.get("conn-1").unwrap().heal_in_flight);
    }

    #[tokio::test]
    async fn heal_all_issues_one_heal_per_entry() {
        let mut f = fixture(0, true, HealConfig::default());
        track(&f.registry, "conn-1");
        track(&f.registry, "conn-2");

        assert_eq!(f.scheduler.heal_all(), 2);
        assert_eq!(f.scheduler.heal_all(), 0);

        let mut seen = vec![
            f.calls.recv().await.unwrap().connection.id,
            f.calls.recv().await.unwrap().connection.id,
        ];
        seen.sort();
        assert_eq!(seen, vec!["conn-1", "conn-2"]);
        assert_eq!(f.scheduler.in_flight(), 2);

        f.scheduler.shutdown();
        let scheduler = &f.scheduler;
        wait_until(|| scheduler.in_flight() == 0).await;
    }
}
