//! Reconciliation loop — compares the server's view of connections with
//! the local registry and schedules heals where they diverge.
//!
//! One loop runs per heal element for the lifetime of the chain. It
//! subscribes to the monitor, classifies events in arrival order, and
//! resubscribes after a fixed backoff whenever the stream fails. Losing the
//! stream means the loop can no longer tell live connections from dead
//! ones, so every tracked connection is healed once per loss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meshgrid_core::{
    Connection, ConnectionEvent, ConnectionEventType, ConnectionId, MonitorConnectionClient,
    MonitorScopeSelector,
};

use crate::registry::TrackedRegistry;
use crate::scheduler::HealScheduler;
use crate::stats::HealStats;

/// Why a subscription stopped delivering events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The stream closed or yielded an error.
    Lost,
    /// The chain lifetime ended.
    ChainCanceled,
    /// The element is being torn down.
    Shutdown,
}

/// Event consumer driving divergence detection.
pub struct ReconciliationLoop {
    monitor: Arc<dyn MonitorConnectionClient>,
    registry: Arc<TrackedRegistry>,
    scheduler: Arc<HealScheduler>,
    stats: Arc<HealStats>,
    resubscribe_backoff: Duration,
    /// Connections the server has confirmed on the current subscription.
    confirmed: HashMap<ConnectionId, Connection>,
    /// Set while monitoring is down, cleared when a later subscription
    /// delivers an event.
    in_loss: bool,
    /// Set once heal-all has run over a non-empty registry for the current
    /// loss.
    healed_for_loss: bool,
}

impl ReconciliationLoop {
    pub fn new(
        monitor: Arc<dyn MonitorConnectionClient>,
        registry: Arc<TrackedRegistry>,
        scheduler: Arc<HealScheduler>,
        stats: Arc<HealStats>,
        resubscribe_backoff: Duration,
    ) -> Self {
        Self {
            monitor,
            registry,
            scheduler,
            stats,
            resubscribe_backoff,
            confirmed: HashMap::new(),
            in_loss: false,
            healed_for_loss: false,
        }
    }

    /// Run until `chain` or `shutdown` is cancelled.
    ///
    /// Cancelling `chain` ends the subscription and heals every tracked
    /// connection. Cancelling `shutdown` just stops.
    pub async fn run(mut self, chain: CancellationToken, shutdown: CancellationToken) {
        info!("reconciliation loop started");
        let monitor = self.monitor.clone();
        let backoff = self.resubscribe_backoff;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = chain.cancelled() => {
                    self.on_chain_canceled();
                    break;
                }
                result = monitor.monitor_connections(MonitorScopeSelector::all()) => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    self.stats.subscribed();
                    info!("connection monitor subscribed");

                    let end = loop {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break StreamEnd::Shutdown,
                            _ = chain.cancelled() => break StreamEnd::ChainCanceled,
                            item = stream.next() => match item {
                                Some(Ok(event)) => {
                                    // A stream that delivers is healthy again.
                                    self.in_loss = false;
                                    self.healed_for_loss = false;
                                    self.handle_event(event);
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "connection monitor stream failed");
                                    break StreamEnd::Lost;
                                }
                                None => {
                                    warn!("connection monitor stream closed");
                                    break StreamEnd::Lost;
                                }
                            },
                        }
                    };
                    drop(stream);

                    match end {
                        StreamEnd::Shutdown => break,
                        StreamEnd::ChainCanceled => {
                            self.on_chain_canceled();
                            break;
                        }
                        StreamEnd::Lost => self.on_subscription_lost("monitor stream lost"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to subscribe to connection monitor");
                    self.on_subscription_lost("monitor subscription failed");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = chain.cancelled() => {
                    self.on_chain_canceled();
                    break;
                }
                _ = tokio::time::sleep(backoff) => {
                    debug!(?backoff, "resubscribing to connection monitor");
                }
            }
        }

        info!("reconciliation loop stopped");
    }

    /// Classify one event and schedule heals for diverged connections.
    ///
    /// Returns the number of heals issued.
    pub fn handle_event(&mut self, event: ConnectionEvent) -> usize {
        let event_type = event.event_type;
        let reported = event.connections.len();

        let scheduled = match event_type {
            ConnectionEventType::InitialStateTransfer => {
                self.confirmed = event.connections;
                self.registry
                    .snapshot_ids()
                    .into_iter()
                    .filter(|id| !self.confirmed.contains_key(id))
                    .filter(|id| self.scheduler.schedule_heal(id))
                    .count()
            }
            ConnectionEventType::Update => {
                self.confirmed.extend(event.connections);
                0
            }
            ConnectionEventType::Delete => {
                let mut scheduled = 0;
                for id in event.connections.keys() {
                    self.confirmed.remove(id);
                    if self.registry.contains(id) && self.scheduler.schedule_heal(id) {
                        scheduled += 1;
                    }
                }
                scheduled
            }
        };

        debug!(
            %event_type,
            connections = reported,
            confirmed = self.confirmed_len(),
            scheduled,
            "connection event processed"
        );
        scheduled
    }

    /// Number of connections the server has confirmed on the current
    /// subscription.
    pub(crate) fn confirmed_len(&self) -> usize {
        self.confirmed.len()
    }

    /// Heal every tracked connection, at most once per loss.
    ///
    /// A loss seen while nothing is tracked does not use up the heal-all,
    /// so connections established while monitoring is still down are healed
    /// on the next failed resubscription.
    fn on_subscription_lost(&mut self, reason: &str) {
        self.mark_lost();
        if self.healed_for_loss {
            debug!(reason, "subscription still down, heal-all already issued");
            return;
        }
        if self.registry.is_empty() {
            debug!(reason, "subscription lost with no tracked connections");
            return;
        }

        self.healed_for_loss = true;
        warn!(reason, tracked = self.registry.len(), "connection monitor lost, healing tracked connections");
        self.scheduler.heal_all();
    }

    /// The chain lifetime ended; monitoring stops for good.
    ///
    /// Heals every tracked connection regardless of earlier losses. Ids
    /// whose heal is still running are deduplicated by the scheduler.
    fn on_chain_canceled(&mut self) {
        self.mark_lost();
        if self.registry.is_empty() {
            debug!("chain lifetime ended with no tracked connections");
            return;
        }

        warn!(tracked = self.registry.len(), "chain lifetime ended, healing tracked connections");
        self.scheduler.heal_all();
    }

    fn mark_lost(&mut self) {
        self.confirmed.clear();
        if !self.in_loss {
            self.in_loss = true;
            self.stats.subscription_lost();
        }
    }
}
