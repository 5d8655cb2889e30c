//! Channel-backed connection monitor.
//!
//! `EventChannel` turns a tokio `mpsc` receiver into a
//! [`MonitorConnectionClient`]. Every subscription drains the same shared
//! receiver, so an event is delivered to exactly one live subscriber. The
//! stream ends once every sender has been dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::client::{ConnectionEventStream, MonitorConnectionClient};
use crate::error::ChainResult;
use crate::types::{ConnectionEvent, MonitorScopeSelector};

/// Monitor source fed from an in-process channel.
#[derive(Clone)]
pub struct EventChannel {
    receiver: Arc<Mutex<mpsc::Receiver<ConnectionEvent>>>,
}

impl EventChannel {
    /// Wrap an existing receiver.
    pub fn new(receiver: mpsc::Receiver<ConnectionEvent>) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Create a bounded channel and the monitor reading from it.
    pub fn pair(capacity: usize) -> (mpsc::Sender<ConnectionEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl MonitorConnectionClient for EventChannel {
    async fn monitor_connections(
        &self,
        selector: MonitorScopeSelector,
    ) -> ChainResult<ConnectionEventStream> {
        debug!(?selector, "event channel subscription opened");

        let receiver = self.receiver.clone();
        let stream = futures_util::stream::unfold(receiver, move |receiver| {
            let selector = selector.clone();
            async move {
                let mut event = receiver.lock().await.recv().await?;
                event.connections.retain(|_, conn| selector.matches(conn));
                Some((Ok(event), receiver))
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Connection;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn delivers_events_in_order() {
        let (tx, channel) = EventChannel::pair(4);
        let mut stream = channel
            .monitor_connections(MonitorScopeSelector::all())
            .await
            .unwrap();

        tx.send(ConnectionEvent::initial_state_transfer([Connection::new("conn-1", "ns-1")]))
            .await
            .unwrap();
        tx.send(ConnectionEvent::delete([Connection::new("conn-1", "ns-1")]))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event_type, crate::ConnectionEventType::InitialStateTransfer);
        assert_eq!(second.event_type, crate::ConnectionEventType::Delete);
    }

    #[tokio::test]
    async fn stream_ends_when_senders_dropped() {
        let (tx, channel) = EventChannel::pair(1);
        let mut stream = channel
            .monitor_connections(MonitorScopeSelector::all())
            .await
            .unwrap();

        drop(tx);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn selector_filters_connections() {
        let (tx, channel) = EventChannel::pair(1);
        let selector = MonitorScopeSelector {
            network_services: vec!["ns-1".to_string()],
        };
        let mut stream = channel.monitor_connections(selector).await.unwrap();

        tx.send(ConnectionEvent::update([
            Connection::new("conn-1", "ns-1"),
            Connection::new("conn-2", "ns-2"),
        ]))
        .await
        .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.connections.len(), 1);
        assert!(event.connections.contains_key("conn-1"));
    }
}
