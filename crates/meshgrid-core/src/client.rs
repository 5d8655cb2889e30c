//! Chain element seams.
//!
//! `NetworkServiceClient` is the rest of the pipeline as seen from one
//! element: it forwards requests and closes. `MonitorConnectionClient` is the
//! authoritative feed of server-side connection state.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::ChainResult;
use crate::types::{Connection, ConnectionEvent, MonitorScopeSelector, NetworkServiceRequest};

/// Ordered stream of connection events. `None` or an `Err` item ends the
/// subscription.
pub type ConnectionEventStream =
    Pin<Box<dyn Stream<Item = ChainResult<ConnectionEvent>> + Send>>;

/// One element of a network service chain.
///
/// Implementations must be safe to call concurrently and reentrantly;
/// healing replays requests through the same entry point callers use.
/// Dropping the returned future cancels only that call.
#[async_trait]
pub trait NetworkServiceClient: Send + Sync {
    /// Establish or refresh a connection.
    async fn request(&self, request: NetworkServiceRequest) -> ChainResult<Connection>;

    /// Tear down a connection.
    async fn close(&self, conn: &Connection) -> ChainResult<()>;
}

/// Source of connection monitoring events.
#[async_trait]
pub trait MonitorConnectionClient: Send + Sync {
    /// Subscribe to connection events matching `selector`.
    ///
    /// The first event should be an `InitialStateTransfer` carrying the full
    /// current snapshot. The stream ends when it is dropped or the source
    /// fails.
    async fn monitor_connections(
        &self,
        selector: MonitorScopeSelector,
    ) -> ChainResult<ConnectionEventStream>;
}

#[async_trait]
impl<T: NetworkServiceClient + ?Sized> NetworkServiceClient for Arc<T> {
    async fn request(&self, request: NetworkServiceRequest) -> ChainResult<Connection> {
        (**self).request(request).await
    }

    async fn close(&self, conn: &Connection) -> ChainResult<()> {
        (**self).close(conn).await
    }
}

#[async_trait]
impl<T: MonitorConnectionClient + ?Sized> MonitorConnectionClient for Arc<T> {
    async fn monitor_connections(
        &self,
        selector: MonitorScopeSelector,
    ) -> ChainResult<ConnectionEventStream> {
        (**self).monitor_connections(selector).await
    }
}

/// Terminal element: echoes the requested connection back and accepts every
/// close. Useful as the tail of a chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct TailClient;

#[async_trait]
impl NetworkServiceClient for TailClient {
    async fn request(&self, request: NetworkServiceRequest) -> ChainResult<Connection> {
        Ok(request.connection)
    }

    async fn close(&self, _conn: &Connection) -> ChainResult<()> {
        Ok(())
    }
}
