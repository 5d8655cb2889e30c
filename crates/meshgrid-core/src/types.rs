//! Control-plane records shared by every chain element.
//!
//! A `Connection` is an immutable snapshot produced by a successful request;
//! elements replace it wholesale rather than patching fields in place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable identifier of a connection.
pub type ConnectionId = String;

// ── Connection ─────────────────────────────────────────────────────

/// Control-plane record of an established network-service path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: ConnectionId,
    pub network_service: String,
    /// Endpoint selected for this connection (empty until discovered).
    #[serde(default)]
    pub network_service_endpoint_name: String,
    #[serde(default)]
    pub mechanism: Option<Mechanism>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub path: Path,
}

impl Connection {
    /// Shorthand for a bare connection with only an id and a service name.
    pub fn new(id: impl Into<String>, network_service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_service: network_service.into(),
            ..Self::default()
        }
    }
}

/// Transport mechanism negotiated for a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Mechanism {
    /// Mechanism class: "LOCAL" or "REMOTE".
    pub cls: String,
    /// Mechanism type, e.g. "KERNEL", "MEMIF", "VXLAN".
    #[serde(rename = "type")]
    pub mechanism_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Ordered list of hops a connection passes through.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Path {
    /// Index of the current hop within `path_segments`.
    pub index: u32,
    pub path_segments: Vec<PathSegment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PathSegment {
    pub name: String,
    pub id: String,
    pub token: String,
}

// ── Request ────────────────────────────────────────────────────────

/// Everything needed to (re-)establish a connection.
///
/// Retained verbatim by elements that replay requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkServiceRequest {
    pub connection: Connection,
    #[serde(default)]
    pub mechanism_preferences: Vec<Mechanism>,
}

impl NetworkServiceRequest {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            mechanism_preferences: Vec::new(),
        }
    }

    /// Id of the connection this request targets.
    pub fn connection_id(&self) -> &str {
        &self.connection.id
    }
}

// ── Events ─────────────────────────────────────────────────────────

/// Kind of change reported by a monitoring stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionEventType {
    /// Complete authoritative snapshot at subscription time.
    InitialStateTransfer,
    /// Connections that changed but are still alive.
    Update,
    /// Connections the server no longer has.
    Delete,
}

impl std::fmt::Display for ConnectionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionEventType::InitialStateTransfer => "INITIAL_STATE_TRANSFER",
            ConnectionEventType::Update => "UPDATE",
            ConnectionEventType::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// One notification from a connection monitoring stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionEvent {
    #[serde(rename = "type")]
    pub event_type: ConnectionEventType,
    /// Connection snapshots keyed by connection id.
    pub connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionEvent {
    pub fn new(
        event_type: ConnectionEventType,
        connections: impl IntoIterator<Item = Connection>,
    ) -> Self {
        Self {
            event_type,
            connections: connections
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
        }
    }

    pub fn initial_state_transfer(connections: impl IntoIterator<Item = Connection>) -> Self {
        Self::new(ConnectionEventType::InitialStateTransfer, connections)
    }

    pub fn update(connections: impl IntoIterator<Item = Connection>) -> Self {
        Self::new(ConnectionEventType::Update, connections)
    }

    pub fn delete(connections: impl IntoIterator<Item = Connection>) -> Self {
        Self::new(ConnectionEventType::Delete, connections)
    }
}

/// Filter applied when subscribing to a monitoring stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MonitorScopeSelector {
    /// Network services to watch. Empty means every connection.
    #[serde(default)]
    pub network_services: Vec<String>,
}

impl MonitorScopeSelector {
    /// Selector matching every connection.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether a connection falls inside this selector.
    pub fn matches(&self, conn: &Connection) -> bool {
        self.network_services.is_empty()
            || self.network_services.iter().any(|ns| *ns == conn.network_service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_constructor_keys_by_id() {
        let event = ConnectionEvent::delete([
            Connection::new("conn-1", "ns-1"),
            Connection::new("conn-2", "ns-2"),
        ]);
        assert_eq!(event.event_type, ConnectionEventType::Delete);
        assert_eq!(event.connections.len(), 2);
        assert_eq!(event.connections["conn-2"].network_service, "ns-2");
    }

    #[test]
    fn event_type_uses_wire_names() {
        let event = ConnectionEvent::initial_state_transfer(Vec::new());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"INITIAL_STATE_TRANSFER\""));
        assert_eq!(ConnectionEventType::Update.to_string(), "UPDATE");
    }

    #[test]
    fn selector_matches_listed_services_only() {
        let conn = Connection::new("conn-1", "ns-1");
        assert!(MonitorScopeSelector::all().matches(&conn));

        let scoped = MonitorScopeSelector {
            network_services: vec!["ns-2".to_string()],
        };
        assert!(!scoped.matches(&conn));
    }

    #[test]
    fn request_exposes_connection_id() {
        let request = NetworkServiceRequest::new(Connection::new("conn-7", "ns-1"));
        assert_eq!(request.connection_id(), "conn-7");
        assert!(request.mechanism_preferences.is_empty());
    }
}
