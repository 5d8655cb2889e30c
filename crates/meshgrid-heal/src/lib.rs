//! meshgrid-heal — self-healing connection reconciliation for MeshGrid.
//!
//! The heal element remembers every connection its chain established and
//! re-establishes any that the control plane silently loses, without the
//! original caller's involvement.
//!
//! # Architecture
//!
//! ```text
//! HealClient (chain element)
//!   ├── request() → next.request() → TrackedRegistry::put
//!   ├── close()   → TrackedRegistry::remove → next.close()
//!   ├── ReconciliationLoop (one background task)
//!   │   ├── MonitorConnectionClient subscription, resubscribed on failure
//!   │   ├── INITIAL_STATE_TRANSFER → heal tracked ids missing from snapshot
//!   │   ├── UPDATE → confirm only
//!   │   ├── DELETE → heal tracked ids named in the event
//!   │   └── stream lost / chain cancelled → heal every tracked id once
//!   └── HealScheduler (JoinSet of heal tasks)
//!       ├── TrackedRegistry::begin_heal gates one heal per id
//!       ├── replays last accepted request through the heal target
//!       └── commits only if the entry was not closed or superseded
//! ```
//!
//! # Lifetimes
//!
//! The chain lifetime token passed to [`HealClientBuilder::spawn`] scopes
//! monitoring: cancelling it ends the subscription and heals everything
//! still tracked. [`HealClient::shutdown`] (or dropping the element) tears
//! the element down and aborts outstanding heals without issuing new ones.

pub mod client;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod stats;

pub use client::{HealClient, HealClientBuilder};
pub use reconcile::ReconciliationLoop;
pub use registry::{HealTicket, TrackedEntry, TrackedRegistry};
pub use retry::HealBackoff;
pub use scheduler::HealScheduler;
pub use stats::{HealStats, HealStatsSnapshot};
