//! meshgrid-core — shared vocabulary for MeshGrid chain elements.
//!
//! Defines the control-plane records (`Connection`, `NetworkServiceRequest`,
//! `ConnectionEvent`), the two seams every element talks through
//! (`NetworkServiceClient` and `MonitorConnectionClient`), heal
//! configuration, and a channel-backed monitor source.

pub mod client;
pub mod config;
pub mod error;
pub mod eventchannel;
pub mod types;

pub use client::{ConnectionEventStream, MonitorConnectionClient, NetworkServiceClient, TailClient};
pub use config::{HealConfig, RetryPolicy};
pub use error::{ChainError, ChainResult, ConfigError};
pub use eventchannel::EventChannel;
pub use types::*;
