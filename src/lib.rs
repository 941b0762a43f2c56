//! VibeMQ - MQTT v3.1/v3.1.1/v5 protocol engine
//!
//! A per-connection MQTT broker core: terminates a single client's network
//! session, parses control packets, drives the CONNECT/DISCONNECT lifecycle,
//! and enforces QoS 0/1/2 delivery in both directions.

pub mod auth;
pub mod broker;
pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;

pub use auth::AuthProvider;
pub use broker::Broker;
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use metrics::{Metrics, MetricsServer};
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
pub use session::{Session, SessionStore};
