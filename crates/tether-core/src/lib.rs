//! # tether-core
//!
//! Group registry and realtime relay for Tether.
//!
//! This crate provides the stateful heart of the service:
//!
//! - **Registry** - In-memory table of groups and members, with presence and eviction
//! - **Relay** - Connection state machine and per-group fan-out
//! - **Room** - The live connections associated with one group
//! - **Member** / **Group** - Domain types owned by the registry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│    Room     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Registry   │
//!                     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_core::{Registry, Relay};
//! use tether_protocol::{ClientEvent, ServerEvent};
//!
//! let registry = Arc::new(Registry::new());
//! let created = registry.create_group("Alice").unwrap();
//! let relay = Relay::new(registry);
//!
//! let (conn, mut outbox) = relay.connect().unwrap();
//! relay
//!     .handle(&conn, ClientEvent::join(&created.group_id, &created.member_id))
//!     .unwrap();
//!
//! let snapshot = outbox.try_recv().unwrap();
//! assert!(matches!(*snapshot, ServerEvent::FamilyMembers(_)));
//! ```

pub mod group;
pub mod member;
pub mod registry;
pub mod relay;
pub mod room;
pub mod session;

pub use group::{Group, GroupId};
pub use member::{unix_millis, Member, MemberId};
pub use registry::{Joined, Registry, RegistryConfig, RegistryError, RegistryStats};
pub use relay::{Outcome, Relay, RelayConfig, RelayError, RelayStats};
pub use room::FanOut;
pub use session::{Association, ConnectionId, ConnectionState, OutboxReceiver};
