//! Per-connection relay state.

use crate::group::GroupId;
use crate::member::{unix_millis, MemberId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_protocol::{ServerEvent, Timestamp};
use tokio::sync::mpsc;

/// Counter mixed into connection IDs generated within the same millisecond.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sending half of a connection's outbox.
pub type Outbox = mpsc::Sender<Arc<ServerEvent>>;

/// Receiving half of a connection's outbox.
pub type OutboxReceiver = mpsc::Receiver<Arc<ServerEvent>>;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", unix_millis(), counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The group member a connection speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub group_id: GroupId,
    pub member_id: MemberId,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, not yet joined to a group.
    Unassociated,
    /// Joined to a group as a member.
    Associated(Association),
    /// Left or disconnected. Terminal.
    Closed,
}

impl ConnectionState {
    /// Get the association, if any.
    #[must_use]
    pub fn association(&self) -> Option<&Association> {
        match self {
            ConnectionState::Associated(association) => Some(association),
            _ => None,
        }
    }
}

/// Relay-side view of a live connection.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) outbox: Outbox,
    pub(crate) state: ConnectionState,
    pub(crate) connected_at: Timestamp,
}

impl Session {
    pub(crate) fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            state: ConnectionState::Unassociated,
            connected_at: unix_millis(),
        }
    }
}
