//! Rooms: the live connections associated with one group.

use crate::group::GroupId;
use crate::member::MemberId;
use crate::session::{ConnectionId, Outbox};
use std::collections::HashMap;
use std::sync::Arc;
use tether_protocol::ServerEvent;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

/// Result of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Outboxes the event was queued on.
    pub delivered: usize,
    /// Recipients that were skipped because their outbox was full or closed.
    pub dropped: usize,
}

impl FanOut {
    /// Combine two fan-out counts.
    #[must_use]
    pub fn merge(self, other: FanOut) -> FanOut {
        FanOut {
            delivered: self.delivered + other.delivered,
            dropped: self.dropped + other.dropped,
        }
    }
}

/// A connection subscribed to a room.
#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) member_id: MemberId,
    pub(crate) outbox: Outbox,
}

/// The set of connections associated with a group.
#[derive(Debug)]
pub(crate) struct Room {
    group_id: GroupId,
    subscribers: HashMap<ConnectionId, Subscriber>,
}

impl Room {
    pub(crate) fn new(group_id: impl Into<GroupId>) -> Self {
        Self {
            group_id: group_id.into(),
            subscribers: HashMap::new(),
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Check if any connection in the room speaks for `member_id`.
    pub(crate) fn is_member_connected(&self, member_id: &str) -> bool {
        self.subscribers.values().any(|s| s.member_id == member_id)
    }

    pub(crate) fn subscribe(&mut self, connection_id: ConnectionId, member_id: MemberId, outbox: Outbox) {
        debug!(group = %self.group_id, connection = %connection_id, member = %member_id, "Connection subscribed");
        self.subscribers
            .insert(connection_id, Subscriber { member_id, outbox });
    }

    pub(crate) fn unsubscribe(&mut self, connection_id: &ConnectionId) -> Option<Subscriber> {
        let removed = self.subscribers.remove(connection_id);
        if removed.is_some() {
            debug!(group = %self.group_id, connection = %connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Queue `event` on every subscriber except `origin`.
    ///
    /// Never blocks: a full outbox drops the event for that recipient only.
    pub(crate) fn broadcast_except(
        &self,
        origin: Option<&ConnectionId>,
        event: &Arc<ServerEvent>,
    ) -> FanOut {
        let mut fan_out = FanOut::default();

        for (connection_id, subscriber) in &self.subscribers {
            if Some(connection_id) == origin {
                continue;
            }
            match subscriber.outbox.try_send(Arc::clone(event)) {
                Ok(()) => fan_out.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        group = %self.group_id,
                        connection = %connection_id,
                        event = %event.kind(),
                        "Outbox full, dropping event"
                    );
                    fan_out.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(group = %self.group_id, connection = %connection_id, "Outbox closed");
                    fan_out.dropped += 1;
                }
            }
        }

        trace!(
            group = %self.group_id,
            event = %event.kind(),
            delivered = fan_out.delivered,
            dropped = fan_out.dropped,
            "Fan-out"
        );
        fan_out
    }

    pub(crate) fn into_subscribers(self) -> impl Iterator<Item = (ConnectionId, Subscriber)> {
        self.subscribers.into_iter()
    }
}
