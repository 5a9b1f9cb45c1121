//! Realtime relay for Tether.
//!
//! The relay associates live connections with group members and fans events
//! out to every other connection of the same group. All group and member
//! state lives in the [`Registry`]; the relay only keeps the transient
//! connection-to-member association.

use crate::group::{normalize_group_code, GroupId};
use crate::member::unix_millis;
use crate::registry::{Registry, RegistryError};
use crate::room::{FanOut, Room};
use crate::session::{Association, ConnectionId, ConnectionState, Outbox, OutboxReceiver, Session};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{ClientEvent, Location, ServerEvent, Timestamp};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Relay errors.
///
/// These describe why an inbound event was dropped. None of them is fatal to
/// the connection.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The registry refused the operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The connection has not joined a group.
    #[error("Connection is not associated with a group")]
    NotAssociated,

    /// The event names a different group or member than the connection joined as.
    #[error("Event does not match the connection's group membership")]
    AssociationMismatch,

    /// The connection already left.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection is not registered with the relay.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Maximum number of connections reached.
    #[error("Maximum connections reached")]
    TooManyConnections,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Events queued per connection before fan-out starts dropping.
    pub outbox_capacity: usize,
    /// Maximum chat message length in characters.
    pub max_chat_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            outbox_capacity: 256,
            max_chat_length: 2_000,
        }
    }
}

/// What happened when an inbound event was handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Fan-out to the rest of the group.
    pub fan_out: FanOut,
    /// Whether the connection should now be closed.
    pub close: bool,
}

impl Outcome {
    fn relayed(fan_out: FanOut) -> Self {
        Self {
            fan_out,
            close: false,
        }
    }
}

/// The relay.
pub struct Relay {
    /// Shared group state.
    registry: Arc<Registry>,
    /// Live connections per group.
    rooms: DashMap<GroupId, Room>,
    /// Every connected session.
    sessions: DashMap<ConnectionId, Session>,
    /// Configuration.
    config: RelayConfig,
}

impl Relay {
    /// Create a new relay over `registry` with default configuration.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, RelayConfig::default())
    }

    /// Create a new relay with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<Registry>, config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        Self {
            registry,
            rooms: DashMap::new(),
            sessions: DashMap::new(),
            config,
        }
    }

    /// Get the underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connection_count: self.sessions.len(),
            associated_count: self
                .sessions
                .iter()
                .filter(|s| s.state.association().is_some())
                .count(),
            room_count: self.rooms.len(),
        }
    }

    /// Get the state of a connection.
    #[must_use]
    pub fn state(&self, connection_id: &ConnectionId) -> Option<ConnectionState> {
        self.sessions.get(connection_id).map(|s| s.state.clone())
    }

    /// Get the number of live connections associated with a group.
    #[must_use]
    pub fn room_size(&self, group_id: &str) -> usize {
        self.rooms
            .get(&normalize_group_code(group_id))
            .map(|room| room.subscriber_count())
            .unwrap_or(0)
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID and the receiving half of its outbox. Every
    /// event addressed to the connection is queued there.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limit is reached.
    pub fn connect(&self) -> Result<(ConnectionId, OutboxReceiver), RelayError> {
        if self.sessions.len() >= self.config.max_connections {
            return Err(RelayError::TooManyConnections);
        }

        let connection_id = ConnectionId::generate();
        let (outbox, receiver) = mpsc::channel(self.config.outbox_capacity.max(1));
        self.sessions
            .insert(connection_id.clone(), Session::new(outbox));

        debug!(connection = %connection_id, "Connection registered");
        Ok((connection_id, receiver))
    }

    /// Handle one inbound event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event was dropped. The connection stays usable.
    pub fn handle(
        &self,
        connection_id: &ConnectionId,
        event: ClientEvent,
    ) -> Result<Outcome, RelayError> {
        match event {
            ClientEvent::JoinFamily {
                group_id,
                member_id,
                name,
            } => self.join(connection_id, &group_id, &member_id, name.as_deref()),

            ClientEvent::UpdateLocation {
                group_id,
                member_id,
                location,
            } => self.update_location(connection_id, &group_id, &member_id, location),

            ClientEvent::SendMessage { group_id, message } => {
                self.send_message(connection_id, &group_id, &message)
            }

            ClientEvent::SendSos { group_id, location } => {
                self.send_sos(connection_id, &group_id, location)
            }

            ClientEvent::LeaveFamily(_) => self.leave(connection_id),
        }
    }

    /// Remove a connection.
    ///
    /// If the connection was associated, its member is marked offline and the
    /// rest of the group is told, unless the member is still connected elsewhere.
    /// Calling this twice is a no-op.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> FanOut {
        let Some((_, session)) = self.sessions.remove(connection_id) else {
            return FanOut::default();
        };

        let fan_out = match &session.state {
            ConnectionState::Associated(association) => self.detach(connection_id, association),
            _ => FanOut::default(),
        };

        debug!(
            connection = %connection_id,
            duration_ms = unix_millis().saturating_sub(session.connected_at),
            "Connection removed"
        );
        fan_out
    }

    /// Evict groups older than `max_age` and tear down their rooms.
    ///
    /// Connections of an evicted group receive `group-expired` and go back to
    /// the unassociated state. Returns the evicted group IDs.
    pub fn sweep(&self, now: Timestamp, max_age: Duration) -> Vec<GroupId> {
        let evicted = self.registry.evict_expired(now, max_age);

        for group_id in &evicted {
            let Some((_, room)) = self.rooms.remove(group_id) else {
                continue;
            };

            let notice = Arc::new(ServerEvent::GroupExpired {
                group_id: group_id.clone(),
            });

            for (connection_id, subscriber) in room.into_subscribers() {
                if subscriber.outbox.try_send(Arc::clone(&notice)).is_err() {
                    debug!(connection = %connection_id, "Could not deliver group-expired");
                }
                if let Some(mut session) = self.sessions.get_mut(&connection_id) {
                    let belongs = session
                        .state
                        .association()
                        .is_some_and(|a| &a.group_id == group_id);
                    if belongs {
                        session.state = ConnectionState::Unassociated;
                    }
                }
            }
        }

        evicted
    }

    /// `join-family`: associate the connection with a group member.
    fn join(
        &self,
        connection_id: &ConnectionId,
        group_id: &str,
        member_id: &str,
        claimed_name: Option<&str>,
    ) -> Result<Outcome, RelayError> {
        let (outbox, current) = self.session_parts(connection_id)?;
        let group_id = normalize_group_code(group_id);
        let target = Association {
            group_id: group_id.clone(),
            member_id: member_id.to_string(),
        };

        if current.as_ref() == Some(&target) {
            debug!(connection = %connection_id, group = %group_id, "Already joined, resending members");
            let members = self.registry.list_members(&group_id)?;
            send_to(&outbox, ServerEvent::FamilyMembers(members));
            return Ok(Outcome::default());
        }

        // Authenticate before touching the existing association
        let member = match self.registry.member(&group_id, member_id) {
            Ok(member) => member,
            Err(e) => {
                warn!(connection = %connection_id, group = %group_id, error = %e, "Join refused");
                send_to(&outbox, ServerEvent::error(e.code(), e.to_string()));
                return Err(e.into());
            }
        };

        if let Some(claimed) = claimed_name {
            if claimed.trim() != member.name {
                debug!(
                    connection = %connection_id,
                    member = %member_id,
                    claimed = %claimed,
                    "Join name differs from registered name"
                );
            }
        }

        let mut fan_out = FanOut::default();
        if let Some(previous) = current {
            fan_out = self.detach(connection_id, &previous);
        }
        self.set_state(connection_id, ConnectionState::Associated(target.clone()));

        // Presence and member-joined are decided under the room guard
        let joined = {
            let mut room = self
                .rooms
                .entry(group_id.clone())
                .or_insert_with(|| Room::new(group_id.clone()));
            let was_connected = room.is_member_connected(member_id);
            room.subscribe(connection_id.clone(), member_id.to_string(), outbox.clone());

            // The group may have been evicted since it was looked up.
            match self.registry.set_member_online(&group_id, member_id, true) {
                Some(member) if !was_connected => {
                    let event = Arc::new(ServerEvent::MemberJoined {
                        id: member.id,
                        name: member.name,
                        timestamp: member.last_seen,
                    });
                    Some(room.broadcast_except(Some(connection_id), &event))
                }
                Some(_) => Some(FanOut::default()),
                None => {
                    room.unsubscribe(connection_id);
                    None
                }
            }
        };

        let Some(joined) = joined else {
            self.remove_room_if_empty(&group_id);
            self.set_state(connection_id, ConnectionState::Unassociated);
            let e = RegistryError::GroupNotFound(group_id);
            send_to(&outbox, ServerEvent::error(e.code(), e.to_string()));
            return Err(e.into());
        };
        fan_out = fan_out.merge(joined);

        let members = self.registry.list_members(&group_id).unwrap_or_default();
        send_to(&outbox, ServerEvent::FamilyMembers(members));

        info!(connection = %connection_id, group = %group_id, member = %member_id, "Connection joined group");
        Ok(Outcome::relayed(fan_out))
    }

    /// `update-location`: store the position and share it with the group.
    fn update_location(
        &self,
        connection_id: &ConnectionId,
        group_id: &str,
        member_id: &str,
        location: Location,
    ) -> Result<Outcome, RelayError> {
        let association = self.require_association(connection_id, group_id, Some(member_id))?;
        let member =
            self.registry
                .update_location(&association.group_id, &association.member_id, location)?;

        let event = ServerEvent::MemberLocationUpdated {
            member_id: member.id,
            name: member.name,
            location,
            timestamp: member.last_seen,
        };
        Ok(Outcome::relayed(self.broadcast(
            &association.group_id,
            Some(connection_id),
            event,
        )))
    }

    /// `send-message`: relay a chat message to the group.
    fn send_message(
        &self,
        connection_id: &ConnectionId,
        group_id: &str,
        message: &str,
    ) -> Result<Outcome, RelayError> {
        let association = self.require_association(connection_id, group_id, None)?;

        let message = message.trim();
        if message.is_empty() {
            return Err(RegistryError::InvalidInput("Message cannot be empty").into());
        }
        if message.chars().count() > self.config.max_chat_length {
            return Err(RegistryError::InvalidInput("Message too long").into());
        }

        let member = self
            .registry
            .member(&association.group_id, &association.member_id)?;

        let event = ServerEvent::NewMessage {
            member_id: member.id,
            name: member.name,
            message: message.to_string(),
            timestamp: unix_millis(),
        };
        Ok(Outcome::relayed(self.broadcast(
            &association.group_id,
            Some(connection_id),
            event,
        )))
    }

    /// `send-sos`: alert the group, falling back to the last known location.
    fn send_sos(
        &self,
        connection_id: &ConnectionId,
        group_id: &str,
        location: Option<Location>,
    ) -> Result<Outcome, RelayError> {
        let association = self.require_association(connection_id, group_id, None)?;

        if let Some(location) = &location {
            location.validate().map_err(RegistryError::InvalidInput)?;
        }

        let member = self
            .registry
            .member(&association.group_id, &association.member_id)?;

        warn!(
            connection = %connection_id,
            group = %association.group_id,
            member = %member.id,
            "SOS alert"
        );

        let event = ServerEvent::SosAlert {
            location: location.or(member.location),
            member_id: member.id,
            name: member.name,
            timestamp: unix_millis(),
        };
        Ok(Outcome::relayed(self.broadcast(
            &association.group_id,
            Some(connection_id),
            event,
        )))
    }

    /// `leave-family`: run the leave effects and close the connection.
    fn leave(&self, connection_id: &ConnectionId) -> Result<Outcome, RelayError> {
        let (_, current) = self.session_parts(connection_id)?;
        self.set_state(connection_id, ConnectionState::Closed);

        let fan_out = match current {
            Some(association) => self.detach(connection_id, &association),
            None => FanOut::default(),
        };

        debug!(connection = %connection_id, "Connection left");
        Ok(Outcome {
            fan_out,
            close: true,
        })
    }

    /// Release a connection's subscription and update presence.
    ///
    /// The member goes offline only when this was their last connection.
    fn detach(&self, connection_id: &ConnectionId, association: &Association) -> FanOut {
        let group_id = &association.group_id;
        let member_id = &association.member_id;

        let Some(mut room) = self.rooms.get_mut(group_id) else {
            self.registry.set_member_online(group_id, member_id, false);
            return FanOut::default();
        };

        room.unsubscribe(connection_id);
        let fan_out = if room.is_member_connected(member_id) {
            debug!(group = %group_id, member = %member_id, "Member still connected elsewhere");
            FanOut::default()
        } else {
            match self.registry.set_member_online(group_id, member_id, false) {
                Some(member) => {
                    let event = Arc::new(ServerEvent::MemberLeft {
                        id: member.id,
                        name: member.name,
                        timestamp: member.last_seen,
                    });
                    room.broadcast_except(Some(connection_id), &event)
                }
                None => {
                    debug!(group = %group_id, member = %member_id, "Group gone, skipping member-left");
                    FanOut::default()
                }
            }
        };
        let empty = room.is_empty();
        drop(room);

        if empty {
            self.remove_room_if_empty(group_id);
        }
        fan_out
    }

    fn remove_room_if_empty(&self, group_id: &str) {
        if self.rooms.remove_if(group_id, |_, room| room.is_empty()).is_some() {
            debug!(group = %group_id, "Deleted empty room");
        }
    }

    fn broadcast(&self, group_id: &str, origin: Option<&ConnectionId>, event: ServerEvent) -> FanOut {
        let event = Arc::new(event);
        self.rooms
            .get(group_id)
            .map(|room| room.broadcast_except(origin, &event))
            .unwrap_or_default()
    }

    fn session_parts(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<(Outbox, Option<Association>), RelayError> {
        let session = self
            .sessions
            .get(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;

        match &session.state {
            ConnectionState::Closed => Err(RelayError::ConnectionClosed),
            state => Ok((session.outbox.clone(), state.association().cloned())),
        }
    }

    fn require_association(
        &self,
        connection_id: &ConnectionId,
        group_id: &str,
        member_id: Option<&str>,
    ) -> Result<Association, RelayError> {
        let (_, current) = self.session_parts(connection_id)?;
        let association = current.ok_or(RelayError::NotAssociated)?;

        if normalize_group_code(group_id) != association.group_id {
            return Err(RelayError::AssociationMismatch);
        }
        if member_id.is_some_and(|m| m != association.member_id) {
            return Err(RelayError::AssociationMismatch);
        }
        Ok(association)
    }

    fn set_state(&self, connection_id: &ConnectionId, state: ConnectionState) {
        if let Some(mut session) = self.sessions.get_mut(connection_id) {
            session.state = state;
        }
    }
}

/// Queue an event for a single connection.
fn send_to(outbox: &Outbox, event: ServerEvent) {
    if outbox.try_send(Arc::new(event)).is_err() {
        warn!("Outbox full or closed, dropping direct event");
    }
}

/// Relay statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of connections joined to a group.
    pub associated_count: usize,
    /// Number of groups with at least one live connection.
    pub room_count: usize,
}
