//! Event types for the Tether protocol.
//!
//! Every message on a relay connection is one event, serialized as
//! `{"event": "<name>", "data": <payload>}` with camelCase payload fields.

use serde::{Deserialize, Serialize};

/// Current protocol version, announced in the `connected` event.
pub const PROTOCOL_VERSION: u8 = 1;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Event names, used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JoinFamily,
    UpdateLocation,
    SendMessage,
    SendSos,
    LeaveFamily,
    Connected,
    FamilyMembers,
    MemberJoined,
    MemberLeft,
    MemberLocationUpdated,
    NewMessage,
    SosAlert,
    GroupExpired,
    Error,
}

impl EventKind {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JoinFamily => "join-family",
            EventKind::UpdateLocation => "update-location",
            EventKind::SendMessage => "send-message",
            EventKind::SendSos => "send-sos",
            EventKind::LeaveFamily => "leave-family",
            EventKind::Connected => "connected",
            EventKind::FamilyMembers => "family-members",
            EventKind::MemberJoined => "member-joined",
            EventKind::MemberLeft => "member-left",
            EventKind::MemberLocationUpdated => "member-location-updated",
            EventKind::NewMessage => "new-message",
            EventKind::SosAlert => "sos-alert",
            EventKind::GroupExpired => "group-expired",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
}

impl Location {
    /// Create a new location.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Validate that the coordinates are finite and within range.
    ///
    /// # Errors
    ///
    /// Returns an error message describing the invalid coordinate.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err("Coordinates must be finite");
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err("Latitude out of range");
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err("Longitude out of range");
        }
        Ok(())
    }
}

/// Public view of a group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    /// Member ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Last known location, `null` until the first update.
    pub location: Option<Location>,
    /// Last activity timestamp.
    pub last_seen: Timestamp,
    /// Whether a live connection is associated with this member.
    pub is_online: bool,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Associate this connection with a group member.
    #[serde(rename_all = "camelCase")]
    JoinFamily {
        group_id: String,
        member_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Report the member's current position.
    #[serde(rename_all = "camelCase")]
    UpdateLocation {
        group_id: String,
        member_id: String,
        location: Location,
    },

    /// Send a chat message to the group.
    #[serde(rename_all = "camelCase")]
    SendMessage { group_id: String, message: String },

    /// Broadcast an SOS alert to the group.
    #[serde(rename_all = "camelCase")]
    SendSos {
        group_id: String,
        #[serde(default)]
        location: Option<Location>,
    },

    /// Leave the group and close the connection.
    ///
    /// `data` may be absent, `null` or `{}`.
    LeaveFamily(Option<Leave>),
}

/// Body of `leave-family`. Carries no fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {}

impl ClientEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::JoinFamily { .. } => EventKind::JoinFamily,
            ClientEvent::UpdateLocation { .. } => EventKind::UpdateLocation,
            ClientEvent::SendMessage { .. } => EventKind::SendMessage,
            ClientEvent::SendSos { .. } => EventKind::SendSos,
            ClientEvent::LeaveFamily(_) => EventKind::LeaveFamily,
        }
    }

    /// Create a `leave-family` event.
    #[must_use]
    pub fn leave() -> Self {
        ClientEvent::LeaveFamily(None)
    }

    /// Create a `join-family` event.
    #[must_use]
    pub fn join(group_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        ClientEvent::JoinFamily {
            group_id: group_id.into(),
            member_id: member_id.into(),
            name: None,
        }
    }

    /// Create an `update-location` event.
    #[must_use]
    pub fn location(
        group_id: impl Into<String>,
        member_id: impl Into<String>,
        location: Location,
    ) -> Self {
        ClientEvent::UpdateLocation {
            group_id: group_id.into(),
            member_id: member_id.into(),
            location,
        }
    }

    /// Create a `send-message` event.
    #[must_use]
    pub fn message(group_id: impl Into<String>, message: impl Into<String>) -> Self {
        ClientEvent::SendMessage {
            group_id: group_id.into(),
            message: message.into(),
        }
    }

    /// Create a `send-sos` event.
    #[must_use]
    pub fn sos(group_id: impl Into<String>, location: Option<Location>) -> Self {
        ClientEvent::SendSos {
            group_id: group_id.into(),
            location,
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Connection established.
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        version: u8,
        /// Heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Full member snapshot, sent to a connection after it joins.
    FamilyMembers(Vec<MemberInfo>),

    /// Another member came online.
    MemberJoined {
        id: String,
        name: String,
        timestamp: Timestamp,
    },

    /// Another member went offline.
    MemberLeft {
        id: String,
        name: String,
        timestamp: Timestamp,
    },

    #[serde(rename_all = "camelCase")]
    MemberLocationUpdated {
        member_id: String,
        name: String,
        location: Location,
        timestamp: Timestamp,
    },

    #[serde(rename_all = "camelCase")]
    NewMessage {
        member_id: String,
        name: String,
        message: String,
        timestamp: Timestamp,
    },

    #[serde(rename_all = "camelCase")]
    SosAlert {
        member_id: String,
        name: String,
        location: Option<Location>,
        timestamp: Timestamp,
    },

    /// The group reached its maximum age and was removed.
    #[serde(rename_all = "camelCase")]
    GroupExpired { group_id: String },

    /// A request on this connection was refused.
    Error { code: u16, message: String },
}

impl ServerEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connected { .. } => EventKind::Connected,
            ServerEvent::FamilyMembers(_) => EventKind::FamilyMembers,
            ServerEvent::MemberJoined { .. } => EventKind::MemberJoined,
            ServerEvent::MemberLeft { .. } => EventKind::MemberLeft,
            ServerEvent::MemberLocationUpdated { .. } => EventKind::MemberLocationUpdated,
            ServerEvent::NewMessage { .. } => EventKind::NewMessage,
            ServerEvent::SosAlert { .. } => EventKind::SosAlert,
            ServerEvent::GroupExpired { .. } => EventKind::GroupExpired,
            ServerEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Create a `connected` event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_shape() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "update-location",
            "data": {
                "groupId": "ABC123",
                "memberId": "m1",
                "location": { "lat": 40.7128, "lng": -74.006 }
            }
        }))
        .unwrap();

        assert_eq!(
            event,
            ClientEvent::location("ABC123", "m1", Location::new(40.7128, -74.006))
        );
        assert_eq!(event.kind(), EventKind::UpdateLocation);
    }

    #[test]
    fn test_join_family_name_optional() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "join-family",
            "data": { "groupId": "ABC123", "memberId": "m1" }
        }))
        .unwrap();
        assert_eq!(event, ClientEvent::join("ABC123", "m1"));
    }

    #[test]
    fn test_sos_without_location() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "send-sos",
            "data": { "groupId": "ABC123" }
        }))
        .unwrap();
        assert_eq!(event, ClientEvent::sos("ABC123", None));
    }

    #[test]
    fn test_leave_family_payloads() {
        for data in [None, Some(json!(null))] {
            let mut value = json!({ "event": "leave-family" });
            if let Some(data) = data {
                value["data"] = data;
            }
            let event: ClientEvent = serde_json::from_value(value).unwrap();
            assert_eq!(event, ClientEvent::leave());
        }

        let event: ClientEvent =
            serde_json::from_value(json!({ "event": "leave-family", "data": {} })).unwrap();
        assert_eq!(event, ClientEvent::LeaveFamily(Some(Leave {})));
        assert_eq!(event.kind(), EventKind::LeaveFamily);
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({ "event": "subscribe", "data": {} }));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::MemberLocationUpdated {
            member_id: "m2".into(),
            name: "Bob".into(),
            location: Location::new(1.5, 2.5),
            timestamp: 42,
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "member-location-updated",
                "data": {
                    "memberId": "m2",
                    "name": "Bob",
                    "location": { "lat": 1.5, "lng": 2.5 },
                    "timestamp": 42
                }
            })
        );
    }

    #[test]
    fn test_member_snapshot_serializes_null_location() {
        let event = ServerEvent::FamilyMembers(vec![MemberInfo {
            id: "m1".into(),
            name: "Alice".into(),
            location: None,
            last_seen: 7,
            is_online: true,
        }]);

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "family-members",
                "data": [{
                    "id": "m1",
                    "name": "Alice",
                    "location": null,
                    "lastSeen": 7,
                    "isOnline": true
                }]
            })
        );
    }

    #[test]
    fn test_location_validation() {
        assert!(Location::new(0.0, 0.0).validate().is_ok());
        assert!(Location::new(90.0, -180.0).validate().is_ok());
        assert!(Location::new(90.1, 0.0).validate().is_err());
        assert!(Location::new(0.0, 180.5).validate().is_err());
        assert!(Location::new(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(ServerEvent::error(404, "x").kind().as_str(), "error");
        assert_eq!(EventKind::SosAlert.to_string(), "sos-alert");
    }
}
