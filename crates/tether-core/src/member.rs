//! Group members and their presence state.

use std::time::{SystemTime, UNIX_EPOCH};
use tether_protocol::{Location, MemberInfo, Timestamp};
use tracing::debug;
use uuid::Uuid;

/// A member identifier.
pub type MemberId = String;

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

/// Generate a fresh member ID.
#[must_use]
pub fn generate_member_id() -> MemberId {
    Uuid::new_v4().to_string()
}

/// Validate a display name, returning it trimmed.
///
/// # Errors
///
/// Returns an error message if the name is blank or longer than `max_len` characters.
pub fn validate_display_name(name: &str, max_len: usize) -> Result<String, &'static str> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Name is required");
    }
    if name.chars().count() > max_len {
        return Err("Name too long");
    }
    Ok(name.to_string())
}

/// A participant of a group.
#[derive(Debug, Clone)]
pub struct Member {
    id: MemberId,
    name: String,
    location: Option<Location>,
    /// When the location was last reported.
    located_at: Option<Timestamp>,
    joined_at: Timestamp,
    last_seen: Timestamp,
    online: bool,
}

impl Member {
    /// Create a new online member.
    #[must_use]
    pub fn new(id: impl Into<MemberId>, name: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            location: None,
            located_at: None,
            joined_at: now,
            last_seen: now,
            online: true,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn location(&self) -> Option<Location> {
        self.location
    }

    #[must_use]
    pub fn located_at(&self) -> Option<Timestamp> {
        self.located_at
    }

    #[must_use]
    pub fn joined_at(&self) -> Timestamp {
        self.joined_at
    }

    #[must_use]
    pub fn last_seen(&self) -> Timestamp {
        self.last_seen
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Update the online flag.
    ///
    /// Going online always refreshes `last_seen`. Going offline refreshes it
    /// only on the transition, so repeated offline marks leave the member untouched.
    ///
    /// Returns `true` if the flag changed.
    pub fn set_online(&mut self, online: bool, now: Timestamp) -> bool {
        let changed = self.online != online;
        if online || changed {
            self.last_seen = now;
        }
        self.online = online;

        if changed {
            debug!(member = %self.id, online, "Presence changed");
        }
        changed
    }

    /// Overwrite the last known location.
    pub fn update_location(&mut self, location: Location, now: Timestamp) {
        self.location = Some(location);
        self.located_at = Some(now);
        self.last_seen = now;
    }

    /// Public snapshot of this member.
    #[must_use]
    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            location: self.location,
            last_seen: self.last_seen,
            is_online: self.online,
        }
    }
}
