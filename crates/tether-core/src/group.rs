//! Group abstraction for Tether.
//!
//! A group is a short-lived set of members identified by a human-typable code.

use crate::member::{Member, MemberId};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tether_protocol::{MemberInfo, Timestamp};

/// Length of generated group codes.
pub const GROUP_CODE_LENGTH: usize = 6;

/// Characters used in group codes.
const GROUP_CODE_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A group identifier.
pub type GroupId = String;

/// Generate a random group code.
#[must_use]
pub fn generate_group_code<R: Rng + ?Sized>(rng: &mut R) -> GroupId {
    (0..GROUP_CODE_LENGTH)
        .map(|_| GROUP_CODE_ALPHABET[rng.random_range(0..GROUP_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Normalize a group code typed by a user.
#[must_use]
pub fn normalize_group_code(code: &str) -> GroupId {
    code.trim().to_ascii_uppercase()
}

/// A group of members.
#[derive(Debug)]
pub struct Group {
    id: GroupId,
    created_at: Timestamp,
    members: HashMap<MemberId, Member>,
}

impl Group {
    /// Create a new empty group.
    #[must_use]
    pub fn new(id: impl Into<GroupId>, created_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            created_at,
            members: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Get the number of members, online or not.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Get the number of online members.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.members.values().filter(|m| m.is_online()).count()
    }

    /// Add a member. An existing member with the same ID is replaced.
    pub fn add_member(&mut self, member: Member) {
        self.members.insert(member.id().to_string(), member);
    }

    #[must_use]
    pub fn member(&self, member_id: &str) -> Option<&Member> {
        self.members.get(member_id)
    }

    pub fn member_mut(&mut self, member_id: &str) -> Option<&mut Member> {
        self.members.get_mut(member_id)
    }

    /// Snapshot of all members.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MemberInfo> {
        self.members.values().map(Member::info).collect()
    }

    /// Check whether the group is older than `max_age` at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp, max_age: Duration) -> bool {
        u128::from(now.saturating_sub(self.created_at)) > max_age.as_millis()
    }
}
