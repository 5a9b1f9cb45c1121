//! In-memory group registry for Tether.
//!
//! The registry owns every group and member. Each operation takes a single
//! entry lock for a short synchronous mutation and validates its input before
//! touching any state.

use crate::group::{generate_group_code, normalize_group_code, Group, GroupId};
use crate::member::{generate_member_id, unix_millis, validate_display_name, Member, MemberId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_protocol::{Location, MemberInfo, Timestamp};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Attempts at finding an unused group code before giving up.
const MAX_CODE_ATTEMPTS: usize = 16;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Missing or malformed input.
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    /// Group not found.
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Member not found in the group.
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    /// Group has reached its member limit.
    #[error("Group is full: {0}")]
    GroupFull(String),

    /// Maximum number of groups reached.
    #[error("Maximum number of groups reached")]
    CapacityReached,
}

impl RegistryError {
    /// Check if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::GroupNotFound(_) | RegistryError::MemberNotFound(_)
        )
    }

    /// HTTP-style status code for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RegistryError::InvalidInput(_) => 400,
            RegistryError::GroupNotFound(_) | RegistryError::MemberNotFound(_) => 404,
            RegistryError::GroupFull(_) => 409,
            RegistryError::CapacityReached => 503,
        }
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of active groups.
    pub max_groups: usize,
    /// Maximum members per group, online or not.
    pub max_members_per_group: usize,
    /// Maximum display name length in characters.
    pub max_name_length: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_groups: 10_000,
            max_members_per_group: 100,
            max_name_length: 64,
        }
    }
}

/// Result of creating or joining a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub group_id: GroupId,
    pub member_id: MemberId,
    /// The display name as stored (trimmed).
    pub name: String,
}

/// The group registry.
pub struct Registry {
    /// Groups indexed by code.
    groups: DashMap<GroupId, Group>,
    /// Group slots in use, reserved before a group is inserted.
    reserved: AtomicUsize,
    /// Configuration.
    config: RegistryConfig,
}

impl Registry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating registry with config: {:?}", config);
        Self {
            groups: DashMap::new(),
            reserved: AtomicUsize::new(0),
            config,
        }
    }

    /// Get the registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            group_count: 0,
            member_count: 0,
            online_count: 0,
        };
        for group in self.groups.iter() {
            stats.group_count += 1;
            stats.member_count += group.member_count();
            stats.online_count += group.online_count();
        }
        stats
    }

    /// Create a group with its first member.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or the group limit is reached.
    pub fn create_group(&self, creator_name: &str) -> Result<Joined, RegistryError> {
        self.create_group_with_rng(creator_name, &mut rand::rng())
    }

    /// Create a group, drawing the group code from `rng`.
    ///
    /// Codes already in use are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or the group limit is reached.
    pub fn create_group_with_rng<R: Rng + ?Sized>(
        &self,
        creator_name: &str,
        rng: &mut R,
    ) -> Result<Joined, RegistryError> {
        let name = validate_display_name(creator_name, self.config.max_name_length)
            .map_err(RegistryError::InvalidInput)?;

        self.reserve_slot()?;

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_group_code(rng);
            let Entry::Vacant(slot) = self.groups.entry(code) else {
                trace!("Group code collision, retrying");
                continue;
            };

            let group_id = slot.key().clone();
            let member_id = generate_member_id();
            let now = unix_millis();

            let mut group = Group::new(group_id.clone(), now);
            group.add_member(Member::new(member_id.clone(), name.clone(), now));
            slot.insert(group);

            info!(group = %group_id, member = %member_id, "Created group");

            return Ok(Joined {
                group_id,
                member_id,
                name,
            });
        }

        self.reserved.fetch_sub(1, Ordering::AcqRel);
        Err(RegistryError::CapacityReached)
    }

    /// Take one group slot, failing once `max_groups` are in use.
    fn reserve_slot(&self) -> Result<(), RegistryError> {
        let max = self.config.max_groups;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| RegistryError::CapacityReached)
    }

    /// Add a new member to an existing group.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank, the group does not exist, or it is full.
    pub fn join_group(&self, group_id: &str, name: &str) -> Result<Joined, RegistryError> {
        let name = validate_display_name(name, self.config.max_name_length)
            .map_err(RegistryError::InvalidInput)?;
        let group_id = normalize_group_code(group_id);
        if group_id.is_empty() {
            return Err(RegistryError::InvalidInput("Group ID is required"));
        }

        let mut group = self
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| RegistryError::GroupNotFound(group_id.clone()))?;

        if group.member_count() >= self.config.max_members_per_group {
            return Err(RegistryError::GroupFull(group_id));
        }

        let member_id = generate_member_id();
        group.add_member(Member::new(member_id.clone(), name.clone(), unix_millis()));

        debug!(
            group = %group_id,
            member = %member_id,
            members = group.member_count(),
            "Member joined group"
        );

        Ok(Joined {
            group_id,
            member_id,
            name,
        })
    }

    /// Snapshot of every member of a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the group does not exist.
    pub fn list_members(&self, group_id: &str) -> Result<Vec<MemberInfo>, RegistryError> {
        let group_id = normalize_group_code(group_id);
        self.groups
            .get(&group_id)
            .map(|group| group.snapshot())
            .ok_or(RegistryError::GroupNotFound(group_id))
    }

    /// Look up a single member.
    ///
    /// # Errors
    ///
    /// Returns an error if the group or the member does not exist.
    pub fn member(&self, group_id: &str, member_id: &str) -> Result<MemberInfo, RegistryError> {
        let group_id = normalize_group_code(group_id);
        let group = self
            .groups
            .get(&group_id)
            .ok_or(RegistryError::GroupNotFound(group_id))?;

        group
            .member(member_id)
            .map(Member::info)
            .ok_or_else(|| RegistryError::MemberNotFound(member_id.to_string()))
    }

    /// Mark a member online or offline.
    ///
    /// Returns the updated member, or `None` if the group or member is unknown.
    pub fn set_member_online(
        &self,
        group_id: &str,
        member_id: &str,
        online: bool,
    ) -> Option<MemberInfo> {
        let group_id = normalize_group_code(group_id);
        let Some(mut group) = self.groups.get_mut(&group_id) else {
            debug!(group = %group_id, member = %member_id, "Presence update for unknown group");
            return None;
        };

        let member = group.member_mut(member_id)?;
        member.set_online(online, unix_millis());
        Some(member.info())
    }

    /// Overwrite a member's last known location.
    ///
    /// # Errors
    ///
    /// Returns an error if the location is invalid or the group or member is unknown.
    /// No state is changed on error.
    pub fn update_location(
        &self,
        group_id: &str,
        member_id: &str,
        location: Location,
    ) -> Result<MemberInfo, RegistryError> {
        location.validate().map_err(RegistryError::InvalidInput)?;

        let group_id = normalize_group_code(group_id);
        let mut group = self
            .groups
            .get_mut(&group_id)
            .ok_or(RegistryError::GroupNotFound(group_id))?;

        let member = group
            .member_mut(member_id)
            .ok_or_else(|| RegistryError::MemberNotFound(member_id.to_string()))?;

        member.update_location(location, unix_millis());
        Ok(member.info())
    }

    /// Check if a group exists.
    #[must_use]
    pub fn group_exists(&self, group_id: &str) -> bool {
        self.groups.contains_key(&normalize_group_code(group_id))
    }

    /// Get a group's creation timestamp.
    #[must_use]
    pub fn created_at(&self, group_id: &str) -> Option<Timestamp> {
        self.groups
            .get(&normalize_group_code(group_id))
            .map(|group| group.created_at())
    }

    /// Remove every group older than `max_age` at `now`.
    ///
    /// Activity is ignored; only the creation time counts.
    /// Returns the IDs of the removed groups.
    pub fn evict_expired(&self, now: Timestamp, max_age: Duration) -> Vec<GroupId> {
        let mut evicted = Vec::new();

        self.groups.retain(|id, group| {
            if group.is_expired(now, max_age) {
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });

        self.reserved.fetch_sub(evicted.len(), Ordering::AcqRel);
        for id in &evicted {
            info!(group = %id, "Evicted expired group");
        }

        evicted
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of active groups.
    pub group_count: usize,
    /// Number of members across all groups.
    pub member_count: usize,
    /// Number of online members across all groups.
    pub online_count: usize,
}
