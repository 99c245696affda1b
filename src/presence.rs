//! Transient per-room presence: ephemeral JSON blobs keyed by user.
//!
//! Presence is never persisted. Updates shallow-merge into the existing
//! entry; an entry disappears with its user and can be pruned once stale.

use std::collections::HashMap;

use serde_json::{Map as JsonMap, Value};

use crate::crdt::now_seconds;
use crate::protocol::User;

/// One user's presence inside a room.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub user: User,
    pub data: JsonMap<String, Value>,
    pub last_updated: f64,
}

/// Presence for all users in a single room.
#[derive(Debug, Default)]
pub struct RoomPresence {
    users: HashMap<String, PresenceEntry>,
}

impl RoomPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, user: User) {
        self.users.insert(
            user.id.clone(),
            PresenceEntry {
                user,
                data: JsonMap::new(),
                last_updated: now_seconds(),
            },
        );
    }

    pub fn remove_user(&mut self, user_id: &str) -> Option<User> {
        self.users.remove(user_id).map(|entry| entry.user)
    }

    /// Shallow-merge `data` into the user's presence. Returns `false` when
    /// the user is unknown.
    pub fn update(&mut self, user_id: &str, data: &JsonMap<String, Value>) -> bool {
        match self.users.get_mut(user_id) {
            Some(entry) => {
                for (key, value) in data {
                    entry.data.insert(key.clone(), value.clone());
                }
                entry.last_updated = now_seconds();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.users.get(user_id)
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn users(&self) -> Vec<User> {
        self.users.values().map(|entry| entry.user.clone()).collect()
    }

    /// All presence data keyed by user id.
    pub fn all_data(&self) -> HashMap<String, JsonMap<String, Value>> {
        self.users
            .iter()
            .map(|(id, entry)| (id.clone(), entry.data.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Drop entries not updated within `max_age` seconds; returns the
    /// removed user ids.
    pub fn prune_stale(&mut self, max_age: f64) -> Vec<String> {
        let cutoff = now_seconds() - max_age;
        let stale: Vec<String> = self
            .users
            .iter()
            .filter(|(_, entry)| entry.last_updated < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.users.remove(id);
        }
        stale
    }
}
