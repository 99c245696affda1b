//! Pluggable authorization: `(principal, resource, action)` checks, plus
//! optional field-level path rules where deny rules are consulted before
//! allow rules.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Actions a principal may be granted on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Delete,
    Admin,
    Share,
}

/// Authorization check consulted by the broker session.
pub trait PermissionManager: Send + Sync {
    fn check(&self, user_id: &str, resource: &str, action: Action) -> bool;
}

/// Permits everything; the default when no manager is configured.
#[derive(Debug, Default)]
pub struct AllowAll;

impl PermissionManager for AllowAll {
    fn check(&self, _user_id: &str, _resource: &str, _action: Action) -> bool {
        true
    }
}

/// Explicit grant table: user → resource → actions. `"*"` matches any
/// user or resource.
#[derive(Debug, Default)]
pub struct GrantTable {
    grants: HashMap<String, HashMap<String, HashSet<Action>>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(
        mut self,
        user_id: impl Into<String>,
        resource: impl Into<String>,
        action: Action,
    ) -> Self {
        self.grant(user_id, resource, action);
        self
    }

    pub fn grant(
        &mut self,
        user_id: impl Into<String>,
        resource: impl Into<String>,
        action: Action,
    ) {
        self.grants
            .entry(user_id.into())
            .or_default()
            .entry(resource.into())
            .or_default()
            .insert(action);
    }

    fn user_allows(&self, user_id: &str, resource: &str, action: Action) -> bool {
        let Some(resources) = self.grants.get(user_id) else {
            return false;
        };
        resources
            .get(resource)
            .map(|actions| actions.contains(&action))
            .unwrap_or(false)
            || resources
                .get("*")
                .map(|actions| actions.contains(&action))
                .unwrap_or(false)
    }
}

impl PermissionManager for GrantTable {
    fn check(&self, user_id: &str, resource: &str, action: Action) -> bool {
        self.user_allows(user_id, resource, action) || self.user_allows("*", resource, action)
    }
}

/// One field-level rule: applies to a resource (or `"*"`), a path prefix,
/// a set of actions, and optionally a set of users (none = everyone).
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub resource: String,
    pub path_prefix: Vec<String>,
    pub actions: HashSet<Action>,
    pub users: Option<HashSet<String>>,
}

impl FieldRule {
    pub fn new(resource: impl Into<String>, path_prefix: Vec<String>, action: Action) -> Self {
        let mut actions = HashSet::new();
        actions.insert(action);
        Self {
            resource: resource.into(),
            path_prefix,
            actions,
            users: None,
        }
    }

    pub fn for_users(mut self, users: impl IntoIterator<Item = String>) -> Self {
        self.users = Some(users.into_iter().collect());
        self
    }

    fn matches(&self, user_id: &str, resource: &str, path: &[String], action: Action) -> bool {
        if self.resource != "*" && self.resource != resource {
            return false;
        }
        if !self.actions.contains(&action) {
            return false;
        }
        if !path.starts_with(&self.path_prefix) {
            return false;
        }
        match &self.users {
            Some(users) => users.contains(user_id),
            None => true,
        }
    }
}

/// Optional path-level policy layered over the coarse permission check.
/// Deny rules always win over allow rules.
#[derive(Debug, Default)]
pub struct FieldPolicy {
    deny: Vec<FieldRule>,
    allow: Vec<FieldRule>,
    default_allow: bool,
}

impl FieldPolicy {
    pub fn new(default_allow: bool) -> Self {
        Self {
            deny: Vec::new(),
            allow: Vec::new(),
            default_allow,
        }
    }

    pub fn deny(mut self, rule: FieldRule) -> Self {
        self.deny.push(rule);
        self
    }

    pub fn allow(mut self, rule: FieldRule) -> Self {
        self.allow.push(rule);
        self
    }

    pub fn check_path(
        &self,
        user_id: &str,
        resource: &str,
        path: &[String],
        action: Action,
    ) -> bool {
        if self
            .deny
            .iter()
            .any(|rule| rule.matches(user_id, resource, path, action))
        {
            return false;
        }
        if self
            .allow
            .iter()
            .any(|rule| rule.matches(user_id, resource, path, action))
        {
            return true;
        }
        self.default_allow
    }
}
