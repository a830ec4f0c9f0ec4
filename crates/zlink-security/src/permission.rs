//! Hierarchical permission levels and method requirements.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered permission hierarchy: `Public < Authenticated < Admin < System`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Public,
    Authenticated,
    Admin,
    System,
}

impl PermissionLevel {
    pub fn rank(self) -> u8 {
        match self {
            PermissionLevel::Public => 0,
            PermissionLevel::Authenticated => 1,
            PermissionLevel::Admin => 2,
            PermissionLevel::System => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::Public => "public",
            PermissionLevel::Authenticated => "authenticated",
            PermissionLevel::Admin => "admin",
            PermissionLevel::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Some(PermissionLevel::Public),
            "authenticated" => Some(PermissionLevel::Authenticated),
            "admin" => Some(PermissionLevel::Admin),
            "system" => Some(PermissionLevel::System),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True iff `user` ranks at or above `required`.
pub fn has_permission(user: PermissionLevel, required: PermissionLevel) -> bool {
    user.rank() >= required.rank()
}

/// Method name → required level.
///
/// Lookup tries an exact entry, then the longest matching `prefix:*`
/// wildcard, and falls back to the default level.
#[derive(Debug, Clone)]
pub struct PermissionMap {
    exact: HashMap<String, PermissionLevel>,
    // (prefix without '*', level), kept sorted longest first
    wildcards: Vec<(String, PermissionLevel)>,
    default_level: PermissionLevel,
}

impl PermissionMap {
    /// Empty map; every method requires `Authenticated`.
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            wildcards: Vec::new(),
            default_level: PermissionLevel::Authenticated,
        }
    }

    /// Add or replace a rule. Patterns ending in `*` are prefix wildcards.
    pub fn set(&mut self, pattern: &str, level: PermissionLevel) {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.wildcards.retain(|(p, _)| p != prefix);
            self.wildcards.push((prefix.to_string(), level));
            self.wildcards.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        } else {
            self.exact.insert(pattern.to_string(), level);
        }
    }

    pub fn with(mut self, pattern: &str, level: PermissionLevel) -> Self {
        self.set(pattern, level);
        self
    }

    pub fn required_level(&self, method: &str) -> PermissionLevel {
        if let Some(level) = self.exact.get(method) {
            return *level;
        }
        self.wildcards
            .iter()
            .find(|(prefix, _)| method.starts_with(prefix.as_str()))
            .map(|(_, level)| *level)
            .unwrap_or(self.default_level)
    }

    pub fn allows(&self, method: &str, user: PermissionLevel) -> bool {
        has_permission(user, self.required_level(method))
    }
}

impl Default for PermissionMap {
    fn default() -> Self {
        Self::empty()
            .with("system:ping", PermissionLevel::Public)
            .with("system:status", PermissionLevel::Public)
            .with("system:echo", PermissionLevel::Authenticated)
            .with("system:*", PermissionLevel::System)
            .with("device:*", PermissionLevel::Admin)
            .with("transfer:*", PermissionLevel::Authenticated)
            .with("file:delete", PermissionLevel::Admin)
    }
}
