//! # Freshness Policy Table
//!
//! A static, process-wide mapping from key prefix to a freshness policy: how
//! long a cached value stays valid, which priority class it belongs to, and how
//! many entries of that class the cache may hold. Every cache key resolves to
//! exactly one policy through longest-prefix match, falling back to a default.
//!
//! The table is built once at startup (from [`crate::configs`] or the built-in
//! defaults) and shared read-only behind an `Arc`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::configs::duration_ms;

/// # Priority Class
///
/// Shared by cache entries, pending requests and subscriptions. Under memory
/// pressure, everything below `Critical` is shed first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Nice-to-have data: first to be evicted or rejected.
    Low = 0,
    /// Regular screen data.
    #[default]
    Normal = 1,
    /// Data the session cannot work without (own profile, active duel).
    Critical = 2,
}

impl Priority {
    /// Returns `true` for [`Priority::Critical`].
    pub fn is_critical(self) -> bool {
        self == Priority::Critical
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Freshness policy for every key starting with `prefix_match`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Key prefix this policy applies to. The empty string matches every key.
    pub prefix_match: String,
    /// Time-to-live of a cached value.
    #[serde(rename = "ttlMs", with = "duration_ms")]
    pub ttl: Duration,
    /// Priority class of entries and requests under this prefix.
    pub priority: Priority,
    /// Maximum number of cached entries under this prefix.
    pub max_entries: usize,
}

impl PolicyConfig {
    /// Builds a policy.
    pub fn new(prefix: impl Into<String>, ttl: Duration, priority: Priority, max_entries: usize) -> Self {
        Self {
            prefix_match: prefix.into(),
            ttl,
            priority,
            max_entries,
        }
    }

    /// Returns `true` if `key` falls under this policy's prefix.
    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(&self.prefix_match)
    }
}

/// Catch-all policy: five minutes, `Normal`, 100 entries.
pub fn default_policy() -> PolicyConfig {
    PolicyConfig::new("", Duration::from_secs(300), Priority::Normal, 100)
}

/// The policy table shipped with the client.
pub fn builtin_policies() -> Vec<PolicyConfig> {
    vec![
        PolicyConfig::new("user-profile", Duration::from_secs(30), Priority::Critical, 50),
        PolicyConfig::new("user-stats", Duration::from_secs(60), Priority::Normal, 50),
        PolicyConfig::new("duel", Duration::from_secs(10), Priority::Critical, 20),
        PolicyConfig::new("leaderboard", Duration::from_secs(30), Priority::Normal, 20),
        PolicyConfig::new("quiz", Duration::from_secs(300), Priority::Normal, 100),
        PolicyConfig::new("questions", Duration::from_secs(600), Priority::Low, 200),
        PolicyConfig::new("achievements", Duration::from_secs(300), Priority::Low, 50),
        PolicyConfig::new("chat-messages", Duration::from_secs(15), Priority::Low, 100),
    ]
}

/// # Policy Table
///
/// Immutable lookup structure. Policies are kept sorted by descending prefix
/// length so the first match is the longest one.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: Vec<PolicyConfig>,
    fallback: PolicyConfig,
}

impl PolicyTable {
    /// Builds a table from explicit policies and a fallback.
    pub fn new(mut policies: Vec<PolicyConfig>, fallback: PolicyConfig) -> Self {
        // Stable sort keeps declaration order among prefixes of equal length.
        policies.sort_by(|a, b| b.prefix_match.len().cmp(&a.prefix_match.len()));
        Self { policies, fallback }
    }

    /// Resolves the policy governing `key`.
    pub fn resolve(&self, key: &str) -> &PolicyConfig {
        self.policies
            .iter()
            .find(|policy| policy.matches(key))
            .unwrap_or(&self.fallback)
    }

    /// Explicit policies, longest prefix first.
    pub fn policies(&self) -> &[PolicyConfig] {
        &self.policies
    }

    /// The policy used when no prefix matches.
    pub fn fallback(&self) -> &PolicyConfig {
        &self.fallback
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(builtin_policies(), default_policy())
    }
}
