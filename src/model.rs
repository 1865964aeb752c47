//! Shared data types that cross the trait boundaries between the change-propagation
//! engine and its external collaborators (config/release/subscription stores).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::CoreError;

/// Environment axis a config lives in. Centralizing the default here means no call
/// site re-derives what "no environment given" means.
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Normalizes an optional/blank environment string to [`DEFAULT_ENVIRONMENT`].
pub fn normalize_environment(env: &str) -> &str {
    if env.is_empty() {
        DEFAULT_ENVIRONMENT
    } else {
        env
    }
}

/// Only `[A-Za-z0-9_.-]` is allowed in a config key: the reverse subscriber index
/// keys on `"{namespace_id}:{key}"` with no escaping, so a colon in a key would
/// corrupt the index.
pub fn validate_config_key(key: &str) -> Result<(), CoreError> {
    if key.is_empty() {
        return Err(CoreError::Validation("config key must not be empty".into()));
    }
    let valid = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(CoreError::Validation(format!(
            "config key {key:?} contains characters outside [A-Za-z0-9_.-]"
        )));
    }
    Ok(())
}

/// Builds the reverse-index key used by [`crate::subscription::SubscriptionManager`].
pub fn config_subscriber_key(namespace_id: i64, key: &str) -> String {
    format!("{namespace_id}:{key}")
}

/// Builds the forward-index key used by [`crate::subscription::SubscriptionManager`].
pub fn active_subscriber_key(namespace_id: i64, environment: &str, client_id: &str) -> String {
    format!("{namespace_id}:{environment}:{client_id}")
}

/// The hash algorithm recorded alongside a stored fingerprint. `Sha256` is reserved
/// for a future store implementation; nothing in this crate computes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "md5")]
    Md5,
    #[serde(rename = "sha256")]
    Sha256,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Md5
    }
}

/// One `(namespace, environment, key)` row as read from the config store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub config_id: i64,
    pub namespace_id: i64,
    pub environment: String,
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub group_name: Option<String>,
    pub version: i64,
    pub is_released: bool,
    pub is_active: bool,
    pub content_hash: String,
    pub content_hash_algorithm: HashAlgorithm,
}

impl ConfigRow {
    /// Fingerprint as stored; callers needing a freshly-derived fingerprint should
    /// go through [`crate::fingerprint::fingerprint_of`] instead of trusting this
    /// field blindly.
    pub fn stored_fingerprint(&self) -> &str {
        &self.content_hash
    }
}

/// One item in a frozen release snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshotItem {
    pub config_id: i64,
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub group_name: Option<String>,
    pub content_hash: String,
    pub description: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStatus {
    #[serde(rename = "testing")]
    Testing,
    #[serde(rename = "published")]
    Published,
    #[serde(rename = "rollback")]
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseType {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "incremental")]
    Incremental,
    #[serde(rename = "canary")]
    Canary,
}

/// A canary rule as attached to a [`Release`]. All three selectors are optional in
/// isolation but [`crate::canary::validate_canary_rule`] requires at least one to be
/// meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryRule {
    #[serde(default)]
    pub client_ids: Vec<String>,
    #[serde(default)]
    pub ip_ranges: Vec<String>,
    #[serde(default)]
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub release_id: i64,
    pub namespace_id: i64,
    pub environment: String,
    pub version: i64,
    pub status: ReleaseStatus,
    pub release_type: ReleaseType,
    pub config_snapshot: Vec<ConfigSnapshotItem>,
    pub canary_rule: Option<CanaryRule>,
    pub released_by: Option<String>,
    pub released_at: Option<DateTime<Utc>>,
    pub rolled_back_by: Option<String>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub rollback_reason: Option<String>,
    pub rollback_from_version: Option<i64>,
}

impl Release {
    pub fn find_item(&self, key: &str) -> Option<&ConfigSnapshotItem> {
        self.config_snapshot.iter().find(|item| item.key == key)
    }
}

/// The persistent record of a client's relationship to a `(namespace, environment)`.
/// Distinct from [`ActiveSubscriber`], which only exists while a request is parked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub namespace_id: i64,
    pub environment: String,
    pub client_id: String,
    pub client_ip: Option<String>,
    pub client_hostname: Option<String>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub heartbeat_count: u64,
    pub poll_count: u64,
    pub change_count: u64,
    pub is_active: bool,
    pub subscribed_at: DateTime<Utc>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

/// One key a client asked to be notified about, carrying the fingerprint it
/// currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKey {
    pub namespace_id: i64,
    pub config_key: String,
    pub version: String,
    #[serde(default)]
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub client_id: String,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub client_hostname: Option<String>,
    pub config_keys: Vec<RequestedKey>,
}

impl WatchRequest {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.client_id.is_empty() {
            return Err(CoreError::Validation("client_id must not be empty".into()));
        }
        if self.config_keys.is_empty() {
            return Err(CoreError::Validation("config_keys must not be empty".into()));
        }
        for k in &self.config_keys {
            validate_config_key(&k.config_key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedConfig {
    pub namespace_id: i64,
    pub config_key: String,
    pub version: String,
    pub value: String,
    pub value_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResponse {
    pub changed: bool,
    pub config_keys: Vec<String>,
    pub configs: Vec<ChangedConfig>,
}

/// The action that produced a [`ChangeEvent`]; `Delete` is reported to subscribers
/// with `changed=true`, an empty value, and the fingerprint of the empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "release")]
    Release,
    #[serde(rename = "canary_release")]
    CanaryRelease,
    #[serde(rename = "rollback")]
    Rollback,
}

/// Wire payload carried on the change bus. Ids are `i64` so a broker that
/// normalizes JSON numbers through a float still round-trips correctly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub namespace_id: i64,
    pub config_key: String,
    pub config_id: i64,
    pub action: ChangeAction,
}

/// Delivered to exactly one waiter per wake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub config_key: String,
    pub new_version: String,
}

/// Process-local state for one parked long-poll. Lives from waiter entry to exit.
pub struct ActiveSubscriber {
    pub client_id: String,
    pub namespace_id: i64,
    pub environment: String,
    pub config_keys: HashSet<String>,
    pub registered_at: DateTime<Utc>,
    pub notify_tx: tokio::sync::mpsc::Sender<ChangeNotification>,
}

impl ActiveSubscriber {
    pub fn forward_key(&self) -> String {
        active_subscriber_key(self.namespace_id, &self.environment, &self.client_id)
    }
}
