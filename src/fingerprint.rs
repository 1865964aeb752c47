//! Fingerprint Oracle (C2): turns a config value into the opaque version string
//! clients compare against, and the `ConfigStore` boundary it reads through.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CoreError, StoreError};
use crate::model::{normalize_environment, ConfigRow};

const ORACLE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowercase-hex MD5 of `value`, fixed length 32. Not a security primitive: this
/// fingerprint only needs to detect change, not resist adversarial collision.
pub fn fingerprint_of(value: &str) -> String {
    format!("{:x}", md5::compute(value.as_bytes()))
}

/// The fingerprint of a deleted key, used so `ChangeEvent{action: Delete}` can be
/// reported as `changed=true` with an empty value rather than omitted entirely.
pub fn deleted_fingerprint() -> String {
    fingerprint_of("")
}

/// Read-only view onto persisted config rows. Production persistence is out of
/// scope for this crate; only the shape of the boundary lives here.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_active(
        &self,
        namespace_id: i64,
        key: &str,
        environment: &str,
    ) -> Result<Option<ConfigRow>, StoreError>;

    async fn update_value(&self, config_id: i64, value: &str) -> Result<ConfigRow, StoreError>;
}

/// Computes the current server-side fingerprint of a `(namespace, key, environment)`
/// triple, bounding every read to [`ORACLE_READ_TIMEOUT`] independently of whatever
/// deadline the caller itself is operating under.
pub struct FingerprintOracle<S: ConfigStore> {
    store: S,
}

impl<S: ConfigStore> FingerprintOracle<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns `Err(CoreError::NotFound)` when no active row matches; callers on
    /// the fast path treat that as "skip this key", not as a hard failure.
    pub async fn fingerprint(
        &self,
        namespace_id: i64,
        key: &str,
        environment: &str,
    ) -> Result<String, CoreError> {
        let env = normalize_environment(environment);
        let row = tokio::time::timeout(
            ORACLE_READ_TIMEOUT,
            self.store.get_active(namespace_id, key, env),
        )
        .await
        .map_err(|_| CoreError::Internal("fingerprint oracle read timed out".into()))??;

        match row {
            Some(row) => Ok(fingerprint_of(&row.value)),
            None => Err(CoreError::NotFound(format!(
                "no active config for namespace={namespace_id} key={key} env={env}"
            ))),
        }
    }

    /// Returns the active row itself, used by callers that need the value as well
    /// as its fingerprint (e.g. filling a `WatchResponse`).
    pub async fn active_row(
        &self,
        namespace_id: i64,
        key: &str,
        environment: &str,
    ) -> Result<Option<ConfigRow>, CoreError> {
        let env = normalize_environment(environment);
        let row = tokio::time::timeout(
            ORACLE_READ_TIMEOUT,
            self.store.get_active(namespace_id, key, env),
        )
        .await
        .map_err(|_| CoreError::Internal("fingerprint oracle read timed out".into()))??;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matches_known_md5() {
        assert_eq!(fingerprint_of(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(fingerprint_of("h1"), format!("{:x}", md5::compute(b"h1")));
    }

    #[test]
    fn deleted_fingerprint_is_empty_string_hash() {
        assert_eq!(deleted_fingerprint(), fingerprint_of(""));
    }
}
