//! In-memory fakes for the three store traits, used only by this crate's own
//! test suite. None of this is meant to resemble production persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use configwatch_core::canary::ReleaseStore;
use configwatch_core::error::StoreError;
use configwatch_core::fingerprint::{fingerprint_of, ConfigStore};
use configwatch_core::model::{ConfigRow, HashAlgorithm, Release, SubscriptionRecord};
use configwatch_core::subscription::SubscriptionStore;

type ConfigKey = (i64, String, String);

#[derive(Default)]
pub struct FakeConfigStore {
    rows: Mutex<HashMap<ConfigKey, ConfigRow>>,
    next_id: AtomicI64,
}

impl FakeConfigStore {
    pub fn new() -> Self {
        Self { rows: Mutex::new(HashMap::new()), next_id: AtomicI64::new(1) }
    }

    /// Test helper: seed one active config row, computing its content hash.
    pub fn seed(&self, namespace_id: i64, environment: &str, key: &str, value: &str) -> i64 {
        let config_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = ConfigRow {
            config_id,
            namespace_id,
            environment: environment.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            value_type: "string".to_string(),
            group_name: None,
            version: 1,
            is_released: true,
            is_active: true,
            content_hash: fingerprint_of(value),
            content_hash_algorithm: HashAlgorithm::Md5,
        };
        self.rows
            .lock()
            .unwrap()
            .insert((namespace_id, environment.to_string(), key.to_string()), row);
        config_id
    }

    pub fn delete(&self, namespace_id: i64, environment: &str, key: &str) {
        self.rows
            .lock()
            .unwrap()
            .remove(&(namespace_id, environment.to_string(), key.to_string()));
    }
}

#[async_trait]
impl ConfigStore for FakeConfigStore {
    async fn get_active(
        &self,
        namespace_id: i64,
        key: &str,
        environment: &str,
    ) -> Result<Option<ConfigRow>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&(namespace_id, environment.to_string(), key.to_string()))
            .cloned())
    }

    async fn update_value(&self, config_id: i64, value: &str) -> Result<ConfigRow, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .values_mut()
            .find(|r| r.config_id == config_id)
            .ok_or_else(|| StoreError::NotFound(format!("config {config_id}")))?;
        row.value = value.to_string();
        row.version += 1;
        row.content_hash = fingerprint_of(value);
        Ok(row.clone())
    }
}

#[derive(Default)]
pub struct FakeReleaseStore {
    releases: Mutex<HashMap<i64, Release>>,
    next_id: AtomicI64,
    latest_published: Mutex<HashMap<(i64, String), i64>>,
}

impl FakeReleaseStore {
    pub fn new() -> Self {
        Self {
            releases: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            latest_published: Mutex::new(HashMap::new()),
        }
    }

    /// Test helper: insert a release directly, assigning it an id.
    pub fn insert(&self, release: Release) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut release = release;
        release.release_id = id;
        self.releases.lock().unwrap().insert(id, release);
        id
    }

    /// Test helper: force which release is "latest published" for a scope,
    /// independent of `save`'s bookkeeping. Production stores decide this
    /// invariant their own way; this crate only consumes the result.
    pub fn set_latest_published(&self, namespace_id: i64, environment: &str, release_id: i64) {
        self.latest_published
            .lock()
            .unwrap()
            .insert((namespace_id, environment.to_string()), release_id);
    }
}

#[async_trait]
impl ReleaseStore for FakeReleaseStore {
    async fn latest_published(
        &self,
        namespace_id: i64,
        environment: &str,
    ) -> Result<Option<Release>, StoreError> {
        let pointer = self
            .latest_published
            .lock()
            .unwrap()
            .get(&(namespace_id, environment.to_string()))
            .copied();
        Ok(pointer.and_then(|id| self.releases.lock().unwrap().get(&id).cloned()))
    }

    async fn get(&self, release_id: i64) -> Result<Release, StoreError> {
        self.releases
            .lock()
            .unwrap()
            .get(&release_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("release {release_id}")))
    }

    async fn save(&self, release: Release) -> Result<(), StoreError> {
        let scope = (release.namespace_id, release.environment.clone());
        if release.status == configwatch_core::model::ReleaseStatus::Published {
            self.latest_published.lock().unwrap().insert(scope, release.release_id);
        }
        self.releases.lock().unwrap().insert(release.release_id, release);
        Ok(())
    }

    async fn next_version(&self, namespace_id: i64, environment: &str) -> Result<i64, StoreError> {
        let max = self
            .releases
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.namespace_id == namespace_id && r.environment == environment)
            .map(|r| r.version)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }
}

type SubscriptionKey = (i64, String, String);

#[derive(Default)]
pub struct FakeSubscriptionStore {
    records: Mutex<HashMap<SubscriptionKey, SubscriptionRecord>>,
}

impl FakeSubscriptionStore {
    pub fn new() -> Self {
        Self { records: Mutex::new(HashMap::new()) }
    }

    pub fn get_record(&self, namespace_id: i64, environment: &str, client_id: &str) -> Option<SubscriptionRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(namespace_id, environment.to_string(), client_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl SubscriptionStore for FakeSubscriptionStore {
    async fn upsert_heartbeat(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
        client_ip: Option<&str>,
        client_hostname: Option<&str>,
    ) -> Result<SubscriptionRecord, StoreError> {
        let key = (namespace_id, environment.to_string(), client_id.to_string());
        let mut records = self.records.lock().unwrap();
        let now = Utc::now();
        let record = records.entry(key).or_insert_with(|| SubscriptionRecord {
            namespace_id,
            environment: environment.to_string(),
            client_id: client_id.to_string(),
            client_ip: client_ip.map(str::to_string),
            client_hostname: client_hostname.map(str::to_string),
            last_heartbeat_at: now,
            heartbeat_count: 0,
            poll_count: 0,
            change_count: 0,
            is_active: true,
            subscribed_at: now,
            unsubscribed_at: None,
        });
        record.last_heartbeat_at = now;
        record.heartbeat_count += 1;
        record.is_active = true;
        record.client_ip = client_ip.map(str::to_string).or_else(|| record.client_ip.clone());
        record.client_hostname = client_hostname.map(str::to_string).or_else(|| record.client_hostname.clone());
        Ok(record.clone())
    }

    async fn get(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&(namespace_id, environment.to_string(), client_id.to_string()))
            .cloned())
    }

    async fn bump_poll_count(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(record) = self
            .records
            .lock()
            .unwrap()
            .get_mut(&(namespace_id, environment.to_string(), client_id.to_string()))
        {
            record.poll_count += 1;
        }
        Ok(())
    }

    async fn bump_change_count(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(record) = self
            .records
            .lock()
            .unwrap()
            .get_mut(&(namespace_id, environment.to_string(), client_id.to_string()))
        {
            record.change_count += 1;
        }
        Ok(())
    }

    async fn bump_heartbeat(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(record) = self
            .records
            .lock()
            .unwrap()
            .get_mut(&(namespace_id, environment.to_string(), client_id.to_string()))
        {
            record.heartbeat_count += 1;
            record.last_heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_inactive_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut count = 0;
        for record in self.records.lock().unwrap().values_mut() {
            if record.is_active && record.last_heartbeat_at < cutoff {
                record.is_active = false;
                record.unsubscribed_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }
}
