//! Subscription Manager (C3): owns the in-memory subscriber index, the bus
//! ingestion loop, and the heartbeat sweep, all behind one `RwLock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::ChangeBus;
use crate::error::{CoreError, StoreError};
use crate::fingerprint::{deleted_fingerprint, FingerprintOracle};
use crate::model::{
    active_subscriber_key, config_subscriber_key, normalize_environment, ActiveSubscriber,
    ChangeAction, ChangeEvent, ChangeNotification, ConfigSnapshotItem, SubscriptionRecord,
};
use crate::ConfigStore;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const NOTIFY_CHANNEL_CAPACITY: usize = 1;

/// Persistence boundary for subscription records. Production persistence is
/// out of scope for this crate.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn upsert_heartbeat(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
        client_ip: Option<&str>,
        client_hostname: Option<&str>,
    ) -> Result<SubscriptionRecord, StoreError>;

    async fn get(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<Option<SubscriptionRecord>, StoreError>;

    async fn bump_poll_count(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<(), StoreError>;

    async fn bump_change_count(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<(), StoreError>;

    async fn bump_heartbeat(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<(), StoreError>;

    /// Marks every still-active subscription whose last heartbeat is before
    /// `cutoff` inactive; returns the number of rows touched.
    async fn mark_inactive_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// A single long-poll's request to be subscribed, already resolved against the
/// release router by the caller: `overrides` carries any canary snapshot items
/// that should replace the live fingerprint for matching keys.
pub struct SubscribeRequest<'a> {
    pub client_id: &'a str,
    pub client_ip: Option<&'a str>,
    pub client_hostname: Option<&'a str>,
    pub namespace_id: i64,
    pub environment: String,
    /// `(config_key, client_fingerprint)` pairs.
    pub keys: Vec<(String, String)>,
    pub overrides: HashMap<String, ConfigSnapshotItem>,
}

/// Result of [`SubscriptionManager::subscribe`]: either an immediate change (the
/// fast path found a mismatch) or a parked waiter with its cleanup guard.
pub enum SubscribeOutcome<C: ConfigStore + 'static, St: SubscriptionStore + 'static> {
    Immediate(ChangeNotification),
    Parked {
        rx: mpsc::Receiver<ChangeNotification>,
        guard: SubscriberGuard<C, St>,
    },
}

struct SubscriberTables {
    active_subscribers: HashMap<String, ActiveSubscriber>,
    config_subscribers: HashMap<String, Vec<String>>,
}

impl SubscriberTables {
    fn new() -> Self {
        Self {
            active_subscribers: HashMap::new(),
            config_subscribers: HashMap::new(),
        }
    }

    fn remove_from_reverse_index(&mut self, reverse_key: &str, forward_key: &str) {
        if let Some(list) = self.config_subscribers.get_mut(reverse_key) {
            list.retain(|fk| fk != forward_key);
            if list.is_empty() {
                self.config_subscribers.remove(reverse_key);
            }
        }
    }
}

/// Owns `active_subscribers`/`config_subscribers` under one lock, the bus
/// ingestion loop, and the heartbeat sweep.
pub struct SubscriptionManager<C: ConfigStore + 'static, St: SubscriptionStore + 'static> {
    tables: RwLock<SubscriberTables>,
    store: St,
    oracle: Arc<FingerprintOracle<C>>,
}

impl<C: ConfigStore + 'static, St: SubscriptionStore + 'static> SubscriptionManager<C, St> {
    pub fn new(store: St, oracle: Arc<FingerprintOracle<C>>) -> Self {
        Self {
            tables: RwLock::new(SubscriberTables::new()),
            store,
            oracle,
        }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn oracle(&self) -> &FingerprintOracle<C> {
        &self.oracle
    }

    /// Registers (or immediately resolves) one client's watch request.
    pub async fn subscribe(
        self: &Arc<Self>,
        req: SubscribeRequest<'_>,
    ) -> Result<SubscribeOutcome<C, St>, CoreError> {
        let environment = normalize_environment(&req.environment).to_string();

        self.store
            .upsert_heartbeat(
                req.namespace_id,
                &environment,
                req.client_id,
                req.client_ip,
                req.client_hostname,
            )
            .await?;
        self.store
            .bump_poll_count(req.namespace_id, &environment, req.client_id)
            .await?;

        let mut any_found = false;
        for (key, client_fingerprint) in &req.keys {
            let server_fingerprint = if let Some(item) = req.overrides.get(key) {
                any_found = true;
                crate::fingerprint::fingerprint_of(&item.value)
            } else {
                match self
                    .oracle
                    .fingerprint(req.namespace_id, key, &environment)
                    .await
                {
                    Ok(fp) => {
                        any_found = true;
                        fp
                    }
                    Err(CoreError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            };

            if &server_fingerprint != client_fingerprint {
                let _ = self
                    .store
                    .bump_change_count(req.namespace_id, &environment, req.client_id)
                    .await;
                return Ok(SubscribeOutcome::Immediate(ChangeNotification {
                    config_key: key.clone(),
                    new_version: server_fingerprint,
                }));
            }
        }

        if !any_found {
            return Err(CoreError::NotFound(format!(
                "none of the requested config_keys exist in namespace {} environment {environment}",
                req.namespace_id
            )));
        }

        let forward_key = active_subscriber_key(req.namespace_id, &environment, req.client_id);
        let config_keys: Vec<String> = req
            .keys
            .iter()
            .map(|(k, _)| config_subscriber_key(req.namespace_id, k))
            .collect();
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);

        let subscriber = ActiveSubscriber {
            client_id: req.client_id.to_string(),
            namespace_id: req.namespace_id,
            environment: environment.clone(),
            config_keys: config_keys.iter().cloned().collect(),
            registered_at: Utc::now(),
            notify_tx: tx,
        };

        {
            let mut tables = self.tables.write().await;
            if let Some(prev) = tables.active_subscribers.remove(&forward_key) {
                tracing::debug!(%forward_key, "replacing existing active subscriber");
                for rk in &prev.config_keys {
                    let rk = rk.clone();
                    tables.remove_from_reverse_index(&rk, &forward_key);
                }
                drop(prev.notify_tx);
            }
            for rk in &config_keys {
                tables
                    .config_subscribers
                    .entry(rk.clone())
                    .or_default()
                    .push(forward_key.clone());
            }
            tables.active_subscribers.insert(forward_key.clone(), subscriber);
        }

        let guard = SubscriberGuard {
            manager: Arc::clone(self),
            forward_key,
            config_keys,
            done: Arc::new(AtomicBool::new(false)),
        };

        Ok(SubscribeOutcome::Parked { rx, guard })
    }

    /// Idempotent: removing an already-absent subscriber is a no-op.
    pub async fn unsubscribe(&self, forward_key: &str, config_keys: &[String]) {
        let mut tables = self.tables.write().await;
        if tables.active_subscribers.remove(forward_key).is_some() {
            for rk in config_keys {
                tables.remove_from_reverse_index(rk, forward_key);
            }
        }
    }

    pub async fn update_heartbeat(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
    ) -> Result<(), CoreError> {
        let env = normalize_environment(environment);
        let existing = self.store.get(namespace_id, env, client_id).await?;
        if existing.is_none() {
            return Err(CoreError::NotFound(format!(
                "subscription {namespace_id}:{env}:{client_id} not found"
            )));
        }
        self.store.bump_heartbeat(namespace_id, env, client_id).await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn active_subscriber_count(&self) -> usize {
        self.tables.read().await.active_subscribers.len()
    }

    #[cfg(test)]
    pub async fn config_subscriber_count(&self, reverse_key: &str) -> usize {
        self.tables
            .read()
            .await
            .config_subscribers
            .get(reverse_key)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    async fn handle_change_event(&self, event: &ChangeEvent) {
        let reverse_key = config_subscriber_key(event.namespace_id, &event.config_key);
        let interested: Vec<(String, i64, String, String)> = {
            let tables = self.tables.read().await;
            match tables.config_subscribers.get(&reverse_key) {
                Some(forward_keys) => forward_keys
                    .iter()
                    .filter_map(|fk| {
                        tables.active_subscribers.get(fk).map(|sub| {
                            (fk.clone(), sub.namespace_id, sub.environment.clone(), sub.client_id.clone())
                        })
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        if interested.is_empty() {
            return;
        }

        let environment = interested[0].2.clone();
        let new_version = match event.action {
            ChangeAction::Delete => deleted_fingerprint(),
            _ => match self
                .oracle
                .fingerprint(event.namespace_id, &event.config_key, &environment)
                .await
            {
                Ok(fp) => fp,
                Err(err) => {
                    tracing::warn!(error = %err, namespace_id = event.namespace_id, key = %event.config_key, "fingerprint lookup failed during bus ingestion");
                    return;
                }
            },
        };

        let notification = ChangeNotification {
            config_key: event.config_key.clone(),
            new_version,
        };

        {
            let tables = self.tables.read().await;
            for (forward_key, ..) in &interested {
                if let Some(sub) = tables.active_subscribers.get(forward_key) {
                    // Full channel means a wake is already queued; dropping the
                    // second send is correct, not lossy.
                    let _ = sub.notify_tx.try_send(notification.clone());
                }
            }
        }

        for (_, namespace_id, environment, client_id) in &interested {
            if let Err(err) = self
                .store
                .bump_change_count(*namespace_id, environment, client_id)
                .await
            {
                tracing::warn!(error = %err, "failed to bump change_count after notification");
            }
        }
    }

    /// Spawns the task that drains the change bus and fans events out to
    /// interested subscribers. The task exits when `cancel` trips or the bus
    /// stream ends.
    pub fn spawn_bus_ingestion(
        self: Arc<Self>,
        bus: Arc<dyn ChangeBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = match bus.subscribe().await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(error = %err, "failed to subscribe to change bus");
                    return;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(event) => self.handle_change_event(&event).await,
                            None => break,
                        }
                    }
                }
            }
            bus.close().await;
        })
    }

    /// Spawns the periodic sweep that marks stale persistent subscriptions
    /// inactive. Does not touch the in-memory tables.
    pub fn spawn_sweep(
        self: Arc<Self>,
        heartbeat_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEFAULT_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let cutoff = Utc::now()
                            - chrono::Duration::from_std(heartbeat_timeout).unwrap_or(chrono::Duration::seconds(300));
                        match self.store.mark_inactive_before(cutoff).await {
                            Ok(count) if count > 0 => {
                                tracing::info!(count, "swept stale subscriptions");
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(error = %err, "subscription sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

/// RAII handle returned alongside a parked subscriber's notify channel. Always
/// unregisters exactly once: explicitly via [`SubscriberGuard::release`], or as
/// a fallback on `Drop` (covers cancellation/panic) by spawning the async
/// cleanup since `Drop` itself cannot await.
pub struct SubscriberGuard<C: ConfigStore + 'static, St: SubscriptionStore + 'static> {
    manager: Arc<SubscriptionManager<C, St>>,
    forward_key: String,
    config_keys: Vec<String>,
    done: Arc<AtomicBool>,
}

impl<C: ConfigStore + 'static, St: SubscriptionStore + 'static> SubscriberGuard<C, St> {
    pub async fn release(self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.manager.unsubscribe(&self.forward_key, &self.config_keys).await;
        }
    }
}

impl<C: ConfigStore + 'static, St: SubscriptionStore + 'static> Drop for SubscriberGuard<C, St> {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let forward_key = std::mem::take(&mut self.forward_key);
        let config_keys = std::mem::take(&mut self.config_keys);
        tokio::spawn(async move {
            manager.unsubscribe(&forward_key, &config_keys).await;
        });
    }
}
