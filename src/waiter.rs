//! Long-Poll Waiter (C4): the per-request state machine
//! `INIT -> SUBSCRIBED -> (NOTIFIED | TIMEOUT | CANCELLED)`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::canary::ReleaseRouter;
use crate::config::SystemConfigCache;
use crate::error::CoreError;
use crate::model::{normalize_environment, ChangedConfig, ConfigSnapshotItem, WatchRequest, WatchResponse};
use crate::subscription::{SubscribeOutcome, SubscribeRequest, SubscriptionManager, SubscriptionStore};
use crate::{canary::ReleaseStore, ConfigStore};

/// One watch request's lifecycle. All three stores are generic parameters so the
/// waiter never depends on any concrete persistence.
pub struct LongPollWaiter<C, R, St>
where
    C: ConfigStore + 'static,
    R: ReleaseStore + 'static,
    St: SubscriptionStore + 'static,
{
    subscriptions: Arc<SubscriptionManager<C, St>>,
    router: Arc<ReleaseRouter<R>>,
    config: Arc<SystemConfigCache>,
}

impl<C, R, St> LongPollWaiter<C, R, St>
where
    C: ConfigStore + 'static,
    R: ReleaseStore + 'static,
    St: SubscriptionStore + 'static,
{
    pub fn new(
        subscriptions: Arc<SubscriptionManager<C, St>>,
        router: Arc<ReleaseRouter<R>>,
        config: Arc<SystemConfigCache>,
    ) -> Self {
        Self { subscriptions, router, config }
    }

    /// A watch request must name at least one key, and every key must share one
    /// `(namespace, environment)` pair: that pair is the subscriber identity, so
    /// a request spanning multiple namespaces has no single forward-index slot
    /// to live in.
    fn homogeneous_scope(request: &WatchRequest) -> Result<(i64, String), CoreError> {
        let first = &request.config_keys[0];
        let namespace_id = first.namespace_id;
        let environment = normalize_environment(&first.environment).to_string();
        for key in &request.config_keys[1..] {
            if key.namespace_id != namespace_id || normalize_environment(&key.environment) != environment {
                return Err(CoreError::Validation(
                    "all config_keys in one watch request must share one namespace and environment".into(),
                ));
            }
        }
        Ok((namespace_id, environment))
    }

    async fn build_changed_config(
        &self,
        namespace_id: i64,
        key: &str,
        environment: &str,
        new_version: &str,
        overrides: &HashMap<String, ConfigSnapshotItem>,
    ) -> ChangedConfig {
        if let Some(item) = overrides.get(key) {
            return ChangedConfig {
                namespace_id,
                config_key: key.to_string(),
                version: new_version.to_string(),
                value: item.value.clone(),
                value_type: item.value_type.clone(),
            };
        }
        match self.subscriptions.oracle().active_row(namespace_id, key, environment).await {
            Ok(Some(row)) => ChangedConfig {
                namespace_id,
                config_key: key.to_string(),
                version: new_version.to_string(),
                value: row.value,
                value_type: row.value_type,
            },
            // Deleted or unreadable: report the change with an empty value
            // rather than silently dropping the notification.
            _ => ChangedConfig {
                namespace_id,
                config_key: key.to_string(),
                version: new_version.to_string(),
                value: String::new(),
                value_type: String::new(),
            },
        }
    }

    /// Runs one long-poll to completion. `cancel` represents the client
    /// disconnecting; it is never coerced into a `changed=false` response.
    pub async fn wait(
        &self,
        request: &WatchRequest,
        cancel: CancellationToken,
    ) -> Result<WatchResponse, CoreError> {
        request.validate()?;
        let (namespace_id, environment) = Self::homogeneous_scope(request)?;

        let resolved = self
            .router
            .resolve_for_client(
                namespace_id,
                &environment,
                &request.client_id,
                request.client_ip.as_deref(),
            )
            .await?;

        let overrides: HashMap<String, ConfigSnapshotItem> = match &resolved.release {
            Some(release) if resolved.canary_matched => release
                .config_snapshot
                .iter()
                .map(|item| (item.key.clone(), item.clone()))
                .collect(),
            _ => HashMap::new(),
        };

        let keys: Vec<(String, String)> = request
            .config_keys
            .iter()
            .map(|k| (k.config_key.clone(), k.version.clone()))
            .collect();

        let subscribe_request = SubscribeRequest {
            client_id: &request.client_id,
            client_ip: request.client_ip.as_deref(),
            client_hostname: request.client_hostname.as_deref(),
            namespace_id,
            environment: environment.clone(),
            keys,
            overrides: overrides.clone(),
        };

        match self.subscriptions.subscribe(subscribe_request).await? {
            SubscribeOutcome::Immediate(notification) => {
                let changed = self
                    .build_changed_config(
                        namespace_id,
                        &notification.config_key,
                        &environment,
                        &notification.new_version,
                        &overrides,
                    )
                    .await;
                Ok(WatchResponse {
                    changed: true,
                    config_keys: vec![config_subscriber_key_of(namespace_id, &notification.config_key)],
                    configs: vec![changed],
                })
            }
            SubscribeOutcome::Parked { mut rx, guard } => {
                let timeout = self.config.poll_timeout().await;

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        guard.release().await;
                        Err(CoreError::Cancelled)
                    }
                    notification = rx.recv() => {
                        guard.release().await;
                        match notification {
                            Some(notification) => {
                                let changed = self
                                    .build_changed_config(
                                        namespace_id,
                                        &notification.config_key,
                                        &environment,
                                        &notification.new_version,
                                        &overrides,
                                    )
                                    .await;
                                Ok(WatchResponse {
                                    changed: true,
                                    config_keys: vec![config_subscriber_key_of(namespace_id, &notification.config_key)],
                                    configs: vec![changed],
                                })
                            }
                            // Channel closed without a notification: this client's
                            // own later poll superseded this one's registration.
                            None => Ok(WatchResponse::default()),
                        }
                    }
                    _ = tokio::time::sleep(timeout) => {
                        guard.release().await;
                        Ok(WatchResponse::default())
                    }
                }
            }
        }
    }
}

fn config_subscriber_key_of(namespace_id: i64, key: &str) -> String {
    crate::model::config_subscriber_key(namespace_id, key)
}
