//! Publish/Rollback Orchestrator: the three release-store mutations that emit
//! change events. The DB write is the point of no return; bus publish is
//! best-effort and logged on failure.

use std::sync::Arc;

use chrono::Utc;

use crate::bus::ChangeBus;
use crate::canary::{validate_canary_rule, ReleaseStore};
use crate::error::CoreError;
use crate::fingerprint::ConfigStore;
use crate::model::{CanaryRule, ChangeAction, ChangeEvent, Release, ReleaseStatus, ReleaseType};

pub struct PublishRollbackOrchestrator<R: ReleaseStore + 'static, C: ConfigStore + 'static> {
    releases: Arc<R>,
    configs: Arc<C>,
    bus: Arc<dyn ChangeBus>,
}

impl<R: ReleaseStore + 'static, C: ConfigStore + 'static> PublishRollbackOrchestrator<R, C> {
    pub fn new(releases: Arc<R>, configs: Arc<C>, bus: Arc<dyn ChangeBus>) -> Self {
        Self { releases, configs, bus }
    }

    pub async fn publish_full(&self, release_id: i64, by: &str) -> Result<Release, CoreError> {
        let mut release = self.releases.get(release_id).await?;
        if release.status != ReleaseStatus::Testing {
            return Err(CoreError::Conflict(format!(
                "release {release_id} is not in Testing status"
            )));
        }
        release.status = ReleaseStatus::Published;
        release.released_by = Some(by.to_string());
        release.released_at = Some(Utc::now());

        self.releases.save(release.clone()).await?;
        self.emit_snapshot_events(&release, ChangeAction::Release).await;
        Ok(release)
    }

    pub async fn publish_canary(
        &self,
        release_id: i64,
        canary_rule: CanaryRule,
        by: &str,
    ) -> Result<Release, CoreError> {
        validate_canary_rule(&canary_rule)?;

        let mut release = self.releases.get(release_id).await?;
        if release.status != ReleaseStatus::Testing {
            return Err(CoreError::Conflict(format!(
                "release {release_id} is not in Testing status"
            )));
        }
        release.canary_rule = Some(canary_rule);
        release.release_type = ReleaseType::Canary;
        release.status = ReleaseStatus::Published;
        release.released_by = Some(by.to_string());
        release.released_at = Some(Utc::now());

        self.releases.save(release.clone()).await?;
        self.emit_snapshot_events(&release, ChangeAction::CanaryRelease).await;
        Ok(release)
    }

    pub async fn rollback(
        &self,
        current_id: i64,
        target_id: i64,
        by: &str,
        reason: &str,
    ) -> Result<Release, CoreError> {
        let mut current = self.releases.get(current_id).await?;
        if current.status != ReleaseStatus::Published {
            return Err(CoreError::Conflict(format!(
                "release {current_id} is not Published"
            )));
        }
        let target = self.releases.get(target_id).await?;
        if current.namespace_id != target.namespace_id || current.environment != target.environment {
            return Err(CoreError::Conflict(
                "rollback current and target releases must share namespace and environment".into(),
            ));
        }

        for item in &target.config_snapshot {
            if let Err(err) = self.configs.update_value(item.config_id, &item.value).await {
                tracing::warn!(error = %err, config_id = item.config_id, "skipping snapshot item during rollback");
            }
        }

        current.status = ReleaseStatus::Rollback;
        current.rolled_back_by = Some(by.to_string());
        current.rolled_back_at = Some(Utc::now());
        current.rollback_reason = Some(reason.to_string());
        current.rollback_from_version = Some(target.version);

        self.releases.save(current.clone()).await?;
        self.emit_snapshot_events(&target, ChangeAction::Rollback).await;
        Ok(current)
    }

    async fn emit_snapshot_events(&self, release: &Release, action: ChangeAction) {
        for item in &release.config_snapshot {
            let event = ChangeEvent {
                namespace_id: release.namespace_id,
                config_key: item.key.clone(),
                config_id: item.config_id,
                action,
            };
            if let Err(err) = self.bus.publish(event).await {
                tracing::warn!(error = %err, "failed to publish change event; next poll's fast-path compare will recover");
            }
        }
    }
}
