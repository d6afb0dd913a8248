//! Deletion confirmation
//!
//! Deleting a dependent resource is only half the job: the next step of a
//! teardown or recreation may not start until the object is really gone.
//! [`DeletionWaiter`] checks a bounded number of times within one pass and
//! otherwise reports [`DeletionState::Pending`], leaving the next check to
//! the controller's requeue. An object that stays terminating past the
//! configured deadline is reported as stuck.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, warn};

use finetune_common::metrics::{self, ResourceOperation};
use finetune_common::{ControllerConfig, Error};

use crate::ownership::ensure_controllable;
use crate::store::{ObjectKey, ResourceKind, ResourceStore};

/// Result of a deletion check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionState {
    /// The object no longer exists
    Absent,
    /// The object is still terminating; check again later
    Pending,
}

/// Issues deletes and confirms absence without blocking a worker
pub struct DeletionWaiter<'a> {
    store: &'a dyn ResourceStore,
    config: &'a ControllerConfig,
}

impl<'a> DeletionWaiter<'a> {
    /// Create a waiter over `store`
    pub fn new(store: &'a dyn ResourceStore, config: &'a ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Delete an object owned by `owner_uid` and check that it is gone.
    ///
    /// An object already terminating is not deleted again. Objects controlled
    /// by another owner yield an ownership error and are left alone.
    pub async fn delete_and_wait(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        owner_uid: &str,
    ) -> Result<DeletionState, Error> {
        let Some(meta) = self.store.get_metadata(kind, key).await? else {
            return Ok(DeletionState::Absent);
        };
        ensure_controllable(kind, key, &meta, owner_uid)?;

        if meta.deletion_timestamp.is_none() && self.store.delete(kind, key).await? {
            metrics::record_resource_operation(kind.kind_str(), ResourceOperation::Delete);
            debug!(%kind, object = %key, "Deletion requested");
        }

        self.wait_absent(kind, key).await
    }

    /// Check up to the configured number of times that the object is gone
    pub async fn wait_absent(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
    ) -> Result<DeletionState, Error> {
        let attempts = self.config.deletion_poll_attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 && !self.config.deletion_poll_interval.is_zero() {
                tokio::time::sleep(self.config.deletion_poll_interval).await;
            }

            let Some(meta) = self.store.get_metadata(kind, key).await? else {
                debug!(%kind, object = %key, "Deletion confirmed");
                return Ok(DeletionState::Absent);
            };

            let waited = terminating_for(&meta);
            if waited > self.config.deletion_deadline {
                warn!(
                    %kind,
                    object = %key,
                    waited_secs = waited.as_secs(),
                    "Deletion exceeded deadline"
                );
                metrics::record_deletion_stuck(kind.kind_str());
                return Err(Error::deletion_stuck(kind.kind_str(), key.name.clone(), waited));
            }
        }

        debug!(%kind, object = %key, "Still terminating, will check again");
        Ok(DeletionState::Pending)
    }
}

/// Time since deletion was requested; zero when not terminating
fn terminating_for(meta: &ObjectMeta) -> Duration {
    meta.deletion_timestamp
        .as_ref()
        .and_then(|ts| Utc::now().signed_duration_since(ts.0).to_std().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockResourceStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};

    fn key() -> ObjectKey {
        ObjectKey::new("ml", "job-a")
    }

    fn owned_meta(uid: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some("job-a".into()),
            owner_references: Some(vec![OwnerReference {
                api_version: "finetune.dev/v1".into(),
                kind: "TrainingJob".into(),
                name: "job-a".into(),
                uid: uid.into(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        }
    }

    fn terminating_since(secs_ago: i64) -> ObjectMeta {
        ObjectMeta {
            deletion_timestamp: Some(Time(Utc::now() - chrono::Duration::seconds(secs_ago))),
            ..owned_meta("uid-a")
        }
    }

    #[tokio::test]
    async fn missing_object_is_already_absent() {
        let mut store = MockResourceStore::new();
        store.expect_get_metadata().returning(|_, _| Ok(None));
        store.expect_delete().never();

        let config = ControllerConfig::for_testing();
        let waiter = DeletionWaiter::new(&store, &config);
        let state = waiter
            .delete_and_wait(ResourceKind::ComputeJob, &key(), "uid-a")
            .await
            .unwrap();
        assert_eq!(state, DeletionState::Absent);
    }

    #[tokio::test]
    async fn delete_then_confirm_absence() {
        let mut store = MockResourceStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_get_metadata()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(owned_meta("uid-a"))));
        store
            .expect_delete()
            .withf(|kind, _| *kind == ResourceKind::VolumeClaim)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        store
            .expect_get_metadata()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));

        let config = ControllerConfig::for_testing();
        let waiter = DeletionWaiter::new(&store, &config);
        let state = waiter
            .delete_and_wait(ResourceKind::VolumeClaim, &key(), "uid-a")
            .await
            .unwrap();
        assert_eq!(state, DeletionState::Absent);
    }

    /// Story: a resource held by its own finalizer does not pin a worker
    #[tokio::test]
    async fn story_terminating_object_reports_pending_without_deleting_again() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_metadata()
            .times(2)
            .returning(|_, _| Ok(Some(terminating_since(10))));
        store.expect_delete().never();

        let config = ControllerConfig::for_testing();
        let waiter = DeletionWaiter::new(&store, &config);
        let state = waiter
            .delete_and_wait(ResourceKind::ComputeJob, &key(), "uid-a")
            .await
            .unwrap();
        assert_eq!(state, DeletionState::Pending);
    }

    /// Story: past the deadline the deletion is reported stuck, not retried quietly
    #[tokio::test]
    async fn story_deletion_past_deadline_is_stuck() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_metadata()
            .returning(|_, _| Ok(Some(terminating_since(3600))));

        let config = ControllerConfig::for_testing();
        let waiter = DeletionWaiter::new(&store, &config);
        let err = waiter
            .wait_absent(ResourceKind::VolumeClaim, &key())
            .await
            .unwrap_err();
        match err {
            Error::DeletionStuck { kind, waited_secs, .. } => {
                assert_eq!(kind, "PersistentVolumeClaim");
                assert!(waited_secs >= 3600);
            }
            other => panic!("expected DeletionStuck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn foreign_object_is_never_deleted() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_metadata()
            .returning(|_, _| Ok(Some(owned_meta("someone-else"))));
        store.expect_delete().never();

        let config = ControllerConfig::for_testing();
        let waiter = DeletionWaiter::new(&store, &config);
        let err = waiter
            .delete_and_wait(ResourceKind::Credential, &key(), "uid-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ownership { .. }));
    }

    #[tokio::test]
    async fn polls_the_configured_number_of_times() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_metadata()
            .times(3)
            .returning(|_, _| Ok(Some(terminating_since(1))));

        let config = ControllerConfig {
            deletion_poll_attempts: 3,
            deletion_poll_interval: Duration::from_millis(1),
            ..ControllerConfig::for_testing()
        };
        let waiter = DeletionWaiter::new(&store, &config);
        let state = waiter
            .wait_absent(ResourceKind::ComputeJob, &key())
            .await
            .unwrap();
        assert_eq!(state, DeletionState::Pending);
    }
}
