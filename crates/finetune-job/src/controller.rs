//! TrainingJob reconciliation engine
//!
//! One pass, in order:
//! 1. Re-read the TrainingJob; gone means done
//! 2. Deletion requested: tear down Job, then volume claim, then credential,
//!    then release the finalizer
//! 3. Default and validate the spec; invalid specs wait for a user edit
//! 4. Add the finalizer and requeue before creating anything
//! 5. Converge credential, volume claim and compute Job, in that order
//!
//! Waiting for a deletion never blocks the worker: the pass records
//! `AwaitingDeletion` (or `Deleting`) and requeues.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use finetune_common::crd::{TrainingJob, TrainingJobSpec, TrainingJobState, TrainingJobStatus};
use finetune_common::kube_utils::has_finalizer;
use finetune_common::metrics::ReconcileTimer;
use finetune_common::{ControllerConfig, Error, TRAINING_JOB_FINALIZER};

use crate::compute::{ComputeSynchronizer, SyncOutcome};
use crate::credential::CredentialSynchronizer;
use crate::locks::KeyLocks;
use crate::materializer::credential_key;
use crate::store::{KubeStore, ObjectKey, ResourceKind, ResourceStore};
use crate::volume::VolumeSynchronizer;
use crate::waiter::DeletionState;

/// Shared state for all reconcile passes
pub struct Context {
    /// Store client (trait object so tests can run in memory)
    pub store: Arc<dyn ResourceStore>,
    /// Defaults and timings
    pub config: ControllerConfig,
    /// Per-TrainingJob serialization
    pub locks: KeyLocks,
    /// Last state this process wrote to each TrainingJob's status
    reported: DashMap<ObjectKey, TrainingJobState>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context backed by the Kubernetes API with default configuration
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Context over an arbitrary store
    pub fn with_store(store: Arc<dyn ResourceStore>, config: ControllerConfig) -> Self {
        Self {
            store,
            config,
            locks: KeyLocks::new(),
            reported: DashMap::new(),
        }
    }

    /// Best-effort status write; failures are logged and swallowed
    async fn report(&self, key: &ObjectKey, state: TrainingJobState, details: impl Into<String>) {
        let status = TrainingJobStatus::new(state, details);
        match self.store.patch_status(key, &status).await {
            Ok(()) => {
                self.reported.insert(key.clone(), status.state);
            }
            Err(e) => {
                // Forget what we last wrote so the next pass writes again
                self.reported.remove(key);
                warn!(error = %e, state = %status.state, "Failed to update TrainingJob status");
            }
        }
    }

    /// Report `Ready` unless that is already the last state written
    async fn report_ready(&self, key: &ObjectKey, changed: bool) {
        let already_ready = self
            .reported
            .get(key)
            .is_some_and(|state| *state == TrainingJobState::Ready);
        if changed || !already_ready {
            self.report(
                key,
                TrainingJobState::Ready,
                "credential, volume claim and compute job match the spec",
            )
            .await;
        }
    }

    fn forget(&self, key: &ObjectKey) {
        self.reported.remove(key);
    }

    /// Record a wait on a terminating resource and requeue
    async fn await_deletion(
        &self,
        key: &ObjectKey,
        kind: ResourceKind,
        state: TrainingJobState,
    ) -> Action {
        let name = match kind {
            ResourceKind::Credential => credential_key(key, &self.config).name,
            _ => key.name.clone(),
        };
        info!(%kind, %name, "Waiting for deletion to complete");
        self.report(key, state, format!("waiting for {} {} to be deleted", kind, name))
            .await;
        Action::requeue(self.config.deletion_requeue)
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ResourceStore>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            config: ControllerConfig::default(),
        }
    }

    /// Override the store (primarily for testing)
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(KubeStore::new(self.client)));
        Context::with_store(store, self.config)
    }
}

/// Reconcile one TrainingJob
#[instrument(
    skip(job, ctx),
    fields(job = %job.name_any(), namespace = %job.namespace().unwrap_or_default())
)]
pub async fn reconcile(job: Arc<TrainingJob>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = ObjectKey::for_job(&job)?;
    let timer = ReconcileTimer::start(key.to_string());

    let guard = ctx.locks.lock(&key).await;
    let result = reconcile_key(&key, &ctx).await;
    drop(guard);
    ctx.locks.prune(&key);

    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(e.error_type()),
    }
    result
}

async fn reconcile_key(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    // Act on a fresh read; the watch cache may predate our last write
    let Some(job) = ctx.store.get_training_job(key).await? else {
        debug!("TrainingJob no longer exists");
        ctx.forget(key);
        return Ok(Action::await_change());
    };

    if job.metadata.deletion_timestamp.is_some() {
        return match teardown(&job, key, ctx).await {
            Ok(action) => Ok(action),
            Err(e) => {
                ctx.report(key, state_for_error(&e), e.to_string()).await;
                Err(e)
            }
        };
    }

    let spec = job.spec.with_defaults(&ctx.config.defaults);
    if let Err(e) = spec.validate(&key.name) {
        ctx.report(key, TrainingJobState::Failed, e.to_string()).await;
        return Err(e);
    }

    if !has_finalizer(&job.metadata, TRAINING_JOB_FINALIZER) {
        info!("Adding finalizer");
        ctx.store.add_finalizer(key, TRAINING_JOB_FINALIZER).await?;
        ctx.report(key, TrainingJobState::Pending, "finalizer added").await;
        return Ok(Action::requeue(Duration::ZERO));
    }

    match converge(&job, &spec, key, ctx).await {
        Ok(action) => Ok(action),
        Err(e) => {
            ctx.report(key, state_for_error(&e), e.to_string()).await;
            Err(e)
        }
    }
}

/// Drive credential, volume claim and compute Job toward the spec
async fn converge(
    job: &TrainingJob,
    spec: &TrainingJobSpec,
    key: &ObjectKey,
    ctx: &Context,
) -> Result<Action, Error> {
    let store = ctx.store.as_ref();
    let config = &ctx.config;
    let compute = ComputeSynchronizer::new(store, config);

    let credential_changed = CredentialSynchronizer::new(store, config)
        .sync(job, spec, key)
        .await?;

    let volume = VolumeSynchronizer::new(store, config)
        .sync(job, spec, key, &compute)
        .await?;
    if let SyncOutcome::AwaitingDeletion(kind) = volume {
        return Ok(ctx
            .await_deletion(key, kind, TrainingJobState::AwaitingDeletion)
            .await);
    }

    let dependencies_changed = credential_changed || volume.changed();
    let compute_outcome = compute.sync(job, spec, key, dependencies_changed).await?;
    if let SyncOutcome::AwaitingDeletion(kind) = compute_outcome {
        return Ok(ctx
            .await_deletion(key, kind, TrainingJobState::AwaitingDeletion)
            .await);
    }

    let changed = dependencies_changed || compute_outcome.changed();
    if changed {
        info!(
            credential_changed,
            volume_changed = volume.changed(),
            "TrainingJob resources converged"
        );
    }
    ctx.report_ready(key, changed).await;

    Ok(Action::requeue(config.resync_interval))
}

/// Delete dependents in reverse creation order, then release the finalizer
async fn teardown(job: &TrainingJob, key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(&job.metadata, TRAINING_JOB_FINALIZER) {
        debug!("Deletion requested, no cleanup owed");
        return Ok(Action::await_change());
    }

    let store = ctx.store.as_ref();
    let config = &ctx.config;
    let owner_uid = job.uid().unwrap_or_default();

    let compute = ComputeSynchronizer::new(store, config)
        .retire(key, &owner_uid)
        .await;
    if skip_foreign(compute)? == DeletionState::Pending {
        return Ok(ctx
            .await_deletion(key, ResourceKind::ComputeJob, TrainingJobState::Deleting)
            .await);
    }

    let volume = VolumeSynchronizer::new(store, config)
        .teardown(key, &owner_uid)
        .await;
    if skip_foreign(volume)? == DeletionState::Pending {
        return Ok(ctx
            .await_deletion(key, ResourceKind::VolumeClaim, TrainingJobState::Deleting)
            .await);
    }

    let credential = CredentialSynchronizer::new(store, config)
        .teardown(key, &owner_uid)
        .await;
    if skip_foreign(credential)? == DeletionState::Pending {
        return Ok(ctx
            .await_deletion(key, ResourceKind::Credential, TrainingJobState::Deleting)
            .await);
    }

    ctx.store
        .remove_finalizer(key, TRAINING_JOB_FINALIZER)
        .await?;
    ctx.forget(key);
    info!("Dependent resources removed, finalizer released");
    Ok(Action::await_change())
}

/// Objects controlled by someone else are not ours to delete
fn skip_foreign(result: Result<DeletionState, Error>) -> Result<DeletionState, Error> {
    match result {
        Err(Error::Ownership {
            kind,
            name,
            message,
        }) => {
            warn!(%kind, %name, %message, "Leaving resource owned by another controller");
            Ok(DeletionState::Absent)
        }
        other => other,
    }
}

fn state_for_error(error: &Error) -> TrainingJobState {
    match error {
        Error::DeletionStuck { .. } => TrainingJobState::Stuck,
        _ => TrainingJobState::Failed,
    }
}

/// Decide when to retry a failed pass.
///
/// Validation failures wait for the user to edit the TrainingJob. Finalizer
/// races retry quickly, stuck deletions slowly.
pub fn error_policy(job: Arc<TrainingJob>, error: &Error, ctx: Arc<Context>) -> Action {
    let config = &ctx.config;
    let name = job.name_any();

    match error {
        Error::Validation { .. } => {
            warn!(job = %name, %error, "TrainingJob is invalid, waiting for a spec change");
            Action::await_change()
        }
        Error::DeletionStuck { .. } => {
            error!(job = %name, %error, "Deletion is stuck");
            Action::requeue(config.stuck_requeue)
        }
        e if e.is_conflict() => {
            debug!(job = %name, %error, "Write conflict, retrying soon");
            Action::requeue(config.finalizer_requeue)
        }
        _ => {
            error!(job = %name, ?error, "Reconciliation failed");
            Action::requeue(config.error_requeue)
        }
    }
}
