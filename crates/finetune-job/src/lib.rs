//! TrainingJob reconciliation engine
//!
//! Turns each `TrainingJob` into three dependent resources and keeps them in
//! line with its spec:
//! - a credential Secret holding the model hub token
//! - a PersistentVolumeClaim the model is downloaded into
//! - a one-shot batch Job that downloads the model and runs the training command
//!
//! Deletion is gated by a finalizer and tears the resources down in reverse
//! order, confirming each one is gone before moving to the next.

#![deny(missing_docs)]

mod compute;
mod controller;
mod credential;
mod locks;
mod materializer;
mod ownership;
mod store;
mod volume;
mod waiter;

#[cfg(test)]
mod testing;

pub use compute::{ComputeSynchronizer, SyncOutcome};
pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use credential::CredentialSynchronizer;
pub use locks::KeyLocks;
pub use materializer::{
    build_compute_job, build_credential, build_volume_claim, compute_drift, credential_key,
    inputs_digest, volume_drift, INPUTS_DIGEST_ANNOTATION, MODEL_VOLUME_NAME, TOKEN_ENV_VAR,
};
pub use store::{KubeStore, ObjectKey, ResourceKind, ResourceStore};
pub use volume::VolumeSynchronizer;
pub use waiter::{DeletionState, DeletionWaiter};
