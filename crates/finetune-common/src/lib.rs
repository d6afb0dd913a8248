//! Common types for the finetune operator: CRDs, errors, configuration, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use config::{ControllerConfig, JobDefaults};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for every write the controller makes
pub const FIELD_MANAGER: &str = "finetune-controller";

/// Finalizer token the controller places on every TrainingJob it manages.
///
/// Present means "dependent resources still owe cleanup".
pub const TRAINING_JOB_FINALIZER: &str = "trainingjob.finetune.dev/finalizer";

/// Standard Kubernetes name label
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on everything the operator creates
pub const LABEL_MANAGED_BY_FINETUNE: &str = "finetune-operator";
