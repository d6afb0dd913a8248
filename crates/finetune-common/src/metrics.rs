//! Metrics for finetune observability
//!
//! OpenTelemetry instruments for:
//! - TrainingJob reconciliation (duration, errors)
//! - Dependent resource operations (create, update, delete)
//! - Deletions that outlive the deletion deadline

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for finetune metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("finetune"));

/// Histogram of TrainingJob reconciliation duration
///
/// Labels:
/// - `job`: TrainingJob name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("finetune_reconcile_duration_seconds")
        .with_description("Duration of TrainingJob reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of TrainingJob reconciliation errors
///
/// Labels:
/// - `job`: TrainingJob name
/// - `error_type`: kube, conflict, validation, ownership, deletion_stuck, ...
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("finetune_reconcile_errors_total")
        .with_description("Total number of TrainingJob reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of writes to dependent resources
///
/// Labels:
/// - `kind`: Secret, PersistentVolumeClaim, Job
/// - `operation`: create, update, delete
pub static RESOURCE_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("finetune_resource_operations_total")
        .with_description("Total number of dependent resource writes")
        .with_unit("{operations}")
        .build()
});

/// Counter of deletions reported stuck
///
/// Labels:
/// - `kind`: Secret, PersistentVolumeClaim, Job
pub static DELETIONS_STUCK: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("finetune_deletions_stuck_total")
        .with_description("Total number of deletions that exceeded the deadline")
        .with_unit("{deletions}")
        .build()
});

/// Write performed against a dependent resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceOperation {
    /// Resource created
    Create,
    /// Resource updated in place
    Update,
    /// Resource deletion requested
    Delete,
}

impl ResourceOperation {
    /// Label value for this operation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Record a write against a dependent resource
pub fn record_resource_operation(kind: &str, operation: ResourceOperation) {
    RESOURCE_OPERATIONS.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("operation", operation.as_str()),
        ],
    );
}

/// Record a deletion that exceeded its deadline
pub fn record_deletion_stuck(kind: &str) {
    DELETIONS_STUCK.add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a TrainingJob reconciliation with timing
pub struct ReconcileTimer {
    job: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("job", self.job),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("job", self.job.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("job", self.job),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}
