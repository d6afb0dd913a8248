//! Custom Resource Definitions for the finetune operator

mod training_job;

pub use training_job::{
    TrainingJob, TrainingJobSpec, TrainingJobState, TrainingJobStatus, SUPPORTED_ACCESS_MODES,
};
