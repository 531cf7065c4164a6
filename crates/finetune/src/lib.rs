//! Multi-task fine-tuning over a shared encoder.
//!
//! A run trains one task's head (and, when fine-tuning, the encoder) for a
//! fixed number of epochs, evaluates on the validation and test splits after
//! every epoch and keeps the best-scoring weights of each split on disk.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::{verify_checkpoint, CheckpointKind, CheckpointManifest, CheckpointWriter};
pub use config::{
    FinetuneError, OptimizerConfig, Precision, RunConfig, TaskConfig, TaskRegistry, TaskType,
    PAD_TAG,
};
pub use data::{
    BlockingDataLoader, DataBatch, DataLoader, LoaderOptions, TaskBatchLoader, TaskDataset,
    EVAL_MAX_LEN,
};
pub use loss::{criterion_for, CrossEntropyLoss};
pub use metrics::EvalReport;
pub use optimizer::{MixedPrecision, TrainerOptimizer};
pub use trainer::{
    select_device, BestScores, EpochSummary, Improvement, RunState, RunSummary, SanityDump,
    TaskModel, Trainer,
};
