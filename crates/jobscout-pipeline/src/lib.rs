//! The per-subscription run pipeline: expansion → collection →
//! normalization → matching → notification.

pub mod batch;
pub mod driver;
pub mod notify;

pub use batch::{
    AdaptiveBatchConfig, AdaptiveBatchProcessor, AdaptiveState, BatchItemResult, BatchProgress,
    ScoredMatch, SliceObservation,
};
pub use driver::{DedupOrder, PipelineConfig, PipelineDriver, RunReport};
pub use notify::{NotificationEmitter, RetainedMatch, SendReport};
