mod admission;
pub mod config;
mod controller;
mod coordinator;
pub mod crypto;
mod error;
mod parallelism;
mod processor;
mod progress;
mod remote;
mod retry;
pub mod run_log;
mod scheduler;
mod slicer;
mod source;
mod storage;
mod worker;

pub const APP_NAME: &str = "SyncBridge";

pub use admission::{AdmissionSlot, AdmissionSlotPool};
pub use config::{ControllerSettings, PipelineSettings, RetrySettings, UploadSettings};
pub use controller::{
    AdaptiveController, AttemptOutcome, ControllerSnapshot, ScalingDecision, is_overload_status,
};
pub use coordinator::{Completion, Coordinator, QueueProducer};
pub use error::{Error, Result};
pub use parallelism::{ParallelismManager, Reconciliation};
pub use processor::{Processor, UploadOptions, UploadRequest, UploadSummary};
pub use progress::{ProgressSink, ProgressSnapshot, ProgressState};
pub use remote::{
    AssertFinishedParams, AssertPartParams, FileDefinition, HttpTransferApi, InMemoryTransferApi,
    TransferApi, UploadLocation,
};
pub use retry::{DefaultRetryPolicies, RetryPolicy, RetryPolicyFactory};
pub use scheduler::{SessionEvent, SlicingScheduler};
pub use slicer::{SharedSource, Slicer};
pub use source::{Chunk, ChunkSource, EncryptedFileSource, InMemorySource};
pub use storage::{
    HttpPutStorage, InMemoryStorage, StorageOutcome, StorageProvider, StorageStrategy,
    StrategyRegistry,
};
pub use worker::{Worker, WorkerContext};
