// 分段上传 / 拷贝模块

pub mod aggregator;
pub mod coordinator;
pub mod error;
pub mod planner;
pub mod progress;
pub mod session;
pub mod task;

pub use aggregator::{
    CompletedPart, CompletionAggregator, CompletionManifest, FailurePolicy, WaitOptions,
    WaitOutcome,
};
pub use coordinator::{CompletedUpload, UploadCoordinator, UploadOptions, UploadPhase};
pub use error::{
    AggregationError, FailedPart, FailedPhase, FinalizeError, PartTransferError, PlanningError,
    SessionError, UploadError,
};
pub use planner::{
    plan, resolve_part_size, PartDescriptor, DEFAULT_PART_SIZE, MAX_PART_COUNT, MAX_PART_SIZE,
    MIN_PART_SIZE,
};
pub use progress::{logging_progress, PartProgress, ProgressCallback};
pub use session::{
    CommittedPart, PendingParts, RetryPolicy, SessionOptions, UploadSession, UploadSessionHandle,
};
pub use task::{
    ByteSource, FileSource, MemorySource, PartOutcome, PartResult, PartTransferTask, SourceSpec,
};
