mod errors;
mod poller;
mod processor;
mod store;
mod types;
mod worker;

pub use errors::{QueueError, Result};
pub use poller::{REMOTE_FAILURE_MESSAGE, TIMEOUT_MESSAGE};
pub use processor::QueueProcessor;
pub use store::UploadStore;
pub use types::{
    CompletedUpload,
    EntryPatch,
    FinalOutcome,
    ProcessingSnapshot,
    QueueEvent,
    QueueState,
    SummaryResult,
    UploadEntry,
    UploadId,
    UploadResult,
    UploadStatus,
};
