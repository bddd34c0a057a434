pub mod backend;
pub mod config;
pub mod history;
pub mod queue;
pub mod session;

pub use backend::{Backend, BackendError, HttpBackend, UploadFile};
pub use config::{AppConfig, QueueConfig};
pub use history::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
pub use queue::{
    CompletedUpload,
    QueueError,
    QueueEvent,
    QueueProcessor,
    QueueState,
    Result,
    UploadEntry,
    UploadId,
    UploadStatus,
    UploadStore,
};
pub use session::{SessionProvider, StaticSession};
