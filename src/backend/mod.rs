mod client;
mod errors;
pub mod types;

use async_trait::async_trait;

pub use client::HttpBackend;
pub use errors::{BackendError, Result};
pub use types::{
    BackendJobId,
    HistoryPage,
    HistoryQuery,
    JobStatistics,
    RemoteStatus,
    StatusReport,
    SubmitAck,
    UploadFile,
};

/// 分析服务的网络能力 - 队列只通过此接口访问后端
#[async_trait]
pub trait Backend: Send + Sync {
    /// Submit a file for analysis
    async fn submit(&self, file: &UploadFile) -> Result<SubmitAck>;

    /// Fetch the current status of a submitted job
    async fn poll_status(&self, backend_job_id: BackendJobId) -> Result<StatusReport>;

    /// Fetch one page of the user's upload history
    async fn list_history(&self, query: &HistoryQuery) -> Result<HistoryPage>;
}
