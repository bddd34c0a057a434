use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::backend::types::{
    BackendJobId,
    HistoryItem,
    JobStatistics,
    ReceiptItem,
    RemoteStatus,
    StatusReport,
    SubmitAck,
    UploadFile,
};

/// 上传条目唯一标识（本地生成）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中（在队列中）
    Pending,
    /// 上传中
    Uploading,
    /// 服务端处理中
    Processing,
    /// 已完成
    Success,
    /// 失败
    Error,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Success | UploadStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Processing => "processing",
            UploadStatus::Success => "success",
            UploadStatus::Error => "error",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interim state captured while the backend is still processing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSnapshot {
    #[serde(rename = "uploadId")]
    pub backend_job_id: BackendJobId,
    pub status: RemoteStatus,
    pub statistics: JobStatistics,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProcessingSnapshot {
    pub fn from_report(report: &StatusReport) -> Self {
        Self {
            backend_job_id: report.backend_job_id,
            status: report.status.clone(),
            statistics: report.statistics,
            message: report.message.clone(),
        }
    }
}

/// Final payload of a finished job
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalOutcome {
    #[serde(rename = "uploadId")]
    pub backend_job_id: BackendJobId,
    pub status: RemoteStatus,
    pub statistics: JobStatistics,
    #[serde(rename = "successful_receipts", default)]
    pub successful_receipts: Vec<ReceiptItem>,
    #[serde(rename = "failed_receipts", default)]
    pub failed_receipts: Vec<ReceiptItem>,
    #[serde(default)]
    pub message: Option<String>,
}

impl FinalOutcome {
    pub fn from_report(report: StatusReport) -> Self {
        Self {
            backend_job_id: report.backend_job_id,
            status: report.status,
            statistics: report.statistics,
            successful_receipts: report.receipts.successful,
            failed_receipts: report.receipts.failed,
            message: report.message,
        }
    }
}

/// 条目在各阶段携带的结果
#[derive(Debug, Clone, PartialEq)]
pub enum UploadResult {
    /// 提交被受理
    Acknowledged(SubmitAck),
    /// 轮询中的中间快照
    Snapshot(ProcessingSnapshot),
    /// 最终结果
    Final(FinalOutcome),
}

/// One user-initiated file submission
#[derive(Debug, Clone)]
pub struct UploadEntry {
    pub id: UploadId,
    /// 入队顺序号，认领按它做 FIFO
    pub seq: u64,
    pub file: UploadFile,
    pub status: UploadStatus,
    pub progress: u8,
    pub backend_job_id: Option<BackendJobId>,
    pub result: Option<UploadResult>,
    pub error_message: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadEntry {
    pub(crate) fn new(file: UploadFile, seq: u64) -> Self {
        Self {
            id: UploadId::new(),
            seq,
            file,
            status: UploadStatus::Pending,
            progress: 0,
            backend_job_id: None,
            result: None,
            error_message: None,
            submitted_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file.name
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Non-status fields merged by `UploadStore::update_fields`.
///
/// The backend job id is not patchable, only `begin_processing` assigns it.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub progress: Option<u8>,
    pub result: Option<UploadResult>,
}

impl EntryPatch {
    pub fn result(result: UploadResult) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }
}

/// What a history summary carries as its payload
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SummaryResult {
    /// Recorded locally when the job finished in this client
    Final(FinalOutcome),
    /// Reconciled from the backend history listing
    #[serde(rename_all = "camelCase")]
    Remote {
        original_image_url: String,
        #[serde(default)]
        marked_image_url: Option<String>,
    },
}

/// 已完成上传的持久化摘要
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    #[serde(rename = "uploadId")]
    pub backend_job_id: BackendJobId,
    pub file_name: String,
    #[serde(rename = "uploadedAt")]
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub statistics: JobStatistics,
    pub result: SummaryResult,
}

impl CompletedUpload {
    pub(crate) fn from_entry(entry: &UploadEntry, outcome: &FinalOutcome, completed_at: DateTime<Utc>) -> Self {
        Self {
            backend_job_id: outcome.backend_job_id,
            file_name: entry.file.name.clone(),
            submitted_at: entry.submitted_at.unwrap_or(completed_at),
            completed_at,
            statistics: outcome.statistics,
            result: SummaryResult::Final(outcome.clone()),
        }
    }
}

impl From<HistoryItem> for CompletedUpload {
    fn from(item: HistoryItem) -> Self {
        Self {
            backend_job_id: item.backend_job_id,
            file_name: item.file_name,
            submitted_at: item.created_at,
            completed_at: item.updated_at,
            statistics: item.statistics,
            result: SummaryResult::Remote {
                original_image_url: item.images.original,
                marked_image_url: item.images.marked,
            },
        }
    }
}

/// 队列的全部状态，只由 `UploadStore` 修改
#[derive(Debug, Clone, Default)]
pub struct QueueState {
    /// Newest first
    pub uploads: Vec<UploadEntry>,
    pub is_processing: bool,
    /// Newest first
    pub completed_uploads: Vec<CompletedUpload>,
    pub loading_history: bool,
    pub history_error: Option<String>,
}

impl QueueState {
    pub fn entry(&self, id: UploadId) -> Option<&UploadEntry> {
        self.uploads.iter().find(|entry| entry.id == id)
    }

    pub(crate) fn entry_mut(&mut self, id: UploadId) -> Option<&mut UploadEntry> {
        self.uploads.iter_mut().find(|entry| entry.id == id)
    }

    /// Pending entries, oldest enqueued first
    pub fn pending_in_order(&self) -> Vec<&UploadEntry> {
        let mut pending: Vec<_> = self
            .uploads
            .iter()
            .filter(|entry| entry.status == UploadStatus::Pending)
            .collect();
        pending.sort_by_key(|entry| entry.seq);
        pending
    }

    pub fn count_by_status(&self, status: UploadStatus) -> usize {
        self.uploads.iter().filter(|entry| entry.status == status).count()
    }
}

/// 队列事件
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// 新条目入队
    EntryAdded {
        upload_id: UploadId,
    },

    /// 状态变更
    StateChanged {
        upload_id: UploadId,
        old_state: UploadStatus,
        new_state: UploadStatus,
    },

    /// 进度更新
    Progress {
        upload_id: UploadId,
        progress: u8,
    },

    /// 条目被移除
    EntryRemoved {
        upload_id: UploadId,
    },

    /// 历史记录变化
    HistoryChanged {
        len: usize,
    },

    /// 全部数据被清空
    Cleared,
}
