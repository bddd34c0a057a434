use std::fmt;
use std::path::Path;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server side job id
pub type BackendJobId = u64;

/// 待上传的文件
///
/// `data` 是 `Bytes`，clone 只增加引用计数，不会复制内容
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Read a file from disk, guessing the image content type from the extension
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("receipt")
            .to_string();

        let content_type = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("png") => Some("image/png"),
            Some(ext) if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") => Some("image/jpeg"),
            Some(ext) if ext.eq_ignore_ascii_case("webp") => Some("image/webp"),
            Some(ext) if ext.eq_ignore_ascii_case("heic") => Some("image/heic"),
            _ => None,
        };

        Ok(Self {
            name,
            content_type: content_type.map(String::from),
            data: Bytes::from(data),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 提交后服务端返回的确认（HTTP 202）
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAck {
    #[serde(rename = "uploadId")]
    pub backend_job_id: BackendJobId,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
}

/// Remote processing status reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteStatus {
    /// 处理中
    Processing,
    /// 全部成功
    Succeeded,
    /// 部分成功
    PartiallySucceeded,
    /// 失败
    Failed,
    /// 未知状态，按终态处理
    Other(String),
}

impl RemoteStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RemoteStatus::Processing => "processing",
            RemoteStatus::Succeeded => "completed",
            RemoteStatus::PartiallySucceeded => "partly_completed",
            RemoteStatus::Failed => "failed",
            RemoteStatus::Other(status) => status,
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, RemoteStatus::Processing)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RemoteStatus::Failed)
    }
}

impl From<String> for RemoteStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "processing" => RemoteStatus::Processing,
            "completed" | "succeeded" => RemoteStatus::Succeeded,
            "partly_completed" | "partially_succeeded" => RemoteStatus::PartiallySucceeded,
            "failed" => RemoteStatus::Failed,
            _ => RemoteStatus::Other(value),
        }
    }
}

impl From<RemoteStatus> for String {
    fn from(value: RemoteStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receipt counts for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobStatistics {
    pub total_detected: u32,
    pub successful: u32,
    pub failed: u32,
    pub processing: u32,
}

/// One split receipt as reported by the backend. Only the identifying fields are typed,
/// the extracted data is carried through untouched.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptItem {
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiptBuckets {
    pub successful: Vec<ReceiptItem>,
    pub failed: Vec<ReceiptItem>,
    pub processing: Vec<ReceiptItem>,
}

/// `GET /receipts/{uploadId}` 的响应
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(rename = "uploadId")]
    pub backend_job_id: BackendJobId,
    pub status: RemoteStatus,
    #[serde(default)]
    pub statistics: JobStatistics,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub receipts: ReceiptBuckets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    CreatedAt,
    UpdatedAt,
    Status,
}

impl SortBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortBy::CreatedAt => "createdAt",
            SortBy::UpdatedAt => "updatedAt",
            SortBy::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatusFilter {
    Processing,
    Completed,
    PartlyCompleted,
    Failed,
}

impl HistoryStatusFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatusFilter::Processing => "processing",
            HistoryStatusFilter::Completed => "completed",
            HistoryStatusFilter::PartlyCompleted => "partly_completed",
            HistoryStatusFilter::Failed => "failed",
        }
    }
}

/// Options for the paginated history listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort_by: Option<SortBy>,
    pub sort_order: Option<SortOrder>,
    pub status: Option<HistoryStatusFilter>,
}

impl HistoryQuery {
    /// Newest first, `limit` items
    pub fn recent(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            offset: None,
            sort_by: Some(SortBy::CreatedAt),
            sort_order: Some(SortOrder::Desc),
            status: None,
        }
    }

    /// Query string pairs, only for the options that are set
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset", offset.to_string()));
        }
        if let Some(sort_by) = self.sort_by {
            pairs.push(("sortBy", sort_by.as_str().to_string()));
        }
        if let Some(sort_order) = self.sort_order {
            pairs.push(("sortOrder", sort_order.as_str().to_string()));
        }
        if let Some(status) = self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HistoryImages {
    pub original: String,
    #[serde(default)]
    pub marked: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    #[serde(rename = "uploadId")]
    pub backend_job_id: BackendJobId,
    pub file_name: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub has_receipts: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub statistics: JobStatistics,
    pub images: HistoryImages,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

/// `GET /users/me/uploads` 的响应
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HistoryPage {
    #[serde(rename = "uploads")]
    pub items: Vec<HistoryItem>,
    #[serde(default)]
    pub pagination: Pagination,
}
