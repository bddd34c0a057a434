use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use crate::backend::{Backend, BackendJobId, HistoryQuery, JobStatistics, SubmitAck, UploadFile};
use crate::history::{HistoryStore, scope_key};
use crate::session::SessionProvider;
use super::errors::{QueueError, Result};
use super::types::{
    CompletedUpload,
    EntryPatch,
    FinalOutcome,
    QueueEvent,
    QueueState,
    UploadEntry,
    UploadId,
    UploadResult,
    UploadStatus,
};

const EVENT_CAPACITY: usize = 256;

/// 队列状态的唯一写入者
///
/// Every mutation happens inside one write-lock critical section, so a reader
/// never sees a half-applied update. The lock is never held across an `.await`;
/// persistence runs after the state change, serialized by `persist_lock`.
pub struct UploadStore {
    state: RwLock<QueueState>,
    next_seq: AtomicU64,
    backend: Arc<dyn Backend>,
    history: Arc<dyn HistoryStore>,
    session: Arc<dyn SessionProvider>,
    history_page_size: u32,
    persist_lock: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl UploadStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        history: Arc<dyn HistoryStore>,
        session: Arc<dyn SessionProvider>,
        history_page_size: u32,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            state: RwLock::new(QueueState::default()),
            next_seq: AtomicU64::new(0),
            backend,
            history,
            session,
            history_page_size,
            persist_lock: tokio::sync::Mutex::new(()),
            event_tx,
        }
    }

    /// Create the store and load the persisted history of the active identity
    pub async fn open(
        backend: Arc<dyn Backend>,
        history: Arc<dyn HistoryStore>,
        session: Arc<dyn SessionProvider>,
        history_page_size: u32,
    ) -> Self {
        let store = Self::new(backend, history, session, history_page_size);
        store.reload_for_identity().await;
        store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> QueueState {
        self.state.read().clone()
    }

    pub fn entry(&self, id: UploadId) -> Option<UploadEntry> {
        self.state.read().entry(id).cloned()
    }

    pub fn completed_uploads(&self) -> Vec<CompletedUpload> {
        self.state.read().completed_uploads.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.state.read().is_processing
    }

    /// Ids of pending entries, oldest enqueued first
    pub fn pending_ids(&self) -> Vec<UploadId> {
        self.state
            .read()
            .pending_in_order()
            .into_iter()
            .map(|entry| entry.id)
            .collect()
    }

    /// Acknowledged entries still waiting on their backend job
    pub fn processing_jobs(&self) -> Vec<(UploadId, BackendJobId)> {
        self.state
            .read()
            .uploads
            .iter()
            .filter(|entry| entry.status == UploadStatus::Processing)
            .filter_map(|entry| entry.backend_job_id.map(|job_id| (entry.id, job_id)))
            .collect()
    }

    pub fn enqueue(&self, file: UploadFile) -> UploadId {
        let entry = UploadEntry::new(file, self.next_seq.fetch_add(1, Ordering::SeqCst));
        let id = entry.id;
        self.state.write().uploads.insert(0, entry);

        debug!("Enqueued upload {}", id);
        self.emit(QueueEvent::EntryAdded { upload_id: id });
        id
    }

    /// Add files as one block ahead of the existing entries, keeping their input order
    pub fn enqueue_many(&self, files: Vec<UploadFile>) -> Vec<UploadId> {
        let entries: Vec<UploadEntry> = files
            .into_iter()
            .map(|file| UploadEntry::new(file, self.next_seq.fetch_add(1, Ordering::SeqCst)))
            .collect();
        let ids: Vec<UploadId> = entries.iter().map(|entry| entry.id).collect();

        {
            let mut state = self.state.write();
            state.uploads.splice(0..0, entries);
        }

        for id in &ids {
            debug!("Enqueued upload {}", id);
            self.emit(QueueEvent::EntryAdded { upload_id: *id });
        }

        ids
    }

    /// Move an entry to `status`. `Error` must go through `set_error`.
    pub fn set_status(&self, id: UploadId, status: UploadStatus, progress: Option<u8>) -> Result<()> {
        let old_state = {
            let mut state = self.state.write();
            let entry = state.entry_mut(id).ok_or(QueueError::EntryNotFound(id))?;

            if status == UploadStatus::Error || entry.is_terminal() {
                return Err(QueueError::invalid_transition(id, entry.status, status));
            }

            let old_state = entry.status;
            entry.status = status;
            if let Some(progress) = progress {
                entry.progress = progress.min(100);
            }
            if status == UploadStatus::Success {
                entry.completed_at = Some(Utc::now());
            }
            old_state
        };

        self.emit_state_change(id, old_state, status);
        if let Some(progress) = progress {
            self.emit(QueueEvent::Progress { upload_id: id, progress: progress.min(100) });
        }

        Ok(())
    }

    pub fn set_error(&self, id: UploadId, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        let old_state = {
            let mut state = self.state.write();
            let entry = state.entry_mut(id).ok_or(QueueError::EntryNotFound(id))?;

            if entry.is_terminal() {
                return Err(QueueError::invalid_transition(id, entry.status, UploadStatus::Error));
            }

            let old_state = entry.status;
            entry.status = UploadStatus::Error;
            entry.error_message = Some(message.clone());
            entry.completed_at = Some(Utc::now());
            old_state
        };

        warn!("Upload {} failed: {}", id, message);
        self.emit_state_change(id, old_state, UploadStatus::Error);

        Ok(())
    }

    /// Record the final outcome and append its summary to the persisted history
    pub async fn set_result(&self, id: UploadId, outcome: FinalOutcome) -> Result<()> {
        let (old_state, summary) = {
            let mut state = self.state.write();
            let entry = state.entry_mut(id).ok_or(QueueError::EntryNotFound(id))?;

            if entry.is_terminal() {
                return Err(QueueError::invalid_transition(id, entry.status, UploadStatus::Success));
            }

            let completed_at = Utc::now();
            let old_state = entry.status;
            entry.status = UploadStatus::Success;
            entry.progress = 100;
            entry.completed_at = Some(completed_at);
            entry.backend_job_id = Some(outcome.backend_job_id);

            let summary = CompletedUpload::from_entry(entry, &outcome, completed_at);
            entry.result = Some(UploadResult::Final(outcome));

            state.completed_uploads.insert(0, summary.clone());
            (old_state, summary)
        };

        info!("Upload {} finished as backend job {}", id, summary.backend_job_id);
        self.emit_state_change(id, old_state, UploadStatus::Success);
        self.emit(QueueEvent::Progress { upload_id: id, progress: 100 });
        self.emit_history_changed();

        self.persist_history().await;
        Ok(())
    }

    /// `Uploading -> Processing` once the backend accepted the file
    pub fn begin_processing(&self, id: UploadId, ack: &SubmitAck) -> Result<()> {
        let old_state = {
            let mut state = self.state.write();
            let entry = state.entry_mut(id).ok_or(QueueError::EntryNotFound(id))?;

            if entry.status != UploadStatus::Uploading {
                return Err(QueueError::invalid_transition(id, entry.status, UploadStatus::Processing));
            }

            let old_state = entry.status;
            entry.status = UploadStatus::Processing;
            entry.progress = 0;
            entry.backend_job_id = Some(ack.backend_job_id);
            entry.result = Some(UploadResult::Acknowledged(ack.clone()));
            old_state
        };

        info!("Upload {} accepted as backend job {}", id, ack.backend_job_id);
        self.emit_state_change(id, old_state, UploadStatus::Processing);
        self.emit(QueueEvent::Progress { upload_id: id, progress: 0 });

        Ok(())
    }

    /// Advance synthetic progress. Returns `None` once the entry left `Uploading`
    /// or reached `cap`.
    pub fn bump_progress(&self, id: UploadId, step: u8, cap: u8) -> Option<u8> {
        let progress = {
            let mut state = self.state.write();
            let entry = state.entry_mut(id)?;

            if entry.status != UploadStatus::Uploading || entry.progress >= cap {
                return None;
            }

            entry.progress = entry.progress.saturating_add(step).min(cap);
            entry.progress
        };

        self.emit(QueueEvent::Progress { upload_id: id, progress });
        Some(progress)
    }

    /// Merge non-status fields. Terminal entries are left untouched.
    pub fn update_fields(&self, id: UploadId, patch: EntryPatch) -> Result<()> {
        let progress = {
            let mut state = self.state.write();
            let entry = state.entry_mut(id).ok_or(QueueError::EntryNotFound(id))?;

            if entry.is_terminal() {
                debug!("Ignoring update for finished upload {}", id);
                return Ok(());
            }

            // 上传中进度只增不减
            let progress = patch
                .progress
                .map(|progress| progress.min(100))
                .filter(|progress| entry.status != UploadStatus::Uploading || *progress >= entry.progress);
            if let Some(progress) = progress {
                entry.progress = progress;
            }
            if let Some(result) = patch.result {
                entry.result = Some(result);
            }
            progress
        };

        if let Some(progress) = progress {
            self.emit(QueueEvent::Progress { upload_id: id, progress });
        }

        Ok(())
    }

    pub fn remove(&self, id: UploadId) -> Result<()> {
        {
            let mut state = self.state.write();
            let index = state
                .uploads
                .iter()
                .position(|entry| entry.id == id)
                .ok_or(QueueError::EntryNotFound(id))?;
            state.uploads.remove(index);
        }

        self.emit(QueueEvent::EntryRemoved { upload_id: id });
        Ok(())
    }

    /// Drop every `Success`/`Error` entry, returns how many were removed
    pub fn clear_terminal(&self) -> usize {
        let removed: Vec<UploadId> = {
            let mut state = self.state.write();
            let (terminal, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.uploads)
                .into_iter()
                .partition(|entry| entry.is_terminal());
            state.uploads = live;
            terminal.into_iter().map(|entry| entry.id).collect()
        };

        for id in &removed {
            self.emit(QueueEvent::EntryRemoved { upload_id: *id });
        }

        removed.len()
    }

    /// Drop all live entries, history is kept
    pub fn clear_all(&self) {
        self.state.write().uploads.clear();
        self.emit(QueueEvent::Cleared);
    }

    pub async fn clear_history(&self) {
        self.state.write().completed_uploads.clear();
        self.emit_history_changed();
        self.persist_history().await;
    }

    /// Full reset on sign-out
    pub fn clear_all_data(&self) {
        {
            let mut state = self.state.write();
            state.uploads.clear();
            state.completed_uploads.clear();
            state.loading_history = false;
            state.history_error = None;
        }

        info!("Cleared all upload data");
        self.emit(QueueEvent::Cleared);
    }

    pub fn set_processing(&self, is_processing: bool) {
        self.state.write().is_processing = is_processing;
    }

    /// Replace the history with the backend's list.
    ///
    /// When the backend can't be reached the persisted cache is served instead and
    /// `history_error` is set. Existing history is never dropped because of a failed call.
    pub async fn fetch_history(&self) -> Vec<CompletedUpload> {
        {
            let mut state = self.state.write();
            state.loading_history = true;
            state.history_error = None;
        }

        let query = HistoryQuery::recent(self.history_page_size);
        match self.backend.list_history(&query).await {
            Ok(page) => {
                let uploads: Vec<CompletedUpload> = page
                    .items
                    .into_iter()
                    .map(CompletedUpload::from)
                    .collect();

                {
                    let mut state = self.state.write();
                    state.completed_uploads = uploads.clone();
                    state.loading_history = false;
                }

                debug!("Fetched {} history entries from the backend", uploads.len());
                self.emit_history_changed();
                self.persist_history().await;

                uploads
            }
            Err(err) => {
                warn!("Failed to fetch upload history: {}", err);

                let key = scope_key(self.session.user_email().as_deref());
                let cached = match self.history.get(&key).await {
                    Ok(cached) => cached,
                    Err(err) => {
                        warn!("Failed to read cached history: {}", err);
                        None
                    }
                };

                let uploads = {
                    let mut state = self.state.write();
                    if let Some(cached) = cached {
                        state.completed_uploads = cached;
                    }
                    state.loading_history = false;
                    state.history_error = Some(err.user_message());
                    state.completed_uploads.clone()
                };

                self.emit_history_changed();
                uploads
            }
        }
    }

    /// Refresh the statistics of a recorded job. Returns whether a summary matched.
    pub async fn update_upload_statistics(&self, backend_job_id: BackendJobId, statistics: JobStatistics) -> bool {
        let updated = {
            let mut state = self.state.write();
            match state
                .completed_uploads
                .iter_mut()
                .find(|upload| upload.backend_job_id == backend_job_id)
            {
                Some(upload) => {
                    upload.statistics = statistics;
                    true
                }
                None => false,
            }
        };

        if updated {
            self.emit_history_changed();
            self.persist_history().await;
        }

        updated
    }

    /// Swap the history for the one persisted under the active identity
    pub async fn reload_for_identity(&self) {
        let key = scope_key(self.session.user_email().as_deref());
        let uploads = match self.history.get(&key).await {
            Ok(uploads) => uploads.unwrap_or_default(),
            Err(err) => {
                warn!("Failed to load history for {}: {}", key, err);
                Vec::new()
            }
        };

        {
            let mut state = self.state.write();
            state.completed_uploads = uploads;
            state.history_error = None;
        }

        self.emit_history_changed();
    }

    async fn persist_history(&self) {
        let _guard = self.persist_lock.lock().await;

        let key = scope_key(self.session.user_email().as_deref());
        let uploads = self.completed_uploads();

        if let Err(err) = self.history.set(&key, &uploads).await {
            warn!("Failed to persist history under {}: {}", key, err);
        }
    }

    fn emit_state_change(&self, upload_id: UploadId, old_state: UploadStatus, new_state: UploadStatus) {
        if old_state != new_state {
            debug!("Upload {}: {} -> {}", upload_id, old_state, new_state);
        }
        self.emit(QueueEvent::StateChanged { upload_id, old_state, new_state });
    }

    fn emit_history_changed(&self) {
        let len = self.state.read().completed_uploads.len();
        self.emit(QueueEvent::HistoryChanged { len });
    }

    fn emit(&self, event: QueueEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use crate::backend::{BackendError, HistoryPage, RemoteStatus, StatusReport};
    use crate::backend::types::{HistoryImages, HistoryItem, Pagination};
    use crate::history::MemoryHistoryStore;
    use crate::session::StaticSession;

    #[derive(Default)]
    struct HistoryBackend {
        page: Mutex<Option<Vec<HistoryItem>>>,
    }

    #[async_trait]
    impl Backend for HistoryBackend {
        async fn submit(&self, _file: &UploadFile) -> crate::backend::Result<SubmitAck> {
            Err(BackendError::InvalidRequest("not scripted".to_string()))
        }

        async fn poll_status(&self, _backend_job_id: BackendJobId) -> crate::backend::Result<StatusReport> {
            Err(BackendError::InvalidRequest("not scripted".to_string()))
        }

        async fn list_history(&self, _query: &HistoryQuery) -> crate::backend::Result<HistoryPage> {
            match self.page.lock().clone() {
                Some(items) => Ok(HistoryPage {
                    pagination: Pagination {
                        total: items.len() as u64,
                        limit: 100,
                        offset: 0,
                        has_more: false,
                    },
                    items,
                }),
                None => Err(BackendError::server_error(503, "History is unavailable")),
            }
        }
    }

    struct Fixture {
        store: UploadStore,
        backend: Arc<HistoryBackend>,
        history: Arc<MemoryHistoryStore>,
        session: Arc<StaticSession>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(HistoryBackend::default());
        let history = Arc::new(MemoryHistoryStore::new());
        let session = Arc::new(StaticSession::new(Some("token".to_string()), Some("ana@example.com".to_string())));
        let store = UploadStore::new(backend.clone(), history.clone(), session.clone(), 100);

        Fixture { store, backend, history, session }
    }

    fn file(name: &str) -> UploadFile {
        UploadFile::new(name, vec![1u8, 2, 3])
    }

    fn outcome(backend_job_id: BackendJobId) -> FinalOutcome {
        FinalOutcome {
            backend_job_id,
            status: RemoteStatus::Succeeded,
            statistics: JobStatistics {
                total_detected: 3,
                successful: 3,
                failed: 0,
                processing: 0,
            },
            successful_receipts: vec![],
            failed_receipts: vec![],
            message: None,
        }
    }

    fn history_item(backend_job_id: BackendJobId) -> HistoryItem {
        HistoryItem {
            backend_job_id,
            file_name: format!("scan-{}.png", backend_job_id),
            status: RemoteStatus::Succeeded,
            has_receipts: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            statistics: JobStatistics::default(),
            images: HistoryImages {
                original: "original.png".to_string(),
                marked: None,
            },
        }
    }

    fn assert_invariants(state: &QueueState) {
        for entry in &state.uploads {
            assert_eq!(entry.status == UploadStatus::Error, entry.error_message.is_some());
            assert_eq!(entry.is_terminal(), entry.completed_at.is_some());
        }
    }

    #[test]
    fn test_enqueue_prepends() {
        let fx = fixture();
        let first = fx.store.enqueue(file("a.png"));
        let batch = fx.store.enqueue_many(vec![file("b.png"), file("c.png")]);

        let state = fx.store.snapshot();
        assert_eq!(state.uploads.len(), 3);
        let order: Vec<_> = state.uploads.iter().map(|entry| entry.id).collect();
        assert_eq!(order, vec![batch[0], batch[1], first]);

        for entry in &state.uploads {
            assert_eq!(entry.status, UploadStatus::Pending);
            assert_eq!(entry.progress, 0);
            assert!(entry.backend_job_id.is_none());
        }

        // 认领顺序与入队顺序一致
        assert_eq!(fx.store.pending_ids(), vec![first, batch[0], batch[1]]);
        assert_invariants(&state);
    }

    #[test]
    fn test_status_transitions() {
        let fx = fixture();
        let id = fx.store.enqueue(file("a.png"));

        fx.store.set_status(id, UploadStatus::Uploading, Some(10)).unwrap();
        assert_eq!(fx.store.bump_progress(id, 10, 90), Some(20));

        // 进度参数缺省时保持不变
        fx.store.set_status(id, UploadStatus::Uploading, None).unwrap();
        assert_eq!(fx.store.entry(id).unwrap().progress, 20);

        let result = fx.store.set_status(id, UploadStatus::Error, None);
        assert!(matches!(result, Err(QueueError::InvalidTransition { .. })));

        fx.store.set_error(id, "Image is too blurry").unwrap();
        let entry = fx.store.entry(id).unwrap();
        assert_eq!(entry.status, UploadStatus::Error);
        assert_eq!(entry.error_message.as_deref(), Some("Image is too blurry"));
        assert!(entry.completed_at.is_some());

        let result = fx.store.set_status(id, UploadStatus::Pending, None);
        assert!(matches!(result, Err(QueueError::InvalidTransition { .. })));
        assert_invariants(&fx.store.snapshot());
    }

    #[test]
    fn test_update_fields_keeps_upload_progress_monotonic() {
        let fx = fixture();
        let id = fx.store.enqueue(file("a.png"));
        fx.store.set_status(id, UploadStatus::Uploading, Some(40)).unwrap();

        fx.store
            .update_fields(id, EntryPatch { progress: Some(20), ..Default::default() })
            .unwrap();
        assert_eq!(fx.store.entry(id).unwrap().progress, 40);

        fx.store
            .update_fields(id, EntryPatch { progress: Some(60), ..Default::default() })
            .unwrap();
        let entry = fx.store.entry(id).unwrap();
        assert_eq!(entry.progress, 60);
        // 只有 begin_processing 会写入任务 id
        assert!(entry.backend_job_id.is_none());

        let ack = SubmitAck {
            backend_job_id: 12,
            message: "accepted".to_string(),
            status_url: None,
        };
        fx.store.begin_processing(id, &ack).unwrap();
        fx.store
            .update_fields(id, EntryPatch { progress: Some(0), ..Default::default() })
            .unwrap();
        let entry = fx.store.entry(id).unwrap();
        assert_eq!(entry.progress, 0);
        assert_eq!(entry.backend_job_id, Some(12));
    }

    #[test]
    fn test_bump_progress_stops_at_cap_and_outside_uploading() {
        let fx = fixture();
        let id = fx.store.enqueue(file("a.png"));
        assert_eq!(fx.store.bump_progress(id, 10, 90), None);

        fx.store.set_status(id, UploadStatus::Uploading, Some(80)).unwrap();
        assert_eq!(fx.store.bump_progress(id, 15, 90), Some(90));
        assert_eq!(fx.store.bump_progress(id, 15, 90), None);

        let ack = SubmitAck {
            backend_job_id: 9,
            message: "accepted".to_string(),
            status_url: None,
        };
        fx.store.begin_processing(id, &ack).unwrap();
        let entry = fx.store.entry(id).unwrap();
        assert_eq!(entry.status, UploadStatus::Processing);
        assert_eq!(entry.progress, 0);
        assert_eq!(entry.backend_job_id, Some(9));
        assert_eq!(fx.store.bump_progress(id, 10, 90), None);
    }

    #[tokio::test]
    async fn test_set_result_appends_summary_once() {
        let fx = fixture();
        let mut events = fx.store.subscribe();
        let id = fx.store.enqueue(file("lunch.png"));
        fx.store.set_status(id, UploadStatus::Uploading, Some(10)).unwrap();

        fx.store.set_result(id, outcome(42)).await.unwrap();
        let entry = fx.store.entry(id).unwrap();
        assert_eq!(entry.status, UploadStatus::Success);
        assert_eq!(entry.progress, 100);
        assert_eq!(entry.backend_job_id, Some(42));
        assert!(matches!(entry.result, Some(UploadResult::Final(_))));

        // 终态不可再次写入
        let again = fx.store.set_result(id, outcome(42)).await;
        assert!(matches!(again, Err(QueueError::InvalidTransition { .. })));

        fx.store
            .update_fields(id, EntryPatch { progress: Some(5), ..Default::default() })
            .unwrap();
        assert_eq!(fx.store.entry(id).unwrap().progress, 100);

        let history = fx.store.completed_uploads();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].backend_job_id, 42);
        assert_eq!(history[0].file_name, "lunch.png");
        assert_eq!(history[0].statistics.successful, 3);

        let persisted = fx.history.get(&scope_key(Some("ana@example.com"))).await.unwrap().unwrap();
        assert_eq!(persisted, history);

        assert_eq!(events.recv().await.unwrap(), QueueEvent::EntryAdded { upload_id: id });
        assert_invariants(&fx.store.snapshot());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_state() {
        let fx = fixture();
        fx.history.set_failing(true);

        let id = fx.store.enqueue(file("a.png"));
        fx.store.set_status(id, UploadStatus::Uploading, None).unwrap();
        fx.store.set_result(id, outcome(1)).await.unwrap();

        assert_eq!(fx.store.completed_uploads().len(), 1);
        assert!(fx.history.writes().is_empty());
    }

    #[test]
    fn test_clear_operations() {
        let fx = fixture();
        let ids = fx.store.enqueue_many(vec![file("a.png"), file("b.png"), file("c.png")]);
        fx.store.set_error(ids[0], "failed").unwrap();
        fx.store.set_status(ids[1], UploadStatus::Success, None).unwrap();

        assert_eq!(fx.store.clear_terminal(), 2);
        assert_eq!(fx.store.snapshot().uploads.len(), 1);

        fx.store.remove(ids[2]).unwrap();
        assert!(matches!(fx.store.remove(ids[2]), Err(QueueError::EntryNotFound(_))));

        fx.store.enqueue(file("d.png"));
        fx.store.clear_all();
        assert!(fx.store.snapshot().uploads.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_history_replaces_cache() {
        let fx = fixture();
        *fx.backend.page.lock() = Some(vec![history_item(2), history_item(1)]);

        let uploads = fx.store.fetch_history().await;
        assert_eq!(uploads.len(), 2);

        let state = fx.store.snapshot();
        assert!(!state.loading_history);
        assert!(state.history_error.is_none());
        assert_eq!(state.completed_uploads[0].backend_job_id, 2);

        let persisted = fx.history.get(&scope_key(Some("ana@example.com"))).await.unwrap().unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_history_falls_back_to_cache() {
        let fx = fixture();
        let key = scope_key(Some("ana@example.com"));
        let cached: Vec<CompletedUpload> = vec![history_item(7).into()];
        fx.history.set(&key, &cached).await.unwrap();

        let uploads = fx.store.fetch_history().await;
        assert_eq!(uploads, cached);

        let state = fx.store.snapshot();
        assert_eq!(state.completed_uploads, cached);
        assert_eq!(state.history_error.as_deref(), Some("History is unavailable"));
        assert!(!state.loading_history);
        assert_eq!(fx.history.get(&key).await.unwrap().unwrap(), cached);
    }

    #[tokio::test]
    async fn test_fetch_history_failure_keeps_memory_list() {
        let fx = fixture();
        let id = fx.store.enqueue(file("a.png"));
        fx.store.set_status(id, UploadStatus::Uploading, None).unwrap();
        fx.store.set_result(id, outcome(3)).await.unwrap();

        // 缓存读取失败时保留内存中的历史
        fx.history.set_failing(true);
        let uploads = fx.store.fetch_history().await;
        assert_eq!(uploads.len(), 1);
        assert!(fx.store.snapshot().history_error.is_some());
    }

    #[tokio::test]
    async fn test_update_upload_statistics() {
        let fx = fixture();
        let id = fx.store.enqueue(file("a.png"));
        fx.store.set_status(id, UploadStatus::Uploading, None).unwrap();
        fx.store.set_result(id, outcome(5)).await.unwrap();

        let statistics = JobStatistics {
            total_detected: 4,
            successful: 3,
            failed: 1,
            processing: 0,
        };
        assert!(fx.store.update_upload_statistics(5, statistics).await);
        assert!(!fx.store.update_upload_statistics(6, statistics).await);
        assert_eq!(fx.store.completed_uploads()[0].statistics, statistics);
    }

    #[tokio::test]
    async fn test_identity_switch_does_not_leak_history() {
        let fx = fixture();
        let id = fx.store.enqueue(file("a.png"));
        fx.store.set_status(id, UploadStatus::Uploading, None).unwrap();
        fx.store.set_result(id, outcome(11)).await.unwrap();

        fx.session.login("token-2", "bo@x.io");
        fx.store.reload_for_identity().await;
        assert!(fx.store.completed_uploads().is_empty());

        fx.session.login("token", "ana@example.com");
        fx.store.reload_for_identity().await;
        assert_eq!(fx.store.completed_uploads().len(), 1);

        fx.store.clear_all_data();
        let state = fx.store.snapshot();
        assert!(state.uploads.is_empty());
        assert!(state.completed_uploads.is_empty());
        assert!(state.history_error.is_none());
    }

    #[tokio::test]
    async fn test_clear_history_persists_empty_list() {
        let fx = fixture();
        let id = fx.store.enqueue(file("a.png"));
        fx.store.set_status(id, UploadStatus::Uploading, None).unwrap();
        fx.store.set_result(id, outcome(1)).await.unwrap();

        fx.store.clear_history().await;
        assert!(fx.store.completed_uploads().is_empty());
        let persisted = fx.history.get(&scope_key(Some("ana@example.com"))).await.unwrap();
        assert_eq!(persisted, Some(vec![]));
    }
}
