use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::backend::{Backend, BackendJobId};
use crate::config::QueueConfig;
use super::errors::QueueError;
use super::store::UploadStore;
use super::types::{EntryPatch, FinalOutcome, ProcessingSnapshot, UploadId, UploadResult, UploadStatus};

pub const TIMEOUT_MESSAGE: &str = "Processing timed out. Check the Receipts page for status.";
pub const REMOTE_FAILURE_MESSAGE: &str = "Processing failed on the server.";

/// How a polling loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// 服务端完成（全部或部分成功）
    Finished,
    /// 服务端报告失败
    Failed,
    /// 超过最大轮询次数
    TimedOut,
    /// 处理器停止
    Cancelled,
    /// 条目被移除或已进入终态
    Abandoned,
}

struct PollHandle {
    generation: u64,
    token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// 每个 Processing 条目一个轮询任务，按条目 id 登记
#[derive(Default)]
pub(crate) struct PollRegistry {
    handles: Mutex<HashMap<UploadId, PollHandle>>,
    next_generation: AtomicU64,
}

impl PollRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn the polling loop for an entry. Refused once `parent` is cancelled.
    pub(crate) fn launch(self: &Arc<Self>, mut poller: Poller, parent: &CancellationToken) -> bool {
        let upload_id = poller.upload_id;
        let mut handles = self.handles.lock();

        // stop() 先取消根 token 再清空登记表，在锁内检查可以保证不会漏掉
        if parent.is_cancelled() {
            debug!("Not polling upload {}, processor stopped", upload_id);
            return false;
        }
        if handles.contains_key(&upload_id) {
            debug!("Upload {} is already being polled", upload_id);
            return false;
        }

        let token = parent.child_token();
        poller.token = token.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let registry = Arc::clone(self);
        let join_handle = tokio::spawn(async move {
            let outcome = poller.run().await;
            debug!("Polling for upload {} ended: {:?}", upload_id, outcome);
            registry.release(upload_id, generation);
        });

        handles.insert(upload_id, PollHandle { generation, token, join_handle });
        true
    }

    /// 只移除自己的登记，重启后同一条目可能已有新的轮询
    fn release(&self, upload_id: UploadId, generation: u64) {
        let mut handles = self.handles.lock();
        if handles.get(&upload_id).is_some_and(|handle| handle.generation == generation) {
            handles.remove(&upload_id);
        }
    }

    /// Cancel every registered poller and wait for them to exit
    pub(crate) async fn cancel_all(&self) {
        let handles: Vec<PollHandle> = self.handles.lock().drain().map(|(_, handle)| handle).collect();
        if handles.is_empty() {
            return;
        }

        info!("Cancelling {} pollers", handles.len());
        let joins: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                handle.token.cancel();
                handle.join_handle
            })
            .collect();

        // 不 abort：正在写入结果的轮询要先把 set_result 做完
        for result in futures::future::join_all(joins).await {
            if let Err(err) = result {
                warn!("Poller task failed: {}", err);
            }
        }
    }

    pub(crate) fn contains(&self, upload_id: UploadId) -> bool {
        self.handles.lock().contains_key(&upload_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

/// Polls one backend job until it reaches a verdict or the poll cap is exceeded
pub(crate) struct Poller {
    pub(crate) upload_id: UploadId,
    pub(crate) backend_job_id: BackendJobId,
    pub(crate) store: Arc<UploadStore>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) poll_interval: Duration,
    pub(crate) max_polls: u32,
    pub(crate) token: CancellationToken,
}

impl Poller {
    pub(crate) fn new(
        upload_id: UploadId,
        backend_job_id: BackendJobId,
        store: Arc<UploadStore>,
        backend: Arc<dyn Backend>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            upload_id,
            backend_job_id,
            store,
            backend,
            poll_interval: config.poll_interval,
            max_polls: config.max_polls,
            // launch() 会换成父 token 的子 token
            token: CancellationToken::new(),
        }
    }

    pub(crate) async fn run(self) -> PollOutcome {
        // 第一次 tick 立即触发
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_count: u32 = 0;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return PollOutcome::Cancelled,
                _ = ticker.tick() => {}
            }

            if !self.still_owner() {
                return PollOutcome::Abandoned;
            }

            poll_count += 1;
            if poll_count > self.max_polls {
                warn!("Upload {} still processing after {} polls", self.upload_id, self.max_polls);
                return match self.store.set_error(self.upload_id, TIMEOUT_MESSAGE) {
                    Ok(()) => PollOutcome::TimedOut,
                    Err(_) => PollOutcome::Abandoned,
                };
            }

            let response = tokio::select! {
                _ = self.token.cancelled() => return PollOutcome::Cancelled,
                response = self.backend.poll_status(self.backend_job_id) => response,
            };

            let report = match response {
                Ok(report) => report,
                Err(err) => {
                    warn!(
                        "Poll {} for backend job {} failed, retrying: {}",
                        poll_count, self.backend_job_id, err
                    );
                    continue;
                }
            };

            if report.status.is_processing() {
                debug!(
                    "Backend job {} still processing ({}/{} detected)",
                    self.backend_job_id, report.statistics.successful, report.statistics.total_detected
                );
                let patch = EntryPatch::result(UploadResult::Snapshot(ProcessingSnapshot::from_report(&report)));
                if let Err(err) = self.store.update_fields(self.upload_id, patch) {
                    debug!("Stop polling upload {}: {}", self.upload_id, err);
                    return PollOutcome::Abandoned;
                }
                continue;
            }

            if report.status.is_failed() {
                let message = report
                    .message
                    .clone()
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| REMOTE_FAILURE_MESSAGE.to_string());
                return match self.store.set_error(self.upload_id, message) {
                    Ok(()) => PollOutcome::Failed,
                    Err(_) => PollOutcome::Abandoned,
                };
            }

            return match self.store.set_result(self.upload_id, FinalOutcome::from_report(report)).await {
                Ok(()) => PollOutcome::Finished,
                Err(QueueError::EntryNotFound(_)) | Err(QueueError::InvalidTransition { .. }) => PollOutcome::Abandoned,
                Err(err) => {
                    warn!("Failed to record result for upload {}: {}", self.upload_id, err);
                    PollOutcome::Abandoned
                }
            };
        }
    }

    /// The entry still exists and is waiting on this job
    fn still_owner(&self) -> bool {
        match self.store.entry(self.upload_id) {
            Some(entry) => {
                entry.status == UploadStatus::Processing && entry.backend_job_id == Some(self.backend_job_id)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use async_trait::async_trait;
    use crate::backend::{
        BackendError,
        HistoryPage,
        HistoryQuery,
        JobStatistics,
        RemoteStatus,
        StatusReport,
        SubmitAck,
        UploadFile,
    };
    use crate::backend::types::ReceiptBuckets;
    use crate::history::MemoryHistoryStore;
    use crate::session::StaticSession;

    /// Answers `Processing` until `finish_after` polls, then `verdict`
    struct ScriptedBackend {
        polls: AtomicU32,
        finish_after: u32,
        verdict: RemoteStatus,
        fail_every_other: bool,
        poll_delay: Duration,
    }

    impl ScriptedBackend {
        fn new(finish_after: u32, verdict: RemoteStatus) -> Self {
            Self {
                polls: AtomicU32::new(0),
                finish_after,
                verdict,
                fail_every_other: false,
                poll_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn submit(&self, _file: &UploadFile) -> crate::backend::Result<SubmitAck> {
            Err(BackendError::InvalidRequest("not scripted".to_string()))
        }

        async fn poll_status(&self, backend_job_id: BackendJobId) -> crate::backend::Result<StatusReport> {
            let count = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.poll_delay.is_zero() {
                tokio::time::sleep(self.poll_delay).await;
            }
            if self.fail_every_other && count % 2 == 1 {
                return Err(BackendError::server_error(502, "Bad gateway"));
            }

            let status = if count > self.finish_after {
                self.verdict.clone()
            } else {
                RemoteStatus::Processing
            };

            Ok(StatusReport {
                backend_job_id,
                status,
                statistics: JobStatistics {
                    total_detected: 2,
                    successful: 2,
                    failed: 0,
                    processing: 0,
                },
                message: None,
                receipts: ReceiptBuckets::default(),
                errors: None,
            })
        }

        async fn list_history(&self, _query: &HistoryQuery) -> crate::backend::Result<HistoryPage> {
            Err(BackendError::InvalidRequest("not scripted".to_string()))
        }
    }

    fn processing_entry(backend: Arc<ScriptedBackend>) -> (Arc<UploadStore>, UploadId) {
        let store = Arc::new(UploadStore::new(
            backend,
            Arc::new(MemoryHistoryStore::new()),
            Arc::new(StaticSession::anonymous()),
            100,
        ));
        let id = store.enqueue(UploadFile::new("a.png", vec![0u8; 4]));
        store.set_status(id, UploadStatus::Uploading, Some(10)).unwrap();
        let ack = SubmitAck {
            backend_job_id: 77,
            message: "accepted".to_string(),
            status_url: None,
        };
        store.begin_processing(id, &ack).unwrap();
        (store, id)
    }

    fn poller(store: Arc<UploadStore>, backend: Arc<ScriptedBackend>, id: UploadId, max_polls: u32) -> Poller {
        Poller {
            upload_id: id,
            backend_job_id: 77,
            store,
            backend,
            poll_interval: Duration::from_secs(2),
            max_polls,
            token: CancellationToken::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_consume_polls() {
        let backend = Arc::new(ScriptedBackend {
            fail_every_other: true,
            ..ScriptedBackend::new(u32::MAX, RemoteStatus::Succeeded)
        });
        let (store, id) = processing_entry(backend.clone());

        let outcome = poller(store.clone(), backend.clone(), id, 6).run().await;
        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(backend.polls.load(Ordering::SeqCst), 6);

        let entry = store.entry(id).unwrap();
        assert_eq!(entry.status, UploadStatus::Error);
        assert_eq!(entry.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_uses_fallback_message() {
        let backend = Arc::new(ScriptedBackend::new(1, RemoteStatus::Failed));
        let (store, id) = processing_entry(backend.clone());

        let outcome = poller(store.clone(), backend.clone(), id, 120).run().await;
        assert_eq!(outcome, PollOutcome::Failed);

        let entry = store.entry(id).unwrap();
        assert_eq!(entry.error_message.as_deref(), Some(REMOTE_FAILURE_MESSAGE));
        assert_eq!(entry.backend_job_id, Some(77));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success_records_result() {
        let backend = Arc::new(ScriptedBackend::new(2, RemoteStatus::PartiallySucceeded));
        let (store, id) = processing_entry(backend.clone());

        let outcome = poller(store.clone(), backend.clone(), id, 120).run().await;
        assert_eq!(outcome, PollOutcome::Finished);
        assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
        assert_eq!(store.entry(id).unwrap().status, UploadStatus::Success);
        assert_eq!(store.completed_uploads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_entry_stops_polling() {
        let backend = Arc::new(ScriptedBackend::new(u32::MAX, RemoteStatus::Succeeded));
        let (store, id) = processing_entry(backend.clone());
        store.remove(id).unwrap();

        let outcome = poller(store, backend.clone(), id, 120).run().await;
        assert_eq!(outcome, PollOutcome::Abandoned);
        assert_eq!(backend.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_cancel_all() {
        let backend = Arc::new(ScriptedBackend::new(u32::MAX, RemoteStatus::Succeeded));
        let (store, id) = processing_entry(backend.clone());
        let registry = Arc::new(PollRegistry::new());
        let root = CancellationToken::new();

        assert!(registry.launch(poller(store.clone(), backend.clone(), id, 120), &root));
        assert!(!registry.launch(poller(store.clone(), backend.clone(), id, 120), &root));
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        root.cancel();
        registry.cancel_all().await;
        assert_eq!(registry.len(), 0);

        // 停止后不再接受新的轮询
        assert!(!registry.launch(poller(store.clone(), backend, id, 120), &root));
        assert_eq!(store.entry(id).unwrap().status, UploadStatus::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_interrupts_in_flight_poll() {
        let backend = Arc::new(ScriptedBackend {
            poll_delay: Duration::from_secs(600),
            ..ScriptedBackend::new(0, RemoteStatus::Succeeded)
        });
        let (store, id) = processing_entry(backend.clone());
        let registry = Arc::new(PollRegistry::new());
        let root = CancellationToken::new();

        assert!(registry.launch(poller(store.clone(), backend.clone(), id, 120), &root));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.polls.load(Ordering::SeqCst), 1);

        let started = tokio::time::Instant::now();
        root.cancel();
        registry.cancel_all().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        // 请求被丢弃，结果不会写入
        let entry = store.entry(id).unwrap();
        assert_eq!(entry.status, UploadStatus::Processing);
        assert!(store.completed_uploads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_after_cancel_keeps_new_handle() {
        let backend = Arc::new(ScriptedBackend::new(u32::MAX, RemoteStatus::Succeeded));
        let (store, id) = processing_entry(backend.clone());
        let registry = Arc::new(PollRegistry::new());

        let first = CancellationToken::new();
        assert!(registry.launch(poller(store.clone(), backend.clone(), id, 120), &first));
        first.cancel();
        registry.cancel_all().await;
        assert!(!registry.contains(id));

        let second = CancellationToken::new();
        assert!(registry.launch(poller(store.clone(), backend.clone(), id, 120), &second));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(registry.contains(id));

        second.cancel();
        registry.cancel_all().await;
    }
}
