use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use crate::backend::Backend;
use crate::config::QueueConfig;
use super::poller::{PollRegistry, Poller};
use super::processor::ActiveClaim;
use super::store::UploadStore;
use super::types::{UploadId, UploadStatus};

/// 单个条目的上传任务：提交文件，成功后交给轮询
pub(crate) struct UploadWorker {
    pub(crate) upload_id: UploadId,
    pub(crate) store: Arc<UploadStore>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: QueueConfig,
    pub(crate) pollers: Arc<PollRegistry>,
    /// 处理器的运行 token
    pub(crate) cancellation_token: CancellationToken,
}

impl UploadWorker {
    /// The claim is held for the whole submission and released on return
    pub(crate) async fn run(self, claim: ActiveClaim) {
        let upload_id = self.upload_id;

        if let Err(err) = self.store.set_status(upload_id, UploadStatus::Uploading, Some(10)) {
            warn!("Upload {} can't start: {}", upload_id, err);
            return;
        }

        let file = match self.store.entry(upload_id) {
            Some(entry) => entry.file,
            None => return,
        };

        let ticker_token = self.cancellation_token.child_token();
        let ticker = tokio::spawn(tick_progress(
            Arc::clone(&self.store),
            upload_id,
            self.config.progress_tick,
            self.config.progress_step,
            self.config.progress_cap,
            ticker_token.clone(),
        ));

        debug!("Submitting {} ({} bytes)", file.name, file.len());
        let result = self.backend.submit(&file).await;

        ticker_token.cancel();
        let _ = ticker.await;

        // 即使处理器已经停止也要记录结果，否则条目会一直停在 Uploading。
        // 条目被移除时 store 返回 EntryNotFound，不会被重新创建。
        match result {
            Ok(ack) => {
                if let Err(err) = self.store.begin_processing(upload_id, &ack) {
                    warn!("Upload {} accepted but no longer tracked: {}", upload_id, err);
                    return;
                }

                let poller = Poller::new(
                    upload_id,
                    ack.backend_job_id,
                    Arc::clone(&self.store),
                    Arc::clone(&self.backend),
                    &self.config,
                );
                if !self.pollers.launch(poller, &self.cancellation_token) {
                    debug!("Upload {} will be polled once the processor restarts", upload_id);
                }
            }
            Err(err) => {
                error!("Failed to submit {}: {}", file.name, err);
                if let Err(err) = self.store.set_error(upload_id, err.user_message()) {
                    debug!("Upload {} already gone: {}", upload_id, err);
                }
            }
        }

        drop(claim);
    }
}

/// Synthetic progress while the submission is in flight
async fn tick_progress(
    store: Arc<UploadStore>,
    upload_id: UploadId,
    period: Duration,
    step: u8,
    cap: u8,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if store.bump_progress(upload_id, step, cap).is_none() {
                    break;
                }
            }
        }
    }
}
