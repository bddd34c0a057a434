use std::collections::HashSet;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use crate::backend::Backend;
use crate::config::QueueConfig;
use super::poller::{PollRegistry, Poller};
use super::store::UploadStore;
use super::types::UploadId;
use super::worker::UploadWorker;

/// Marks an entry as owned by a running worker; released on drop
pub(crate) struct ActiveClaim {
    upload_id: UploadId,
    active: Arc<Mutex<HashSet<UploadId>>>,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.active.lock().remove(&self.upload_id);
    }
}

struct RunState {
    cancellation_token: CancellationToken,
    loop_handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<UploadStore>,
    backend: Arc<dyn Backend>,
    config: RwLock<QueueConfig>,
    run: Mutex<Option<RunState>>,
    active: Arc<Mutex<HashSet<UploadId>>>,
    pollers: Arc<PollRegistry>,
}

/// 队列处理器 - 认领待上传条目，限制并发，驱动每个条目的生命周期
#[derive(Clone)]
pub struct QueueProcessor {
    inner: Arc<Inner>,
}

impl QueueProcessor {
    pub fn new(store: Arc<UploadStore>, backend: Arc<dyn Backend>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                backend,
                config: RwLock::new(config.normalized()),
                run: Mutex::new(None),
                active: Arc::new(Mutex::new(HashSet::new())),
                pollers: Arc::new(PollRegistry::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<UploadStore> {
        &self.inner.store
    }

    /// Start the main loop. Calling it while running does nothing.
    pub fn start(&self) {
        let mut run = self.inner.run.lock();
        if run.is_some() {
            debug!("Queue processor already running");
            return;
        }

        let cancellation_token = CancellationToken::new();
        let loop_handle = tokio::spawn(Inner::run_loop(Arc::clone(&self.inner), cancellation_token.clone()));
        *run = Some(RunState {
            cancellation_token,
            loop_handle,
        });

        self.inner.store.set_processing(true);
        info!("Queue processor started");
    }

    /// Stop the main loop and cancel every poller. Safe to call repeatedly.
    pub async fn stop(&self) {
        let run = self.inner.run.lock().take();

        if let Some(run) = run {
            run.cancellation_token.cancel();
            let _ = run.loop_handle.await;
            info!("Queue processor stopped");
        }

        self.inner.pollers.cancel_all().await;
        self.inner.store.set_processing(false);
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.lock().is_some()
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        let concurrency = QueueConfig::clamp_concurrency(concurrency);
        self.inner.config.write().concurrency = concurrency;
        debug!("Concurrency set to {}", concurrency);
    }

    pub fn concurrency(&self) -> usize {
        self.inner.config.read().concurrency
    }

    /// Entries currently held by an upload worker
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Entries with a live polling loop
    pub fn poller_count(&self) -> usize {
        self.inner.pollers.len()
    }
}

impl Inner {
    async fn run_loop(self: Arc<Self>, cancellation_token: CancellationToken) {
        loop {
            self.resume_pollers(&cancellation_token);
            let claimed = self.claim_pending(&cancellation_token);

            let delay = {
                let config = self.config.read();
                if claimed == 0 { config.idle_delay } else { config.busy_delay }
            };

            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Poll acknowledged entries that have no running poller.
    ///
    /// Covers pollers cancelled by an earlier `stop()` and acks that came back
    /// after the processor had stopped.
    fn resume_pollers(&self, cancellation_token: &CancellationToken) {
        let jobs = self.store.processing_jobs();
        if jobs.is_empty() {
            return;
        }

        let config = self.config.read().clone();
        for (upload_id, backend_job_id) in jobs {
            if self.pollers.contains(upload_id) {
                continue;
            }
            let poller = Poller::new(
                upload_id,
                backend_job_id,
                Arc::clone(&self.store),
                Arc::clone(&self.backend),
                &config,
            );
            if self.pollers.launch(poller, cancellation_token) {
                info!("Resumed polling for upload {} (job {})", upload_id, backend_job_id);
            }
        }
    }

    /// Claim pending entries up to the free slots and spawn their workers.
    ///
    /// Claims are recorded before any worker is spawned, so the bound holds
    /// no matter how the workers get scheduled.
    fn claim_pending(self: &Arc<Self>, cancellation_token: &CancellationToken) -> usize {
        let config = self.config.read().clone();

        let claims: Vec<ActiveClaim> = {
            let mut active = self.active.lock();
            let slots = config.concurrency.saturating_sub(active.len());
            if slots == 0 {
                return 0;
            }

            let ids: Vec<UploadId> = self
                .store
                .pending_ids()
                .into_iter()
                .filter(|id| !active.contains(id))
                .take(slots)
                .collect();

            ids.into_iter()
                .map(|upload_id| {
                    active.insert(upload_id);
                    ActiveClaim {
                        upload_id,
                        active: Arc::clone(&self.active),
                    }
                })
                .collect()
        };

        let claimed = claims.len();
        for claim in claims {
            debug!("Claimed upload {}", claim.upload_id);
            let worker = UploadWorker {
                upload_id: claim.upload_id,
                store: Arc::clone(&self.store),
                backend: Arc::clone(&self.backend),
                config: config.clone(),
                pollers: Arc::clone(&self.pollers),
                cancellation_token: cancellation_token.clone(),
            };
            tokio::spawn(worker.run(claim));
        }

        claimed
    }
}
