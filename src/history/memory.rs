use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use parking_lot::Mutex;
use crate::queue::{CompletedUpload, QueueError, Result};
use super::HistoryStore;

/// 内存实现，用于测试和不需要落盘的会话
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: Mutex<HashMap<String, Vec<CompletedUpload>>>,
    failing: AtomicBool,
    writes: Mutex<Vec<String>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, to exercise the degraded paths
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Keys written so far, in order
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::persistence("history store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<CompletedUpload>>> {
        self.check()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, uploads: &[CompletedUpload]) -> Result<()> {
        self.check()?;
        self.entries.lock().insert(key.to_string(), uploads.to_vec());
        self.writes.lock().push(key.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }
}
