mod file;
mod memory;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crate::queue::{CompletedUpload, Result};

pub use file::FileHistoryStore;
pub use memory::MemoryHistoryStore;

/// Key used before history was scoped per user
pub const LEGACY_HISTORY_KEY: &str = "receipt-completed-uploads";
pub const HISTORY_KEY_PREFIX: &str = "receipt-uploads-";

/// 已完成上传的持久化存储 - 按 scope key 存取
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load the list stored under `key`, newest first
    async fn get(&self, key: &str) -> Result<Option<Vec<CompletedUpload>>>;

    /// Replace the list stored under `key`
    async fn set(&self, key: &str, uploads: &[CompletedUpload]) -> Result<()>;

    /// Drop whatever is stored under `key`
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Derive the storage key for an identity.
///
/// The email is base64 encoded with the padding stripped, so the raw address never
/// shows up as a key. Without an identity the legacy shared key is used.
pub fn scope_key(user_email: Option<&str>) -> String {
    match user_email {
        Some(email) if !email.is_empty() => {
            let encoded = STANDARD.encode(email);
            format!("{}{}", HISTORY_KEY_PREFIX, encoded.trim_end_matches('='))
        }
        _ => {
            tracing::warn!("No active identity, using the shared history key");
            LEGACY_HISTORY_KEY.to_string()
        }
    }
}

/// Copy history saved under the legacy shared key to the user's own key.
///
/// Nothing happens if the legacy key is empty or the user already has history.
/// The legacy key is left in place.
pub async fn migrate_legacy_history(store: &dyn HistoryStore, user_email: &str) -> Result<bool> {
    let legacy = match store.get(LEGACY_HISTORY_KEY).await? {
        Some(uploads) => uploads,
        None => {
            tracing::debug!("No legacy history to migrate");
            return Ok(false);
        }
    };

    let key = scope_key(Some(user_email));
    if store.get(&key).await?.is_some() {
        tracing::debug!("User already has scoped history, skipping migration");
        return Ok(false);
    }

    store.set(&key, &legacy).await?;
    tracing::info!("Migrated {} legacy history entries to {}", legacy.len(), key);

    Ok(true)
}

pub async fn clear_legacy_history(store: &dyn HistoryStore) -> Result<()> {
    store.remove(LEGACY_HISTORY_KEY).await?;
    tracing::info!("Cleared legacy history");
    Ok(())
}
