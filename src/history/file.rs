use std::path::PathBuf;
use async_trait::async_trait;
use crate::queue::{CompletedUpload, Result};
use super::HistoryStore;

/// 每个 scope key 一个 JSON 文件
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    dir: PathBuf,
}

impl FileHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// base64 keys may contain '/' and '+', which are not safe in file names
    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| match c {
                '/' => '_',
                '+' => '-',
                c if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<CompletedUpload>>> {
        let path = self.path_for(key);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let uploads: Vec<CompletedUpload> = serde_json::from_str(&data)?;
        tracing::debug!("Loaded {} completed uploads from {}", uploads.len(), path.display());

        Ok(Some(uploads))
    }

    async fn set(&self, key: &str, uploads: &[CompletedUpload]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let data = serde_json::to_string_pretty(uploads)?;

        // 先写临时文件再 rename，避免读到写了一半的文件
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!("Saved {} completed uploads to {}", uploads.len(), path.display());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
