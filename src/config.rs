use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::queue::{QueueError, Result};

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;
/// tokio 的 interval 不接受零周期
pub const MIN_DELAY: Duration = Duration::from_millis(1);

// 用于序列化 Duration（毫秒）
fn serialize_millis<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// 队列处理器配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 最大并发上传数，限制在 [1, 10]
    pub concurrency: usize,
    /// 轮询间隔
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub poll_interval: Duration,
    /// 最大轮询次数，超过即超时
    pub max_polls: u32,
    /// 模拟进度的刷新间隔
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub progress_tick: Duration,
    pub progress_step: u8,
    pub progress_cap: u8,
    /// 没有可认领条目时的等待
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub idle_delay: Duration,
    /// 认领之后的短暂等待
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub busy_delay: Duration,
    pub history_page_size: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_interval: Duration::from_secs(2),
            max_polls: 120, // ~4 分钟
            progress_tick: Duration::from_millis(200),
            progress_step: 10,
            progress_cap: 90,
            idle_delay: Duration::from_millis(500),
            busy_delay: Duration::from_millis(100),
            history_page_size: 100,
        }
    }
}

impl QueueConfig {
    pub fn clamp_concurrency(concurrency: usize) -> usize {
        concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    /// Clamp every field into its usable range
    pub fn normalized(mut self) -> Self {
        self.concurrency = Self::clamp_concurrency(self.concurrency);
        self.progress_cap = self.progress_cap.min(99);
        self.progress_step = self.progress_step.max(1);
        self.max_polls = self.max_polls.max(1);
        self.poll_interval = self.poll_interval.max(MIN_DELAY);
        self.progress_tick = self.progress_tick.max(MIN_DELAY);
        self.idle_delay = self.idle_delay.max(MIN_DELAY);
        self.busy_delay = self.busy_delay.max(MIN_DELAY);
        self
    }
}

/// Settings for the command line binary
#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_history_dir() -> PathBuf {
    PathBuf::from(".receipt-queue")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000/api".to_string(),
            token: None,
            user_email: None,
            history_dir: default_history_dir(),
            queue: QueueConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(source: &str) -> Result<AppConfig> {
        let mut config: AppConfig = toml::from_str(source)
            .map_err(|err| QueueError::config(err.to_string()))?;
        config.queue = config.queue.normalized();
        Ok(config)
    }

    pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|err| QueueError::config(format!("Can't read {}: {}", path.display(), err)))?;
        Self::from_toml(&source)
    }

    /// Same as `load_config`, but a missing file yields the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_config(path)
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Ok(AppConfig::default())
        }
    }
}
