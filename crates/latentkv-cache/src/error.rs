use latentkv_engine::EngineError;
use latentkv_kv::KvError;

/// Errors from pooling, lookup and alignment.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("slot {index} out of range for a pool of {capacity} slots")]
    IndexOutOfRange { index: usize, capacity: usize },
    #[error("slot {index} has never been written")]
    UnpopulatedSlot { index: usize },
    #[error("environment {env} out of range for {env_count} environments")]
    EnvOutOfRange { env: usize, env_count: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("kv cache error: {0}")]
    Kv(#[from] KvError),
    #[error("model error: {0}")]
    Engine(#[from] EngineError),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;
