use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("store is read-only")]
    ReadOnly,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("pack format error: {0}")]
    Format(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
