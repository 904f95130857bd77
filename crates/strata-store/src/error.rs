use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record set at {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },
    #[error("failed to encode record: {0}")]
    Encode(String),
}
