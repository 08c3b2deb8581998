use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache Pool Error: {0}")]
    DbPool(#[from] r2d2::Error),

    #[error("Cache Database Error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image Error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Decode Failed: {0}")]
    Decode(String),

    #[error("Model Load Failed: {0}")]
    ModelLoad(String),

    #[error("Inference Failed: {0}")]
    Inference(String),

    #[error("Cache Unavailable: {0}")]
    Cache(String),

    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Path Error: {0}")]
    Path(String),

    #[error("Initialization Failed: {0}")]
    Init(String),
}

/// Failure inside the perceptual hashing step. Never surfaces past the
/// orchestrator, which swaps in a volatile fingerprint instead.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image has no pixels")]
    EmptyImage,
}
