use embed_common::error::CommonError;

/// Errors that abort a re-embed run. Per-record failures are reported, not raised.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),
}
