/// Error types shared by the embedding server and the re-embed job.
///
/// These errors cover the model lifecycle (construction and inference) and configuration
/// problems detected inside the shared library. Binary-specific errors are defined in each
/// crate and wrap `CommonError` via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("model unavailable: {0}")]
    ModelInit(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("config error: {0}")]
    Config(String),
}
