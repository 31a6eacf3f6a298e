use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
