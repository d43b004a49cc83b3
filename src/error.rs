use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrainsetError>;

#[derive(Debug, Error)]
pub enum StrainsetError {
    #[error("Input error: {0}")]
    Input(String),
    #[error("Generator error: {0}")]
    Generator(String),
    #[error("Decimation error: {0}")]
    Decimation(String),
    #[error("Mesher error: {0}")]
    Mesher(String),
    #[error("Solver error: {0}")]
    Solver(String),
    #[error("Post Processor error: {0}")]
    PostProcessor(String),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StrainsetError {
    /// Wraps an io error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> StrainsetError {
        StrainsetError::Io {
            path: path.into(),
            source,
        }
    }
}
