// ⚠️ Error Taxonomy - what can go wrong in a pipeline run
//
// Data-quality problems are NOT errors: they become inconsistency flags on
// the record. Only acquisition, decoding and structural failures live here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network failure, bad status or truncated body. Retried by the fetcher.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// None of the configured text encodings could decode the file.
    #[error("could not decode {path} with any of [{tried}]")]
    Decoding { path: String, tried: String },

    /// Required registry column missing or no join key available. Fatal.
    #[error("structural error: {0}")]
    Structural(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl PipelineError {
    pub fn transport(url: &str, message: impl Into<String>) -> Self {
        PipelineError::Transport {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Transient failures are the only ones worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transport { .. } | PipelineError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
