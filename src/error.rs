use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum JoinError {
    #[error("incorrectly formatted shard path: {0}")]
    #[diagnostic(help("shard paths must contain the release prefix and end with .jsonl.gz"))]
    InvalidShardPath(String),

    #[error("SciREX document {0} has no sections to derive a title from")]
    EmptyScirexDocument(String),

    #[error("failed to parse SciREX document: {0}")]
    ScirexParse(String),

    #[error("missing config file scirex-join.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid shard url template: {0}")]
    InvalidTemplate(String),

    #[error("metadata lookup failed: {0}")]
    LookupHttp(String),

    #[error("metadata lookup returned status {status}: {message}")]
    LookupStatus { status: u16, message: String },

    #[error("still rate limited after {attempts} retries for {id}")]
    RateLimitExhausted { id: String, attempts: u32 },

    #[error("metadata lookup for {id} exceeded its deadline")]
    LookupTimeout { id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("shard download failed: {0}")]
    DownloadHttp(String),

    #[error("shard download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("failed to read shard {shard_id}: {message}")]
    ShardRead { shard_id: u32, message: String },

    #[error("failed to decode cache {name}: {message}")]
    CacheDecode { name: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl JoinError {
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            JoinError::InvalidShardPath(_)
                | JoinError::EmptyScirexDocument(_)
                | JoinError::MissingConfig
                | JoinError::ConfigRead(_)
                | JoinError::ConfigParse(_)
                | JoinError::InvalidTemplate(_)
        )
    }
}
