use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown synchronization tool: {0}")]
    UnknownTool(String),

    #[error("Reference file not found: {}", .0.display())]
    MissingReference(PathBuf),

    #[error("Subtitle file not found: {}", .0.display())]
    MissingSubtitle(PathBuf),

    #[error("Neither the reference ({}) nor the subtitle ({}) exist", .reference.display(), .subtitle.display())]
    MissingInputs { reference: PathBuf, subtitle: PathBuf },

    #[error("Reference and subtitle are the same file: {}", .0.display())]
    IdenticalInputs(PathBuf),

    #[error("Subtitle conversion failed: {0}")]
    Conversion(String),

    #[error("Embedded subtitle extraction failed: {0}")]
    Extraction(String),

    #[error("Path rewrite failed: {0}")]
    PathRewrite(String),

    #[error("Backup failed: {0}")]
    Backup(String),

    #[error("Output would overwrite an input: {}", .0.display())]
    OutputConflict(PathBuf),

    #[error("Invalid value for option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("Failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Worker protocol error: {0}")]
    Worker(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Media processing error: {0}")]
    Media(String),
}

/// Coarse classification of failures, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Detected before anything is prepared or launched.
    Input,
    /// Raised while preparing files for the tool.
    Preparation,
    /// Raised while the tool runs or right after it exits.
    Execution,
    Internal,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::MissingReference(_)
            | SyncError::MissingSubtitle(_)
            | SyncError::MissingInputs { .. }
            | SyncError::IdenticalInputs(_) => ErrorKind::Input,
            SyncError::Conversion(_)
            | SyncError::Extraction(_)
            | SyncError::PathRewrite(_)
            | SyncError::Backup(_)
            | SyncError::OutputConflict(_)
            | SyncError::InvalidOption { .. } => ErrorKind::Preparation,
            SyncError::Spawn { .. } | SyncError::Worker(_) => ErrorKind::Execution,
            SyncError::Io(_)
            | SyncError::Json(_)
            | SyncError::Toml(_)
            | SyncError::Config(_)
            | SyncError::UnknownTool(_)
            | SyncError::Encoding(_)
            | SyncError::Media(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
