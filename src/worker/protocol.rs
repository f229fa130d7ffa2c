use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::progress::ProgressEvent;

/// One JSON line written by the worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress { text: String, overwrite: bool },
    Error { message: String },
    Finished { exit_code: i32 },
}

impl WorkerMessage {
    pub fn progress(event: &ProgressEvent) -> Self {
        WorkerMessage::Progress {
            text: event.text.clone(),
            overwrite: event.is_overwrite,
        }
    }

    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| SyncError::Worker(format!("unreadable message '{}': {}", line.trim(), e)))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, WorkerMessage::Finished { .. })
    }
}
