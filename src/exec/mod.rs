// Tool execution backends
//
// - process: standalone executables (ProcessRunner)
// - worker: module tools hosted in an isolated worker process (ModuleWorker)
// - cancel: process tree termination (CancellationController)

pub mod cancel;
pub mod process;
pub mod worker;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use cancel::CancellationController;
pub use process::ProcessRunner;
pub use worker::ModuleWorker;

use crate::config::Config;
use crate::error::Result;
use crate::events::JobObserver;
use crate::tools::{ToolDescriptor, ToolKind};

/// A fully resolved tool run
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: Arc<ToolDescriptor>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(tool: Arc<ToolDescriptor>, args: Vec<String>) -> Self {
        Self {
            tool,
            args,
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

/// How a tool run ended; success semantics are decided by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Exited { exit_code: i32 },
    Cancelled,
}

/// Main trait for running a tool and streaming its output
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Run to completion or cancellation, forwarding output to `observer`.
    ///
    /// Failing to start the tool is an error; a non-zero exit is not.
    async fn execute(
        &self,
        invocation: &Invocation,
        observer: &dyn JobObserver,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome>;
}

/// Factory for creating the backend matching a tool kind
pub struct BackendFactory;

impl BackendFactory {
    pub fn create_backend(kind: ToolKind, config: &Config) -> Box<dyn ToolBackend> {
        let controller = CancellationController::new(config.process.grace_period());
        match kind {
            ToolKind::Executable => Box::new(ProcessRunner::new(config.process.clone(), controller)),
            ToolKind::Module => Box::new(
                ModuleWorker::new(config.worker.clone(), controller)
                    .with_columns(config.process.terminal_columns)
                    .with_chunk_size(config.process.read_chunk_size),
            ),
        }
    }
}
