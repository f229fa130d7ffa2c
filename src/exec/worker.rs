use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{apply_process_environment, exit_code_of, forward_event, stop_child};
use super::{CancellationController, ExecutionOutcome, Invocation, ToolBackend};
use crate::config::WorkerConfig;
use crate::error::{Result, SyncError};
use crate::events::JobObserver;
use crate::progress::ProgressEvent;
use crate::worker::WorkerMessage;

/// Runs Python entry-point tools inside an isolated worker process.
///
/// The worker is this crate's binary started with the hidden `worker`
/// subcommand; it speaks [`WorkerMessage`] JSON lines on stdout.
pub struct ModuleWorker {
    config: WorkerConfig,
    controller: CancellationController,
    terminal_columns: u16,
    read_chunk_size: usize,
}

impl ModuleWorker {
    pub fn new(config: WorkerConfig, controller: CancellationController) -> Self {
        Self {
            config,
            controller,
            terminal_columns: 80,
            read_chunk_size: 1024,
        }
    }

    pub fn with_columns(mut self, columns: u16) -> Self {
        self.terminal_columns = columns;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.read_chunk_size = chunk_size;
        self
    }

    fn launcher(&self) -> Result<PathBuf> {
        match &self.config.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| SyncError::Spawn {
                program: "worker".to_string(),
                reason: format!("cannot locate the current executable: {}", e),
            }),
        }
    }

    fn command(&self, program: &PathBuf, module: &str, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&self.config.program_args)
            .arg("worker")
            .arg("--module")
            .arg(module)
            .arg("--python")
            .arg(&self.config.python)
            .arg("--columns")
            .arg(self.terminal_columns.to_string())
            .arg("--chunk-size")
            .arg(self.read_chunk_size.to_string());
        if tracing::enabled!(tracing::Level::DEBUG) {
            cmd.arg("--verbose");
        }
        cmd.arg("--").args(&invocation.args);
        apply_process_environment(&mut cmd, self.terminal_columns);
        // stdout carries the protocol, stderr the worker's own log
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn finish(&self, child: &mut Child, cancel: &CancellationToken) -> Result<Option<i32>> {
        tokio::select! {
            status = child.wait() => Ok(Some(exit_code_of(&status?))),
            _ = cancel.cancelled() => {
                stop_child(child, &self.controller).await;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ToolBackend for ModuleWorker {
    async fn execute(
        &self,
        invocation: &Invocation,
        observer: &dyn JobObserver,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let tool = &invocation.tool;
        let module = tool.module.as_deref().ok_or_else(|| SyncError::Spawn {
            program: tool.name.clone(),
            reason: "no module entry point configured".to_string(),
        })?;
        let program = self.launcher()?;

        info!("Starting worker for {} ({}) {:?}", tool.name, module, invocation.args);

        let mut child = self
            .command(&program, module, invocation)
            .spawn()
            .map_err(|e| SyncError::Spawn {
                program: program.display().to_string(),
                reason: e.to_string(),
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            stop_child(&mut child, &self.controller).await;
            return Err(SyncError::Worker("worker pipes unavailable".to_string()));
        };

        // the worker's own diagnostics
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("worker: {}", line);
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut reported = None;

        loop {
            if cancel.is_cancelled() {
                info!("Cancelling worker for {}", tool.name);
                stop_child(&mut child, &self.controller).await;
                return Ok(ExecutionOutcome::Cancelled);
            }

            let line = match tokio::time::timeout(self.config.poll_interval(), lines.next_line()).await {
                // poll interval elapsed, check cancellation again
                Err(_) => continue,
                Ok(line) => line?,
            };
            let Some(line) = line else {
                break;
            };

            match WorkerMessage::parse_line(&line) {
                Ok(WorkerMessage::Progress { text, overwrite }) => {
                    forward_event(observer, &ProgressEvent::from_segment(&text, overwrite));
                }
                Ok(WorkerMessage::Error { message }) => {
                    warn!("{} reported: {}", tool.name, message);
                    observer.on_error(&message);
                }
                Ok(WorkerMessage::Finished { exit_code }) => {
                    reported = Some(exit_code);
                    break;
                }
                Err(_) if line.trim().is_empty() => {}
                Err(e) => debug!("{}", e),
            }
        }

        let Some(status) = self.finish(&mut child, cancel).await? else {
            return Ok(ExecutionOutcome::Cancelled);
        };

        match reported {
            Some(exit_code) => {
                info!("{} finished with code {}", tool.name, exit_code);
                Ok(ExecutionOutcome::Exited { exit_code })
            }
            None => Err(SyncError::Worker(format!(
                "worker for {} exited with code {} without reporting a result",
                tool.name, status
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::{ChannelObserver, JobEvent, NullObserver};
    use crate::tools::{ExecutablePaths, ToolDescriptor, ToolKind};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn invocation() -> Invocation {
        let tool = ToolDescriptor {
            name: "fake-module".to_string(),
            kind: ToolKind::Module,
            executable: ExecutablePaths::default(),
            module: Some("fake.tool:main".to_string()),
            command: Vec::new(),
            options: Vec::new(),
            supports_subtitle_as_reference: true,
            supported_formats: vec!["srt".to_string()],
            unsupported_path_chars: Vec::new(),
        };
        Invocation::new(Arc::new(tool), vec!["ref.srt".to_string()])
    }

    // `/bin/sh -c <script>` stands in for the worker subcommand
    fn worker(script: &str) -> ModuleWorker {
        let config = WorkerConfig {
            program: Some(PathBuf::from("/bin/sh")),
            program_args: vec!["-c".to_string(), script.to_string()],
            poll_interval_ms: 20,
            ..WorkerConfig::default()
        };
        ModuleWorker::new(config, CancellationController::new(Duration::from_millis(500)))
    }

    #[test]
    fn worker_command_carries_read_settings() {
        let worker = worker("true").with_columns(120).with_chunk_size(64);
        let cmd = worker.command(&PathBuf::from("/bin/sh"), "fake.tool:main", &invocation());
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let value_of = |flag: &str| {
            let at = args.iter().position(|a| a == flag)?;
            args.get(at + 1).cloned()
        };

        assert_eq!(value_of("--module").as_deref(), Some("fake.tool:main"));
        assert_eq!(value_of("--columns").as_deref(), Some("120"));
        assert_eq!(value_of("--chunk-size").as_deref(), Some("64"));
        assert_eq!(&args[args.len() - 2..], ["--", "ref.srt"]);
    }

    #[tokio::test]
    async fn forwards_messages_until_finished() {
        let script = r#"
            echo '{"kind":"progress","text":"Extracting speech 40%","overwrite":true}'
            echo 'not a protocol line'
            echo '{"kind":"error","message":"ValueError: bad"}'
            echo '{"kind":"finished","exit_code":2}'
        "#;
        let (observer, mut rx) = ChannelObserver::new();
        let outcome = worker(script)
            .execute(&invocation(), &observer, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Exited { exit_code: 2 });

        assert_eq!(
            rx.try_recv().unwrap(),
            JobEvent::Progress { text: "Extracting speech 40%".to_string(), is_overwrite: true }
        );
        assert_eq!(rx.try_recv().unwrap(), JobEvent::Percent(40.0));
        assert_eq!(rx.try_recv().unwrap(), JobEvent::Error("ValueError: bad".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn silent_exit_is_a_worker_error() {
        let err = worker("echo '{\"kind\":\"progress\",\"text\":\"x\",\"overwrite\":false}'")
            .execute(&invocation(), &NullObserver, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Worker(_)));
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_polls() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = worker("sleep 30")
            .execute(&invocation(), &NullObserver, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn module_tool_needs_an_entry_point() {
        let mut invocation = invocation();
        let mut tool = (*invocation.tool).clone();
        tool.module = None;
        invocation.tool = Arc::new(tool);

        let err = worker("true")
            .execute(&invocation, &NullObserver, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Spawn { .. }));
    }
}
