use async_trait::async_trait;
use std::io::{ErrorKind, PipeReader, Read};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CancellationController, ExecutionOutcome, Invocation, ToolBackend};
use crate::config::ProcessConfig;
use crate::error::{Result, SyncError};
use crate::events::JobObserver;
use crate::progress::{OutputStreamParser, ProgressEvent};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Runs executable tools with merged output and a plain, narrow terminal
pub struct ProcessRunner {
    config: ProcessConfig,
    controller: CancellationController,
}

impl ProcessRunner {
    pub fn new(config: ProcessConfig, controller: CancellationController) -> Self {
        Self { config, controller }
    }

    fn command(&self, program: &str, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&invocation.args);
        apply_process_environment(&mut cmd, self.config.terminal_columns);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Terminal environment and platform flags shared by every spawned tool
pub(crate) fn apply_process_environment(cmd: &mut Command, columns: u16) {
    cmd.stdin(Stdio::null())
        .kill_on_drop(true)
        // wrapped CLIs fall back to plain \r / \n progress on a dumb terminal
        .env("TERM", "dumb")
        .env("COLUMNS", columns.to_string())
        .env("LINES", "24")
        .env("NO_COLOR", "1")
        .env("PYTHONUNBUFFERED", "1")
        .env("PYTHONIOENCODING", "utf-8");

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
}

/// Point stdout and stderr at the same pipe so the reader sees the tool's own write order.
///
/// The command keeps the write ends; drop it after spawning or the reader never sees EOF.
pub(crate) fn merge_output(cmd: &mut Command) -> std::io::Result<PipeReader> {
    let (reader, writer) = std::io::pipe()?;
    let stderr = writer.try_clone()?;
    cmd.stdout(writer).stderr(stderr);
    Ok(reader)
}

/// Read `reader` on its own thread in chunks of at most `chunk_size` bytes
pub(crate) fn read_chunks<R>(mut reader: R, chunk_size: usize) -> std::io::Result<mpsc::Receiver<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let mut buf = vec![0u8; chunk_size.max(1)];
    std::thread::Builder::new()
        .name("tool-output".to_string())
        .spawn(move || loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Output pipe closed with error: {}", e);
                    break;
                }
            }
        })?;
    Ok(rx)
}

#[async_trait]
impl ToolBackend for ProcessRunner {
    async fn execute(
        &self,
        invocation: &Invocation,
        observer: &dyn JobObserver,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let tool = &invocation.tool;
        let program = tool.program().ok_or_else(|| SyncError::Spawn {
            program: tool.name.clone(),
            reason: format!("no executable configured for {}", std::env::consts::OS),
        })?;

        info!("Starting {}: {} {:?}", tool.name, program, invocation.args);

        let spawn_error = |e: std::io::Error| SyncError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        };
        let mut cmd = self.command(program, invocation);
        let output = merge_output(&mut cmd).map_err(spawn_error)?;
        let mut child = cmd.spawn().map_err(spawn_error)?;
        drop(cmd);

        let chunks = match read_chunks(output, self.config.read_chunk_size) {
            Ok(chunks) => chunks,
            Err(e) => {
                stop_child(&mut child, &self.controller).await;
                return Err(spawn_error(e));
            }
        };

        let pumped = pump_output(chunks, |event| forward_event(observer, &event), cancel).await;

        if pumped == PumpResult::Cancelled {
            info!("Cancelling {}", tool.name);
            stop_child(&mut child, &self.controller).await;
            return Ok(ExecutionOutcome::Cancelled);
        }

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                let exit_code = exit_code_of(&status);
                info!("{} exited with code {}", tool.name, exit_code);
                Ok(ExecutionOutcome::Exited { exit_code })
            }
            _ = cancel.cancelled() => {
                info!("Cancelling {} while it shuts down", tool.name);
                stop_child(&mut child, &self.controller).await;
                Ok(ExecutionOutcome::Cancelled)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpResult {
    Drained,
    Cancelled,
}

/// Segment chunks as they arrive until the pipe closes or `cancel` fires
pub(crate) async fn pump_output<F>(
    mut chunks: mpsc::Receiver<Vec<u8>>,
    mut emit: F,
    cancel: &CancellationToken,
) -> PumpResult
where
    F: FnMut(ProgressEvent),
{
    let mut parser = OutputStreamParser::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpResult::Cancelled,
            chunk = chunks.recv() => match chunk {
                Some(bytes) => parser.feed(&bytes).into_iter().for_each(&mut emit),
                None => {
                    parser.finish().into_iter().for_each(&mut emit);
                    return PumpResult::Drained;
                }
            },
        }
    }
}

pub(crate) fn forward_event(observer: &dyn JobObserver, event: &ProgressEvent) {
    if !event.is_overwrite {
        debug!("tool: {}", event.text);
    }
    observer.on_event(event);
}

/// Terminate the child's tree and reap it
pub(crate) async fn stop_child(child: &mut Child, controller: &CancellationController) {
    let Some(pid) = child.id() else {
        // already reaped
        return;
    };

    let termination = controller.cancel(pid);
    let limit = controller.grace_period() * 2 + Duration::from_secs(2);

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => debug!("Process {} stopped: {}", pid, status),
        Ok(Err(e)) => warn!("Failed to reap process {}: {}", pid, e),
        Err(_) => {
            warn!("Process {} still running after {:?}, killing directly", pid, limit);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill process {}: {}", pid, e);
            }
        }
    }

    if let Err(e) = termination.await {
        warn!("Termination task for {} failed: {}", pid, e);
    }
}

pub(crate) fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::{ChannelObserver, JobEvent};
    use crate::tools::{ExecutablePaths, ToolDescriptor, ToolKind};
    use std::sync::Arc;
    use std::time::Instant;

    fn shell_tool(script: &str) -> Invocation {
        let tool = ToolDescriptor {
            name: "sh-tool".to_string(),
            kind: ToolKind::Executable,
            executable: ExecutablePaths::everywhere("/bin/sh"),
            module: None,
            command: Vec::new(),
            options: Vec::new(),
            supports_subtitle_as_reference: true,
            supported_formats: vec!["srt".to_string()],
            unsupported_path_chars: Vec::new(),
        };
        Invocation::new(Arc::new(tool), vec!["-c".to_string(), script.to_string()])
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(
            ProcessConfig { read_chunk_size: 4, ..ProcessConfig::default() },
            CancellationController::new(Duration::from_millis(500)),
        )
    }

    fn texts(events: &[JobEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Progress { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    async fn run_collecting(invocation: &Invocation) -> (ExecutionOutcome, Vec<JobEvent>) {
        let (observer, mut rx) = ChannelObserver::new();
        let outcome = runner()
            .execute(invocation, &observer, &CancellationToken::new())
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn streams_merged_output_and_exit_code() {
        let invocation = shell_tool("printf 'load\\n10%%\\r55%%\\rdone\\n'; echo oops >&2; exit 3");
        let (outcome, events) = run_collecting(&invocation).await;
        assert_eq!(outcome, ExecutionOutcome::Exited { exit_code: 3 });
        assert_eq!(texts(&events), vec!["load", "10%", "55%", "done", "oops"]);
        assert!(events.contains(&JobEvent::Percent(55.0)));
    }

    #[tokio::test]
    async fn interleaved_streams_keep_write_order() {
        let invocation = shell_tool("echo first; echo second >&2; echo third; echo fourth >&2");
        let (outcome, events) = run_collecting(&invocation).await;
        assert_eq!(outcome, ExecutionOutcome::Exited { exit_code: 0 });
        assert_eq!(texts(&events), vec!["first", "second", "third", "fourth"]);
    }

    #[tokio::test]
    async fn unterminated_stderr_line_is_flushed_at_exit() {
        let invocation = shell_tool("echo 'sync 40%'; printf 'fatal: no audio' >&2; exit 2");
        let (outcome, events) = run_collecting(&invocation).await;
        assert_eq!(outcome, ExecutionOutcome::Exited { exit_code: 2 });
        assert_eq!(texts(&events), vec!["sync 40%", "fatal: no audio"]);
    }

    #[tokio::test]
    async fn advertises_a_dumb_terminal() {
        let (observer, mut rx) = ChannelObserver::new();
        let invocation = shell_tool("echo \"$TERM $COLUMNS\"");
        runner().execute(&invocation, &observer, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            JobEvent::Progress { text: "dumb 80".to_string(), is_overwrite: false }
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let mut invocation = shell_tool("");
        let mut tool = (*invocation.tool).clone();
        tool.executable = ExecutablePaths::everywhere("/nonexistent/definitely-not-a-tool");
        invocation.tool = Arc::new(tool);

        let err = runner()
            .execute(&invocation, &crate::events::NullObserver, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_a_long_running_tool() {
        let invocation = shell_tool("echo started; sleep 30; echo never");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = runner()
            .execute(&invocation, &crate::events::NullObserver, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
