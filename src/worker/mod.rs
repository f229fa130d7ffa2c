//! Child side of the module worker.
//!
//! The parent re-invokes this binary with the hidden `worker` subcommand. The
//! worker starts the Python interpreter on a small bootstrap that imports the
//! tool's entry point, segments everything it prints and reports back to the
//! parent as JSON lines on stdout (see [`protocol::WorkerMessage`]).

pub mod protocol;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Result, SyncError};
use crate::exec::process::{apply_process_environment, exit_code_of, merge_output, pump_output, read_chunks};
use crate::progress::ProgressEvent;

pub use protocol::WorkerMessage;

/// Prefix the bootstrap prints before an uncaught exception
pub const ERROR_MARKER: &str = "__worker_error__";

const BOOTSTRAP: &str = r#"
import importlib, logging, sys, traceback
sys.stderr = sys.stdout
logging.basicConfig(stream=sys.stdout, level=logging.INFO, format="%(message)s", force=True)
module_name, func_name = sys.argv[1], sys.argv[2]
sys.argv = [module_name.rsplit(".", 1)[-1]] + sys.argv[3:]
try:
    code = getattr(importlib.import_module(module_name), func_name)()
except SystemExit as exc:
    code = exc.code
except BaseException as exc:
    traceback.print_exc(file=sys.stdout)
    print("__worker_error__ %s: %s" % (type(exc).__name__, exc))
    code = 1
sys.stdout.flush()
if code is None:
    code = 0
elif not isinstance(code, int):
    print(code)
    code = 1
sys.exit(code)
"#;

/// What the worker should run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    /// Entry point as `package.module:function`
    pub module: String,
    pub python: String,
    pub args: Vec<String>,
    pub terminal_columns: u16,
    pub read_chunk_size: usize,
}

impl WorkerRequest {
    fn entry_point(&self) -> Result<(&str, &str)> {
        match self.module.split_once(':') {
            Some((module, func)) if !module.is_empty() && !func.is_empty() => Ok((module, func)),
            _ => Err(SyncError::Worker(format!(
                "entry point must look like 'package.module:function', got '{}'",
                self.module
            ))),
        }
    }
}

/// Run the request, write the protocol to stdout and return the process exit code.
///
/// Always ends the stream with a `finished` message, including when the
/// module fails to start or the worker itself panics.
pub async fn run_worker(request: WorkerRequest) -> i32 {
    let task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        run_module(&request, &mut stdout).await
    });

    let (exit_code, failure) = match task.await {
        Ok(Ok(code)) => (code, None),
        Ok(Err(e)) => (1, Some(e.to_string())),
        Err(e) if e.is_panic() => (1, Some(format!("worker panicked: {}", panic_message(e)))),
        Err(e) => (1, Some(format!("worker task failed: {}", e))),
    };

    let mut stdout = tokio::io::stdout();
    if let Some(message) = failure {
        error!("{}", message);
        let _ = write_message(&mut stdout, &WorkerMessage::Error { message }).await;
    }
    let _ = write_message(&mut stdout, &WorkerMessage::Finished { exit_code }).await;
    let _ = stdout.flush().await;
    exit_code
}

/// Start the interpreter and relay its output; the `finished` message is left to the caller.
pub async fn run_module<W>(request: &WorkerRequest, out: &mut W) -> Result<i32>
where
    W: AsyncWrite + Unpin,
{
    let (module, func) = request.entry_point()?;
    info!("Worker running {}:{} with {}", module, func, request.python);

    let mut cmd = Command::new(&request.python);
    cmd.arg("-c").arg(BOOTSTRAP).arg(module).arg(func).args(&request.args);
    apply_process_environment(&mut cmd, request.terminal_columns);

    let spawn_error = |e: std::io::Error| SyncError::Spawn {
        program: request.python.clone(),
        reason: e.to_string(),
    };
    let output = merge_output(&mut cmd).map_err(spawn_error)?;
    let mut child = cmd.spawn().map_err(spawn_error)?;
    drop(cmd);

    let chunks = read_chunks(output, request.read_chunk_size)
        .map_err(|e| SyncError::Worker(format!("cannot read interpreter output: {}", e)))?;
    relay_output(chunks, out).await?;

    let status = child.wait().await?;
    let code = exit_code_of(&status);
    debug!("Interpreter exited with {}", code);
    Ok(code)
}

/// Segment the interpreter's merged output and write one message per segment, in order
pub async fn relay_output<W>(chunks: mpsc::Receiver<Vec<u8>>, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let never = CancellationToken::new();
    let pump = pump_output(
        chunks,
        move |event| {
            let _ = tx.send(translate(&event));
        },
        &never,
    );

    let write = async {
        while let Some(message) = rx.recv().await {
            write_message(&mut *out, &message).await?;
        }
        Ok::<(), SyncError>(())
    };

    let (_, written) = tokio::join!(pump, write);
    written
}

/// Map a segment to a protocol message; marker lines become errors
pub fn translate(event: &ProgressEvent) -> WorkerMessage {
    match event.text.strip_prefix(ERROR_MARKER) {
        Some(rest) => WorkerMessage::Error {
            message: rest.trim().to_string(),
        },
        None => WorkerMessage::progress(event),
    }
}

async fn write_message<W: AsyncWrite + Unpin>(out: &mut W, message: &WorkerMessage) -> Result<()> {
    out.write_all(message.to_line()?.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

fn panic_message(error: tokio::task::JoinError) -> String {
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
