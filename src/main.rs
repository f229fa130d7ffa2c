//! autosubsync - command line front-end
//!
//! `sync` and `batch` drive the job engine with a progress bar and Ctrl-C
//! cancellation; the hidden `worker` subcommand is the isolated runner that
//! module tools are executed in.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use autosubsync::batch::{BatchCoordinator, BatchObserver, BatchSummary};
use autosubsync::cli::{Args, Commands};
use autosubsync::config::Config;
use autosubsync::discovery::{discover_pairs, load_manifest, MediaPair};
use autosubsync::events::JobObserver;
use autosubsync::job::{JobContext, JobRequest, JobResult, PathRewritePrompt, RewriteDecision, SyncJob};
use autosubsync::processed::ProcessedStore;
use autosubsync::tools::{OptionValue, ToolRegistry};
use autosubsync::worker::{run_worker, WorkerRequest};

const STATE_DIR: &str = ".autosubsync";
const CONFIG_FILE: &str = "autosubsync.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The worker's stdout carries the message protocol, so it only logs to stderr
    if let Commands::Worker { module, python, columns, chunk_size, args: module_args } = args.command {
        setup_worker_logging(args.verbose)?;
        let request = WorkerRequest {
            module,
            python,
            args: module_args,
            terminal_columns: columns,
            read_chunk_size: chunk_size,
        };
        std::process::exit(run_worker(request).await);
    }

    setup_logging(args.verbose)?;
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Sync {
            reference,
            subtitle,
            tool,
            output,
            encoding,
            options,
            embedded_reference,
            extra,
        } => {
            let context = engine_context(config).await?;
            let tool = tool.unwrap_or_else(|| context.config.default_tool.clone());
            let mut request = JobRequest::new(reference, subtitle, tool.clone())
                .with_extra_args(extra)
                .with_embedded_reference(embedded_reference);
            for (name, value) in parse_options(&context.registry, &tool, &options)? {
                request = request.with_option(name, value);
            }
            if let Some(output) = output {
                request = request.with_output(output);
            }
            if let Some(encoding) = encoding {
                request = request.with_encoding(encoding);
            }

            let job = SyncJob::new(request, context)?;
            let observer = Arc::new(ConsoleObserver::new());
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let result = job.spawn_with(observer.clone(), cancel).join().await;
            observer.finish();
            report_result(&result)?;
        }
        Commands::Batch {
            manifest,
            dir,
            tool,
            skip_processed,
        } => {
            let pairs = match (manifest, dir) {
                (Some(manifest), _) => load_manifest(manifest)?,
                (None, Some(dir)) => discover_pairs(dir, &config.output.suffix)?,
                (None, None) => bail!("Either --manifest or --dir is required"),
            };
            let pairs = if skip_processed {
                filter_processed(pairs).await?
            } else {
                pairs
            };

            let context = engine_context(config).await?;
            let default_tool = tool.unwrap_or_else(|| context.config.default_tool.clone());
            let requests: Vec<JobRequest> = pairs
                .into_iter()
                .map(|pair| {
                    let tool = pair.tool.unwrap_or_else(|| default_tool.clone());
                    let request = JobRequest::new(pair.reference, pair.subtitle, tool);
                    match pair.output {
                        Some(output) => request.with_output(output),
                        None => request,
                    }
                })
                .collect();

            if requests.is_empty() {
                println!("Nothing to synchronize.");
                return Ok(());
            }

            let observer = ConsoleObserver::new();
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let summary = BatchCoordinator::new(context).run(requests, &observer, &cancel).await;
            observer.finish();
            report_summary(&summary)?;
        }
        Commands::Tools => {
            let registry = config.registry()?;
            println!("{:<15} {:<12} {:<22} {:<10}", "Name", "Kind", "Formats", "Sub ref");
            println!("{}", "-".repeat(62));
            for tool in registry.iter() {
                let marker = if tool.name == config.default_tool { " (default)" } else { "" };
                println!(
                    "{:<15} {:<12} {:<22} {:<10}{}",
                    tool.name,
                    format!("{:?}", tool.kind).to_lowercase(),
                    tool.supported_formats.join(","),
                    if tool.supports_subtitle_as_reference { "yes" } else { "no" },
                    marker
                );
            }
        }
        Commands::Worker { .. } => unreachable!("handled before logging setup"),
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Ok(match path {
        Some(path) => Config::from_file(path)?,
        None => {
            if Path::new(CONFIG_FILE).exists() {
                info!("Found {} in current directory, loading...", CONFIG_FILE);
                Config::from_file(CONFIG_FILE)?
            } else {
                Config::default()
            }
        }
    })
}

fn processed_store_path() -> Result<PathBuf> {
    Ok(std::env::current_dir()?.join(STATE_DIR).join("processed.json"))
}

async fn engine_context(config: Config) -> Result<JobContext> {
    let store = ProcessedStore::open(processed_store_path()?).await?;
    Ok(JobContext::new(config)?
        .with_processed(Arc::new(store))
        .with_rewrite_prompt(Arc::new(TerminalPrompt)))
}

async fn filter_processed(pairs: Vec<MediaPair>) -> Result<Vec<MediaPair>> {
    let store = ProcessedStore::open(processed_store_path()?).await?;
    let mut remaining = Vec::with_capacity(pairs.len());
    for pair in pairs {
        match store.is_processed(&pair.reference).await {
            Ok(true) => info!("Skipping processed {}", pair.reference.display()),
            Ok(false) => remaining.push(pair),
            // unreadable references fail properly inside the job
            Err(_) => remaining.push(pair),
        }
    }
    Ok(remaining)
}

/// `name=value` pairs checked against the tool's option schema
fn parse_options(registry: &ToolRegistry, tool: &str, raw: &[String]) -> Result<Vec<(String, OptionValue)>> {
    let descriptor = registry.get(tool)?;
    raw.iter()
        .map(|entry| {
            let (name, value) = entry
                .split_once('=')
                .with_context(|| format!("Option '{}' must look like name=value", entry))?;
            let option = descriptor
                .option(name)
                .with_context(|| format!("Tool '{}' has no option '{}'", tool, name))?;
            Ok((name.to_string(), option.parse_value(value)?))
        })
        .collect()
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling...");
            cancel.cancel();
        }
    });
}

fn report_result(result: &JobResult) -> Result<()> {
    if result.success {
        if let Some(output) = &result.output_path {
            println!("Synchronized subtitle written to {}", output.display());
        }
        return Ok(());
    }
    match &result.error {
        Some(error) => bail!("Synchronization failed: {}", error),
        None => bail!("Synchronization cancelled"),
    }
}

fn report_summary(summary: &BatchSummary) -> Result<()> {
    println!(
        "\nBatch finished in {}s: {} succeeded, {} failed, {} skipped",
        (summary.finished_at - summary.started_at).num_seconds(),
        summary.success_count,
        summary.fail_count,
        summary.skipped()
    );
    for item in &summary.failed_items {
        println!(
            "  #{} {} / {}: {}",
            item.index + 1,
            item.reference.display(),
            item.subtitle.display(),
            item.error.as_deref().unwrap_or("unknown error")
        );
    }
    if summary.cancelled {
        bail!("Batch cancelled");
    }
    if summary.fail_count > 0 {
        bail!("{} of {} items failed", summary.fail_count, summary.total);
    }
    Ok(())
}

/// Progress bar for both single jobs and batches
struct ConsoleObserver {
    bar: ProgressBar,
}

impl ConsoleObserver {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        // the template is a literal; fall back to the default style if it ever fails to parse
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl JobObserver for ConsoleObserver {
    fn on_progress(&self, text: &str, _is_overwrite: bool) {
        self.bar.set_message(text.to_string());
    }

    fn on_percent(&self, percent: f64) {
        self.bar.set_position(percent.clamp(0.0, 100.0) as u64);
    }

    fn on_notice(&self, message: &str) {
        self.bar.println(format!("note: {}", message));
    }

    fn on_error(&self, message: &str) {
        self.bar.println(format!("error: {}", message));
    }
}

impl BatchObserver for ConsoleObserver {
    fn on_item_started(&self, index: usize, total: usize, request: &JobRequest) {
        self.bar.println(format!(
            "[{}/{}] {}",
            index + 1,
            total,
            request.subtitle_path.display()
        ));
    }

    fn on_item_progress(&self, _index: usize, text: &str, _is_overwrite: bool) {
        self.bar.set_message(text.to_string());
    }

    fn on_item_notice(&self, index: usize, message: &str) {
        self.bar.println(format!("  #{} note: {}", index + 1, message));
    }

    fn on_item_error(&self, index: usize, message: &str) {
        self.bar.println(format!("  #{} error: {}", index + 1, message));
    }

    fn on_batch_progress(&self, percent: u8) {
        self.bar.set_position(u64::from(percent));
    }
}

/// Asks on the terminal; `a` and `s` answer for the rest of the run
struct TerminalPrompt;

#[async_trait]
impl PathRewritePrompt for TerminalPrompt {
    async fn confirm(&self, path: &Path, offending: &[char]) -> RewriteDecision {
        let chars: String = offending.iter().collect();
        eprintln!(
            "\n{} contains characters the tool cannot handle ({}).\n\
             Work on a renamed copy? [y]es / [n]o / [a]lways / [s]kip always: ",
            path.display(),
            chars
        );
        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        if stdin.read_line(&mut line).await.is_err() {
            return RewriteDecision { rewrite: false, remember: false };
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => RewriteDecision { rewrite: true, remember: false },
            "a" | "always" => RewriteDecision { rewrite: true, remember: true },
            "s" | "skip" => RewriteDecision { rewrite: false, remember: true },
            _ => RewriteDecision { rewrite: false, remember: false },
        }
    }
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = std::env::current_dir()?.join(STATE_DIR).join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "autosubsync.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("autosubsync.log").display()
    );
    Ok(())
}

/// Worker logging goes to stderr, where the parent picks it up as debug output
fn setup_worker_logging(verbose: bool) -> Result<()> {
    let log_level = if verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).with_ansi(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    Ok(())
}
