//! One synchronization job: a reference/subtitle pair run through one tool.
//!
//! ```text
//! PENDING -> PREPARING -> RUNNING -> SUCCEEDED | FAILED | CANCELLED
//! ```
//!
//! Input problems fail the job before it leaves PENDING. Everything that goes
//! wrong after construction ends up in the [`JobResult`]; only an unknown tool
//! name is reported as an error, by [`SyncJob::new`].

pub mod prepare;
pub mod rewrite;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::encoding;
use crate::error::{Result, SyncError};
use crate::events::JobObserver;
use crate::exec::{BackendFactory, ExecutionOutcome, Invocation};
use crate::media::{is_subtitle, is_video, MediaFactory, SubtitleConverter, SubtitleExtractor};
use crate::processed::{NoopProcessedItems, ProcessedItems};
use crate::tools::{build_arguments, CommandPaths, OptionValue, ToolDescriptor, ToolRegistry};

use prepare::{OutputGuard, WorkDir};
pub use rewrite::{DeclineRewrite, PathRewritePrompt, RewriteDecision, RewritePreference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Preparing,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Preparing => "PREPARING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// What to synchronize, and with which tool
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub reference_path: PathBuf,
    pub subtitle_path: PathBuf,
    pub tool_name: String,
    /// Defaults to `<stem>.<suffix>.<ext>` next to the subtitle
    pub output_path: Option<PathBuf>,
    /// Encoding label forced on the output, overriding the configured policy
    pub encoding: Option<String>,
    pub options: BTreeMap<String, OptionValue>,
    /// Appended verbatim after the option arguments
    pub extra_args: Vec<String>,
    /// Align to a subtitle stream embedded in the (video) reference
    pub use_embedded_reference: bool,
}

impl JobRequest {
    pub fn new<R, S, T>(reference: R, subtitle: S, tool: T) -> Self
    where
        R: Into<PathBuf>,
        S: Into<PathBuf>,
        T: Into<String>,
    {
        Self {
            reference_path: reference.into(),
            subtitle_path: subtitle.into(),
            tool_name: tool.into(),
            output_path: None,
            encoding: None,
            options: BTreeMap::new(),
            extra_args: Vec::new(),
            use_embedded_reference: false,
        }
    }

    pub fn with_output<P: Into<PathBuf>>(mut self, output: P) -> Self {
        self.output_path = Some(output.into());
        self
    }

    pub fn with_encoding<S: Into<String>>(mut self, label: S) -> Self {
        self.encoding = Some(label.into());
        self
    }

    pub fn with_option<S: Into<String>>(mut self, name: S, value: OptionValue) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_embedded_reference(mut self, enabled: bool) -> Self {
        self.use_embedded_reference = enabled;
        self
    }
}

/// Terminal value of a job. `success` implies `output_path` exists on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub state: JobState,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl JobResult {
    pub fn succeeded(output_path: PathBuf, exit_code: i32) -> Self {
        Self {
            state: JobState::Succeeded,
            success: true,
            output_path: Some(output_path),
            error: None,
            exit_code: Some(exit_code),
        }
    }

    pub fn failed<S: Into<String>>(error: S, exit_code: Option<i32>) -> Self {
        Self {
            state: JobState::Failed,
            success: false,
            output_path: None,
            error: Some(error.into()),
            exit_code,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            state: JobState::Cancelled,
            success: false,
            output_path: None,
            error: None,
            exit_code: None,
        }
    }
}

/// Everything a job needs besides its request, passed in explicitly
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
    pub processed: Arc<dyn ProcessedItems>,
    pub converter: Arc<dyn SubtitleConverter>,
    pub extractor: Arc<dyn SubtitleExtractor>,
    pub rewrite_prompt: Arc<dyn PathRewritePrompt>,
    pub rewrite_preference: Arc<RewritePreference>,
}

impl JobContext {
    /// ffmpeg-backed collaborators, no processed-items record, rewrites declined when asked
    pub fn new(config: Config) -> Result<Self> {
        let registry = config.registry()?;
        Ok(Self {
            converter: MediaFactory::create_converter(&config.media),
            extractor: MediaFactory::create_extractor(&config.media),
            config: Arc::new(config),
            registry: Arc::new(registry),
            processed: Arc::new(NoopProcessedItems),
            rewrite_prompt: Arc::new(DeclineRewrite),
            rewrite_preference: Arc::new(RewritePreference::new()),
        })
    }

    pub fn with_processed(mut self, processed: Arc<dyn ProcessedItems>) -> Self {
        self.processed = processed;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn SubtitleConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn SubtitleExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_rewrite_prompt(mut self, prompt: Arc<dyn PathRewritePrompt>) -> Self {
        self.rewrite_prompt = prompt;
        self
    }
}

/// Handle to a job running on its own task
pub struct JobHandle {
    cancel: CancellationToken,
    task: JoinHandle<JobResult>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> JobResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => JobResult::failed(format!("job task failed: {}", e), None),
        }
    }
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

/// Inputs as they will be handed to the tool
struct Staged {
    tool: Arc<ToolDescriptor>,
    reference: PathBuf,
    subtitle: PathBuf,
    output: PathBuf,
    tool_output: PathBuf,
    options: BTreeMap<String, OptionValue>,
    extra_args: Vec<String>,
}

pub struct SyncJob {
    id: Uuid,
    request: JobRequest,
    tool: Arc<ToolDescriptor>,
    fallback: Arc<ToolDescriptor>,
    context: JobContext,
    state: JobState,
}

impl SyncJob {
    /// Fails only when the requested or the default tool is not registered
    pub fn new(request: JobRequest, context: JobContext) -> Result<Self> {
        let tool = context.registry.get(&request.tool_name)?;
        let fallback = context.registry.get(&context.config.default_tool)?;
        Ok(Self {
            id: Uuid::new_v4(),
            request,
            tool,
            fallback,
            context,
            state: JobState::Pending,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run on a new task with its own cancel switch
    pub fn spawn(self, observer: Arc<dyn JobObserver>) -> JobHandle {
        self.spawn_with(observer, CancellationToken::new())
    }

    pub fn spawn_with(mut self, observer: Arc<dyn JobObserver>, cancel: CancellationToken) -> JobHandle {
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(observer.as_ref(), &token).await });
        JobHandle { cancel, task }
    }

    /// Drive the job to a terminal state; always reports `on_finished` exactly once
    pub async fn run(&mut self, observer: &dyn JobObserver, cancel: &CancellationToken) -> JobResult {
        let span = info_span!("job", id = %self.id, tool = %self.tool.name);
        self.drive(observer, cancel).instrument(span).await
    }

    async fn drive(&mut self, observer: &dyn JobObserver, cancel: &CancellationToken) -> JobResult {
        info!(
            "Synchronizing {} against {}",
            self.request.subtitle_path.display(),
            self.request.reference_path.display()
        );

        let result = if cancel.is_cancelled() {
            JobResult::cancelled()
        } else {
            match prepare::validate_inputs(&self.request.reference_path, &self.request.subtitle_path) {
                Err(e) => JobResult::failed(e.to_string(), None),
                Ok((reference, subtitle)) => {
                    self.transition(JobState::Preparing, observer);
                    self.prepare_and_run(reference, subtitle, observer, cancel).await
                }
            }
        };

        match &result.error {
            Some(error) => {
                warn!("Job failed: {}", error);
                observer.on_error(error);
            }
            None if result.success => info!("Job succeeded"),
            None => info!("Job cancelled"),
        }
        self.transition(result.state, observer);
        observer.on_finished(&result);
        result
    }

    fn transition(&mut self, state: JobState, observer: &dyn JobObserver) {
        debug!("{} -> {}", self.state, state);
        self.state = state;
        observer.on_state(state);
    }

    async fn prepare_and_run(
        &mut self,
        reference: PathBuf,
        subtitle: PathBuf,
        observer: &dyn JobObserver,
        cancel: &CancellationToken,
    ) -> JobResult {
        let config = Arc::clone(&self.context.config);
        let work = match WorkDir::create(&config.work.root(), self.id).await {
            Ok(work) => work,
            Err(e) => return JobResult::failed(e.to_string(), None),
        };

        let mut backup = None;
        let result = match self.execute_in(&work, &reference, &subtitle, &mut backup, observer, cancel).await {
            Ok(result) => result,
            Err(e) => JobResult::failed(e.to_string(), None),
        };

        if config.work.keep_temp_files {
            info!("Keeping temporary files in {}", work.path().display());
        } else {
            work.remove().await;
        }

        if let Some(backup) = backup {
            if result.success && !config.backup.keep {
                if let Err(e) = tokio::fs::remove_file(&backup.copy).await {
                    warn!("Failed to remove backup {}: {}", backup.copy.display(), e);
                }
            } else if !result.success {
                match backup.restore_if_missing().await {
                    Ok(true) => observer.on_notice(&format!("Restored previous output {}", backup.output.display())),
                    Ok(false) => {}
                    Err(e) => warn!("{}", e),
                }
                observer.on_notice(&format!("Previous output kept at {}", backup.copy.display()));
            }
        }

        result
    }

    async fn execute_in(
        &mut self,
        work: &WorkDir,
        reference: &Path,
        subtitle: &Path,
        backup: &mut Option<prepare::Backup>,
        observer: &dyn JobObserver,
        cancel: &CancellationToken,
    ) -> Result<JobResult> {
        let Some(staged) = self.stage(work, reference, subtitle, observer, cancel).await? else {
            return Ok(JobResult::cancelled());
        };
        let config = Arc::clone(&self.context.config);

        if config.backup.enabled {
            *backup = prepare::backup_existing(&staged.output).await?;
            if let Some(saved) = backup {
                observer.on_notice(&format!("Backed up existing output to {}", saved.copy.display()));
            }
        }

        let paths = CommandPaths {
            reference: &staged.reference,
            subtitle: &staged.subtitle,
            output: &staged.tool_output,
        };
        let args = build_arguments(&staged.tool, &paths, &staged.options, &staged.extra_args)?;

        if cancel.is_cancelled() {
            return Ok(JobResult::cancelled());
        }
        self.transition(JobState::Running, observer);

        let guard = OutputGuard::new(staged.tool_output.clone());
        let backend = BackendFactory::create_backend(staged.tool.kind, &config);
        let invocation = Invocation::new(Arc::clone(&staged.tool), args).in_dir(work.path().to_path_buf());

        let exit_code = match backend.execute(&invocation, observer, cancel).await {
            Ok(ExecutionOutcome::Exited { exit_code }) => exit_code,
            Ok(ExecutionOutcome::Cancelled) => {
                guard.discard().await;
                return Ok(JobResult::cancelled());
            }
            Err(e) => {
                guard.discard().await;
                return Err(e);
            }
        };

        if exit_code != 0 {
            guard.discard().await;
            return Ok(JobResult::failed(
                format!("{} exited with code {}", staged.tool.name, exit_code),
                Some(exit_code),
            ));
        }
        if !guard.written() {
            return Ok(JobResult::failed(
                format!(
                    "{} exited successfully but wrote no output to {}",
                    staged.tool.name,
                    guard.path().display()
                ),
                Some(exit_code),
            ));
        }

        if staged.tool_output != staged.output {
            prepare::move_file(&staged.tool_output, &staged.output).await?;
        }
        self.finalize(reference, subtitle, &staged.output, observer).await;
        Ok(JobResult::succeeded(staged.output, exit_code))
    }

    /// Extraction, tool fallback, output path, conversion and path rewriting; None when cancelled
    async fn stage(
        &self,
        work: &WorkDir,
        reference: &Path,
        subtitle: &Path,
        observer: &dyn JobObserver,
        cancel: &CancellationToken,
    ) -> Result<Option<Staged>> {
        let config = &self.context.config;
        let mut tool_reference = reference.to_path_buf();
        let mut tool_subtitle = subtitle.to_path_buf();

        if self.request.use_embedded_reference {
            if is_video(reference) {
                let extraction = self.context.extractor.extract(reference, subtitle, work.path());
                let Some(outcome) = until_cancelled(cancel, extraction).await else {
                    return Ok(None);
                };
                let outcome = outcome.map_err(|e| SyncError::Extraction(e.to_string()))?;
                outcome.messages.iter().for_each(|m| debug!("{}", m));
                tool_reference = outcome.path.ok_or_else(|| {
                    SyncError::Extraction(format!("no usable subtitle stream in {}", reference.display()))
                })?;
                observer.on_notice(&format!(
                    "Using embedded subtitle {} (score {:.2})",
                    tool_reference.display(),
                    outcome.score
                ));
            } else {
                observer.on_notice("Reference is not a video, skipping embedded subtitle extraction");
            }
        }

        let mut tool = Arc::clone(&self.tool);
        let mut options = self.request.options.clone();
        let mut extra_args = self.request.extra_args.clone();
        if !tool.supports_subtitle_as_reference && is_subtitle(&tool_reference) {
            let notice = format!(
                "{} cannot use a subtitle as reference, using {} instead",
                tool.name, self.fallback.name
            );
            info!("{}", notice);
            observer.on_notice(&notice);
            tool = Arc::clone(&self.fallback);
            options.retain(|name, _| tool.option(name).is_some());
            extra_args.clear();
        }

        let computed = prepare::default_output_path(subtitle, &tool, &config.output);
        let output = prepare::resolve_output(self.request.output_path.as_deref(), computed, &[reference, subtitle])?;

        if !tool.supports_file(&tool_subtitle) {
            let Some(converted) = self.convert(&tool_subtitle, work, &tool, observer, cancel).await? else {
                return Ok(None);
            };
            tool_subtitle = converted;
        }
        if is_subtitle(&tool_reference) && !tool.supports_file(&tool_reference) {
            let Some(converted) = self.convert(&tool_reference, work, &tool, observer, cancel).await? else {
                return Ok(None);
            };
            tool_reference = converted;
        }

        let mut tool_output = output.clone();
        let unsupported = tool.unsupported_path_chars.clone();
        if !unsupported.is_empty() {
            for path in [&mut tool_reference, &mut tool_subtitle] {
                if !tool.accepts_path(path) && self.allow_rewrite(path, &unsupported, observer).await {
                    *path = rewrite::rewrite_input(path, work.path(), &unsupported).await?;
                }
            }
            if !tool.accepts_path(&output) && self.allow_rewrite(&output, &unsupported, observer).await {
                tool_output = rewrite::sanitized_location(&output, work.path(), &unsupported)?;
            }
        }

        Ok(Some(Staged {
            tool,
            reference: tool_reference,
            subtitle: tool_subtitle,
            output,
            tool_output,
            options,
            extra_args,
        }))
    }

    async fn allow_rewrite(&self, path: &Path, unsupported: &[char], observer: &dyn JobObserver) -> bool {
        let offending = rewrite::offending_chars(path, unsupported);
        let allowed = rewrite::should_rewrite(
            self.context.config.paths.rewrite,
            self.context.rewrite_prompt.as_ref(),
            &self.context.rewrite_preference,
            path,
            &offending,
        )
        .await;
        if !allowed {
            let chars: String = offending.iter().collect();
            observer.on_notice(&format!(
                "{} contains '{}', which the tool may not parse",
                path.display(),
                chars
            ));
        }
        allowed
    }

    async fn convert(
        &self,
        input: &Path,
        work: &WorkDir,
        tool: &ToolDescriptor,
        observer: &dyn JobObserver,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let format = tool.preferred_format();
        let conversion = self.context.converter.convert(input, work.path(), format);
        let Some(outcome) = until_cancelled(cancel, conversion).await else {
            return Ok(None);
        };
        let outcome = outcome.map_err(|e| SyncError::Conversion(e.to_string()))?;
        outcome.messages.iter().for_each(|m| debug!("{}", m));

        match outcome.path {
            Some(path) if path.exists() => {
                observer.on_notice(&format!("Converted {} to {}", input.display(), format));
                Ok(Some(path))
            }
            _ => Err(SyncError::Conversion(format!(
                "{} could not be converted to {}: {}",
                input.display(),
                format,
                outcome.messages.join("; ")
            ))),
        }
    }

    async fn finalize(&self, reference: &Path, subtitle: &Path, output: &Path, observer: &dyn JobObserver) {
        if let Err(e) = self.context.processed.mark_as_processed(reference).await {
            warn!("Failed to record {} as processed: {}", reference.display(), e);
            observer.on_notice(&format!("Could not record {} as processed: {}", reference.display(), e));
        }

        let settings = &self.context.config.encoding;
        match encoding::reconcile(
            output,
            settings.policy,
            &settings.target,
            self.request.encoding.as_deref(),
            subtitle,
        )
        .await
        {
            Ok(Some(target)) => observer.on_notice(&format!("Output re-encoded as {}", target.name())),
            Ok(None) => {}
            Err(e) => {
                warn!("Encoding reconciliation failed: {}", e);
                observer.on_notice(&format!("Output left in its original encoding: {}", e));
            }
        }
    }
}
