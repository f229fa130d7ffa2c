//! Strictly sequential execution of many jobs with aggregate reporting.
//!
//! Items never overlap: the next job is built only after the previous one
//! reached a terminal state. One cancel switch covers the whole batch; every
//! job runs on a child of it, so cancelling the batch also stops the active
//! tool.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::events::JobObserver;
use crate::job::{JobContext, JobRequest, JobResult, JobState, SyncJob};

/// Callbacks for a whole batch. `index` is the item's position in the submitted list.
pub trait BatchObserver: Send + Sync {
    fn on_item_started(&self, _index: usize, _total: usize, _request: &JobRequest) {}

    fn on_item_progress(&self, _index: usize, _text: &str, _is_overwrite: bool) {}

    fn on_item_notice(&self, _index: usize, _message: &str) {}

    fn on_item_error(&self, _index: usize, _message: &str) {}

    fn on_item_finished(&self, _index: usize, _result: &JobResult) {}

    /// Blended progress over the whole batch, 0..=100, never decreasing
    fn on_batch_progress(&self, _percent: u8) {}

    fn on_batch_finished(&self, _summary: &BatchSummary) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullBatchObserver;

impl BatchObserver for NullBatchObserver {}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    pub index: usize,
    pub reference: PathBuf,
    pub subtitle: PathBuf,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub failed_items: Vec<FailedItem>,
    /// One result per item that was started, in order
    pub results: Vec<JobResult>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    /// Items never started because the batch was cancelled
    pub fn skipped(&self) -> usize {
        self.total - self.results.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    ItemStarted {
        index: usize,
        total: usize,
        reference: PathBuf,
        subtitle: PathBuf,
    },
    ItemProgress {
        index: usize,
        text: String,
        is_overwrite: bool,
    },
    ItemNotice {
        index: usize,
        message: String,
    },
    ItemError {
        index: usize,
        message: String,
    },
    ItemFinished {
        index: usize,
        result: JobResult,
    },
    Progress(u8),
    Finished(BatchSummary),
}

/// Forwards batch callbacks into an unbounded channel
#[derive(Debug, Clone)]
pub struct BatchChannelObserver {
    tx: mpsc::UnboundedSender<BatchEvent>,
}

impl BatchChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: BatchEvent) {
        let _ = self.tx.send(event);
    }
}

impl BatchObserver for BatchChannelObserver {
    fn on_item_started(&self, index: usize, total: usize, request: &JobRequest) {
        self.send(BatchEvent::ItemStarted {
            index,
            total,
            reference: request.reference_path.clone(),
            subtitle: request.subtitle_path.clone(),
        });
    }

    fn on_item_progress(&self, index: usize, text: &str, is_overwrite: bool) {
        self.send(BatchEvent::ItemProgress {
            index,
            text: text.to_string(),
            is_overwrite,
        });
    }

    fn on_item_notice(&self, index: usize, message: &str) {
        self.send(BatchEvent::ItemNotice {
            index,
            message: message.to_string(),
        });
    }

    fn on_item_error(&self, index: usize, message: &str) {
        self.send(BatchEvent::ItemError {
            index,
            message: message.to_string(),
        });
    }

    fn on_item_finished(&self, index: usize, result: &JobResult) {
        self.send(BatchEvent::ItemFinished {
            index,
            result: result.clone(),
        });
    }

    fn on_batch_progress(&self, percent: u8) {
        self.send(BatchEvent::Progress(percent));
    }

    fn on_batch_finished(&self, summary: &BatchSummary) {
        self.send(BatchEvent::Finished(summary.clone()));
    }
}

/// Monotonic progress over `total` items; 100 is reserved for the end of the last item
#[derive(Debug)]
pub struct BlendedProgress {
    total: usize,
    last: Mutex<u8>,
}

impl BlendedProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            last: Mutex::new(0),
        }
    }

    /// Item `index` (0-based) reports `percent`; Some when the blended value advanced
    pub fn item_percent(&self, index: usize, percent: f64) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let percent = percent.clamp(0.0, 100.0);
        let value = (index as f64 * 100.0 + percent) / self.total as f64;
        self.advance((value.floor() as u8).min(99))
    }

    /// Item `index` reached a terminal state
    pub fn item_finished(&self, index: usize) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let value = ((index + 1).min(self.total) * 100 / self.total) as u8;
        self.advance(value)
    }

    pub fn current(&self) -> u8 {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, value: u8) -> Option<u8> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if value > *last {
            *last = value;
            Some(value)
        } else {
            None
        }
    }
}

/// Adapts one item's job callbacks to the batch observer
struct ItemObserver<'a> {
    index: usize,
    batch: &'a dyn BatchObserver,
    progress: &'a BlendedProgress,
}

impl JobObserver for ItemObserver<'_> {
    fn on_progress(&self, text: &str, is_overwrite: bool) {
        self.batch.on_item_progress(self.index, text, is_overwrite);
    }

    fn on_percent(&self, percent: f64) {
        if let Some(blended) = self.progress.item_percent(self.index, percent) {
            self.batch.on_batch_progress(blended);
        }
    }

    fn on_notice(&self, message: &str) {
        self.batch.on_item_notice(self.index, message);
    }

    fn on_error(&self, message: &str) {
        self.batch.on_item_error(self.index, message);
    }
}

pub struct BatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    /// Stop the active item and start no further ones
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Option<BatchSummary> {
        match self.task.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Batch task failed: {}", e);
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct BatchCoordinator {
    context: JobContext,
}

impl BatchCoordinator {
    pub fn new(context: JobContext) -> Self {
        Self { context }
    }

    pub fn spawn(self, requests: Vec<JobRequest>, observer: Arc<dyn BatchObserver>) -> BatchHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(requests, observer.as_ref(), &token).await });
        BatchHandle { cancel, task }
    }

    /// Run every request in order; one item's failure never stops the batch
    pub async fn run(
        &self,
        requests: Vec<JobRequest>,
        observer: &dyn BatchObserver,
        cancel: &CancellationToken,
    ) -> BatchSummary {
        let total = requests.len();
        let started_at = Utc::now();
        let progress = BlendedProgress::new(total);
        let delay = Duration::from_millis(self.context.config.batch.item_delay_ms);

        let mut results = Vec::with_capacity(total);
        let mut failed_items = Vec::new();
        let mut success_count = 0;

        info!("Starting batch of {} items", total);
        for (index, request) in requests.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if index > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            observer.on_item_started(index, total, &request);
            let span = info_span!("item", index, total);
            let result = self
                .run_item(index, request.clone(), observer, &progress, cancel)
                .instrument(span)
                .await;

            match result.state {
                JobState::Succeeded => success_count += 1,
                JobState::Failed => failed_items.push(FailedItem {
                    index,
                    reference: request.reference_path.clone(),
                    subtitle: request.subtitle_path.clone(),
                    error: result.error.clone(),
                }),
                _ => {}
            }
            observer.on_item_finished(index, &result);
            if result.state != JobState::Cancelled {
                if let Some(percent) = progress.item_finished(index) {
                    observer.on_batch_progress(percent);
                }
            }
            results.push(result);
        }

        let cancelled = cancel.is_cancelled();
        if total == 0 && !cancelled {
            observer.on_batch_progress(100);
        }

        let summary = BatchSummary {
            total,
            success_count,
            fail_count: failed_items.len(),
            failed_items,
            results,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            "Batch finished: {} succeeded, {} failed{}",
            summary.success_count,
            summary.fail_count,
            if cancelled { ", cancelled" } else { "" }
        );
        observer.on_batch_finished(&summary);
        summary
    }

    async fn run_item(
        &self,
        index: usize,
        request: JobRequest,
        observer: &dyn BatchObserver,
        progress: &BlendedProgress,
        cancel: &CancellationToken,
    ) -> JobResult {
        let mut job = match SyncJob::new(request, self.context.clone()) {
            Ok(job) => job,
            Err(e) => {
                warn!("Item {} rejected: {}", index, e);
                let message = e.to_string();
                observer.on_item_error(index, &message);
                return JobResult::failed(message, None);
            }
        };
        let item = ItemObserver {
            index,
            batch: observer,
            progress,
        };
        job.run(&item, &cancel.child_token()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blended_progress_is_monotonic_and_capped() {
        let progress = BlendedProgress::new(4);
        assert_eq!(progress.item_percent(0, 50.0), Some(12));
        assert_eq!(progress.item_percent(0, 10.0), None);
        assert_eq!(progress.item_finished(0), Some(25));
        assert_eq!(progress.item_percent(1, 0.0), None);
        assert_eq!(progress.item_percent(1, 100.0), Some(50));
        assert_eq!(progress.item_finished(1), None);
        assert_eq!(progress.item_percent(3, 100.0), Some(99));
        assert_eq!(progress.current(), 99);
        assert_eq!(progress.item_finished(3), Some(100));
    }

    #[test]
    fn single_item_reaches_100_only_when_finished() {
        let progress = BlendedProgress::new(1);
        assert_eq!(progress.item_percent(0, 100.0), Some(99));
        assert_eq!(progress.item_percent(0, 250.0), None);
        assert_eq!(progress.item_finished(0), Some(100));
    }

    #[cfg(unix)]
    mod sequencing {
        use super::*;
        use crate::config::Config;
        use crate::tools::{ExecutablePaths, ToolDescriptor, ToolKind};

        fn context(dir: &std::path::Path) -> JobContext {
            let mut config = Config::default();
            config.work.directory = Some(dir.join("work"));
            config.batch.item_delay_ms = 0;
            config.default_tool = "copy".to_string();
            config.tools = vec![ToolDescriptor {
                name: "copy".to_string(),
                kind: ToolKind::Executable,
                executable: ExecutablePaths::everywhere("/bin/sh"),
                module: None,
                command: ["-c", r#"echo "50%"; cp "$2" "$3""#, "sh", "{reference}", "{subtitle}", "{output}"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                options: Vec::new(),
                supports_subtitle_as_reference: true,
                supported_formats: vec!["srt".to_string()],
                unsupported_path_chars: Vec::new(),
            }];
            tokio_test::assert_ok!(JobContext::new(config))
        }

        #[tokio::test]
        async fn rejected_items_do_not_stop_the_batch() {
            let dir = tempfile::tempdir().unwrap();
            let video = dir.path().join("ep01.mkv");
            let subtitle = dir.path().join("ep01.srt");
            std::fs::write(&video, "video").unwrap();
            std::fs::write(&subtitle, "1\n").unwrap();

            let requests = vec![
                JobRequest::new(&video, &subtitle, "missing-tool"),
                JobRequest::new(&video, &subtitle, "copy"),
            ];
            let summary = BatchCoordinator::new(context(dir.path()))
                .run(requests, &NullBatchObserver, &CancellationToken::new())
                .await;

            assert_eq!(summary.success_count, 1);
            assert_eq!(summary.fail_count, 1);
            assert_eq!(summary.failed_items[0].index, 0);
            assert!(summary.failed_items[0].error.as_deref().unwrap().contains("missing-tool"));
            assert!(!summary.cancelled);
        }

        #[tokio::test]
        async fn cancelled_batch_starts_nothing() {
            let dir = tempfile::tempdir().unwrap();
            let cancel = CancellationToken::new();
            cancel.cancel();
            let (observer, mut rx) = BatchChannelObserver::new();

            let requests = vec![JobRequest::new("a.mkv", "a.srt", "copy")];
            let summary = BatchCoordinator::new(context(dir.path()))
                .run(requests, &observer, &cancel)
                .await;

            assert!(summary.cancelled);
            assert_eq!(summary.skipped(), 1);
            assert!(matches!(rx.recv().await, Some(BatchEvent::Finished(_))));
        }

        #[tokio::test]
        async fn empty_batch_completes_at_100() {
            let dir = tempfile::tempdir().unwrap();
            let (observer, mut rx) = BatchChannelObserver::new();
            let summary = BatchCoordinator::new(context(dir.path()))
                .run(Vec::new(), &observer, &CancellationToken::new())
                .await;

            assert_eq!(summary.total, 0);
            assert_eq!(rx.recv().await, Some(BatchEvent::Progress(100)));
        }
    }
}
