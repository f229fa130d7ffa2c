//! One-way event surface from running jobs to their caller.
//!
//! Observers are called from the job's task; implementations must not block.

use tokio::sync::mpsc;

use crate::job::{JobResult, JobState};
use crate::progress::ProgressEvent;

pub trait JobObserver: Send + Sync {
    fn on_state(&self, _state: JobState) {}

    fn on_progress(&self, _text: &str, _is_overwrite: bool) {}

    /// Percentage (0..=100) reported by the tool, decoupled from the text
    fn on_percent(&self, _percent: f64) {}

    /// Informational message from the engine itself, e.g. a tool substitution
    fn on_notice(&self, _message: &str) {}

    fn on_error(&self, _message: &str) {}

    fn on_finished(&self, _result: &JobResult) {}

    /// Dispatch a parsed output line as text plus percentage
    fn on_event(&self, event: &ProgressEvent) {
        self.on_progress(&event.text, event.is_overwrite);
        if let Some(percent) = event.percent {
            self.on_percent(percent);
        }
    }
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl JobObserver for NullObserver {}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    State(JobState),
    Progress { text: String, is_overwrite: bool },
    Percent(f64),
    Notice(String),
    Error(String),
    Finished(JobResult),
}

/// Forwards every callback into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: JobEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl JobObserver for ChannelObserver {
    fn on_state(&self, state: JobState) {
        self.send(JobEvent::State(state));
    }

    fn on_progress(&self, text: &str, is_overwrite: bool) {
        self.send(JobEvent::Progress {
            text: text.to_string(),
            is_overwrite,
        });
    }

    fn on_percent(&self, percent: f64) {
        self.send(JobEvent::Percent(percent));
    }

    fn on_notice(&self, message: &str) {
        self.send(JobEvent::Notice(message.to_string()));
    }

    fn on_error(&self, message: &str) {
        self.send(JobEvent::Error(message.to_string()));
    }

    fn on_finished(&self, result: &JobResult) {
        self.send(JobEvent::Finished(result.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_observer_splits_text_and_percent() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_event(&ProgressEvent::from_segment("42% done", true));
        observer.on_event(&ProgressEvent::from_segment("no percent", false));

        assert_eq!(
            rx.try_recv().unwrap(),
            JobEvent::Progress { text: "42% done".to_string(), is_overwrite: true }
        );
        assert_eq!(rx.try_recv().unwrap(), JobEvent::Percent(42.0));
        assert!(matches!(rx.try_recv().unwrap(), JobEvent::Progress { .. }));
        assert!(rx.try_recv().is_err());
    }
}
