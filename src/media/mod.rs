// Media collaborators used while preparing a job
//
// - commands: ffmpeg/ffprobe command lines
// - processor: ffmpeg-backed converter and embedded subtitle extractor
// - timing: cue timestamp spans for candidate scoring

pub mod commands;
pub mod processor;
pub mod timing;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use commands::*;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;

pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "ass", "ssa", "vtt", "sub", "idx", "sup", "smi", "ttml", "dfxp"];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "webm", "wmv", "flv", "ts", "m2ts", "mpg", "mpeg", "ogv",
    // audio-only references work for speech-based tools too
    "mp3", "wav", "flac", "m4a", "aac", "ogg", "opus",
];

fn extension_of(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_lowercase)
}

pub fn is_subtitle(path: &Path) -> bool {
    extension_of(path).is_some_and(|e| SUBTITLE_EXTENSIONS.contains(&e.as_str()))
}

pub fn is_video(path: &Path) -> bool {
    extension_of(path).is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
}

/// Result of a conversion attempt; `path` is None when nothing usable was produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionOutcome {
    pub path: Option<PathBuf>,
    pub messages: Vec<String>,
}

/// Best embedded subtitle candidate and how well its timing matched the hint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutcome {
    pub path: Option<PathBuf>,
    pub score: f64,
    pub messages: Vec<String>,
}

/// Converts a subtitle into a format a tool reads natively
#[async_trait]
pub trait SubtitleConverter: Send + Sync {
    /// Write `converted_<stem>.<format>` into `output_dir`
    async fn convert(&self, input: &Path, output_dir: &Path, format: &str) -> Result<ConversionOutcome>;
}

/// Pulls subtitle streams out of a video container
#[async_trait]
pub trait SubtitleExtractor: Send + Sync {
    /// Extract every text subtitle stream of `video` into `output_dir` and pick the
    /// one whose timing best matches `hint`
    async fn extract(&self, video: &Path, hint: &Path, output_dir: &Path) -> Result<ExtractionOutcome>;
}

/// Factory for the ffmpeg-backed collaborators
pub struct MediaFactory;

impl MediaFactory {
    pub fn create_converter(config: &MediaConfig) -> Arc<dyn SubtitleConverter> {
        Arc::new(FfmpegConverter::new(config))
    }

    pub fn create_extractor(config: &MediaConfig) -> Arc<dyn SubtitleExtractor> {
        Arc::new(FfmpegExtractor::new(config))
    }
}
