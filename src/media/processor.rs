use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

use super::timing::{read_span, TimingSpan};
use super::{ConversionOutcome, ExtractionOutcome, MediaCommandBuilder, SubtitleConverter, SubtitleExtractor};
use crate::config::MediaConfig;
use crate::error::{Result, SyncError};

/// Formats ffmpeg can write as subtitle output
const WRITABLE_FORMATS: &[&str] = &["srt", "ass", "ssa", "vtt"];

/// Image-based codecs that cannot be turned into text cues
const BITMAP_CODECS: &[&str] = &["hdmv_pgs_subtitle", "dvd_subtitle", "dvb_subtitle", "xsub"];

pub const EXTRACTED_DIR: &str = "extracted";

/// ffmpeg-backed subtitle format conversion
pub struct FfmpegConverter {
    command_builder: MediaCommandBuilder,
}

impl FfmpegConverter {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            command_builder: MediaCommandBuilder::new(&config.ffmpeg, &config.ffprobe),
        }
    }
}

#[async_trait]
impl SubtitleConverter for FfmpegConverter {
    async fn convert(&self, input: &Path, output_dir: &Path, format: &str) -> Result<ConversionOutcome> {
        let mut messages = Vec::new();
        let format = if WRITABLE_FORMATS.contains(&format) {
            format
        } else {
            messages.push(format!("Cannot write {} subtitles, converting to srt instead", format));
            "srt"
        };

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "subtitle".to_string());
        let output = output_dir.join(format!("converted_{}.{}", stem, format));

        info!("Converting {} to {}", input.display(), output.display());
        tokio::fs::create_dir_all(output_dir).await?;

        match self.command_builder.convert_subtitle(input, &output).execute().await {
            Ok(()) if output.exists() => {
                messages.push(format!("Converted {} to {}", input.display(), format));
                Ok(ConversionOutcome { path: Some(output), messages })
            }
            Ok(()) => {
                messages.push(format!("Conversion of {} produced no file", input.display()));
                Ok(ConversionOutcome { path: None, messages })
            }
            Err(e) => {
                warn!("Conversion failed: {}", e);
                messages.push(e.to_string());
                Ok(ConversionOutcome { path: None, messages })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: u32,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    tags: Option<ProbeTags>,
}

#[derive(Debug, Deserialize)]
struct ProbeTags {
    #[serde(default)]
    language: Option<String>,
}

impl ProbeStream {
    fn is_text(&self) -> bool {
        self.codec_name
            .as_deref()
            .is_none_or(|codec| !BITMAP_CODECS.contains(&codec))
    }

    fn language(&self) -> &str {
        self.tags
            .as_ref()
            .and_then(|t| t.language.as_deref())
            .unwrap_or("und")
    }
}

fn parse_probe(json: &str) -> Result<Vec<ProbeStream>> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| SyncError::Extraction(format!("unreadable ffprobe output: {}", e)))?;
    Ok(probe.streams)
}

/// Pick the candidate whose span is closest to the hint; without a hint span, the first one
fn best_candidate(candidates: &[(usize, Option<TimingSpan>)], hint: Option<&TimingSpan>) -> Option<(usize, f64)> {
    let Some(hint) = hint else {
        return candidates.first().map(|(i, _)| (*i, 0.0));
    };
    candidates
        .iter()
        .map(|(i, span)| (*i, span.map(|s| s.similarity(hint)).unwrap_or(0.0)))
        .fold(None, |best: Option<(usize, f64)>, (i, score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((i, score)),
        })
}

/// Embedded subtitle extraction through ffprobe and ffmpeg
pub struct FfmpegExtractor {
    command_builder: MediaCommandBuilder,
}

impl FfmpegExtractor {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            command_builder: MediaCommandBuilder::new(&config.ffmpeg, &config.ffprobe),
        }
    }
}

#[async_trait]
impl SubtitleExtractor for FfmpegExtractor {
    async fn extract(&self, video: &Path, hint: &Path, output_dir: &Path) -> Result<ExtractionOutcome> {
        let mut messages = Vec::new();
        let probe = self.command_builder.probe_subtitle_streams(video).output_text().await?;
        let streams: Vec<ProbeStream> = parse_probe(&probe)?.into_iter().filter(ProbeStream::is_text).collect();

        if streams.is_empty() {
            messages.push(format!("{} has no text subtitle streams", video.display()));
            return Ok(ExtractionOutcome { path: None, score: 0.0, messages });
        }

        let folder = output_dir.join(EXTRACTED_DIR);
        tokio::fs::create_dir_all(&folder).await?;
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());

        let mut paths = Vec::new();
        let mut candidates = Vec::new();
        for stream in &streams {
            let path = folder.join(format!("{}_{}_{}.srt", stem, stream.index, stream.language()));
            match self.command_builder.extract_subtitle_stream(video, stream.index, &path).execute().await {
                Ok(()) if path.exists() => {
                    debug!("Extracted stream {} to {}", stream.index, path.display());
                    candidates.push((paths.len(), read_span(&path).await));
                    paths.push(path);
                }
                Ok(()) => messages.push(format!("Stream {} produced no file", stream.index)),
                Err(e) => messages.push(format!("Stream {}: {}", stream.index, e)),
            }
        }

        let hint_span = read_span(hint).await;
        if hint_span.is_none() {
            messages.push(format!("No timing found in {}, using the first stream", hint.display()));
        }

        match best_candidate(&candidates, hint_span.as_ref()) {
            Some((i, score)) => {
                info!("Selected {} (score {:.2})", paths[i].display(), score);
                messages.push(format!("Selected {} (score {:.2})", paths[i].display(), score));
                Ok(ExtractionOutcome { path: Some(paths[i].clone()), score, messages })
            }
            None => Ok(ExtractionOutcome { path: None, score: 0.0, messages }),
        }
    }
}
