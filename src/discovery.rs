//! Building batch inputs: directory pairing and TOML manifests.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::media::{is_subtitle, is_video};

/// Preference when several subtitles share a video's stem
const SUBTITLE_PREFERENCE: &[&str] = &["srt", "ass", "ssa", "vtt", "sub"];

/// Prefixes of files this crate writes next to the inputs
const GENERATED_PREFIXES: &[&str] = &["backup_", "converted_"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MediaPair {
    pub reference: PathBuf,
    pub subtitle: PathBuf,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl MediaPair {
    pub fn new(reference: PathBuf, subtitle: PathBuf) -> Self {
        Self {
            reference,
            subtitle,
            tool: None,
            output: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "pair")]
    pairs: Vec<MediaPair>,
}

/// Load `[[pair]]` entries; relative paths are resolved against the manifest's directory
pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Vec<MediaPair>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("Failed to read manifest {}: {}", path.display(), e)))?;
    let manifest: Manifest = toml::from_str(&content)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    Ok(manifest
        .pairs
        .into_iter()
        .map(|mut pair| {
            pair.reference = base.join(&pair.reference);
            pair.subtitle = base.join(&pair.subtitle);
            pair.output = pair.output.map(|o| base.join(o));
            pair
        })
        .collect())
}

fn stem_of(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

fn is_generated(path: &Path, suffix: &str) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let synced_marker = format!(".{}", suffix);
    GENERATED_PREFIXES.iter().any(|p| name.starts_with(p))
        || stem_of(path).is_some_and(|stem| stem.ends_with(&synced_marker))
}

fn preference(path: &Path) -> usize {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    SUBTITLE_PREFERENCE
        .iter()
        .position(|e| *e == extension)
        .unwrap_or(SUBTITLE_PREFERENCE.len())
}

/// Pair every video under `dir` with the subtitle in the same folder sharing its stem.
///
/// Outputs of earlier runs (`<stem>.<suffix>.<ext>`) and temporaries are ignored.
/// Pairs come back sorted by video path.
pub fn discover_pairs<P: AsRef<Path>>(dir: P, suffix: &str) -> Result<Vec<MediaPair>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(SyncError::Config(format!("{} is not a directory", dir.display())));
    }

    let mut videos = Vec::new();
    let mut subtitles: BTreeMap<(PathBuf, String), Vec<PathBuf>> = BTreeMap::new();

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || is_generated(path, suffix) {
            continue;
        }
        let (Some(parent), Some(stem)) = (path.parent(), stem_of(path)) else {
            continue;
        };
        if is_video(path) {
            videos.push(path.to_path_buf());
        } else if is_subtitle(path) {
            subtitles
                .entry((parent.to_path_buf(), stem))
                .or_default()
                .push(path.to_path_buf());
        }
    }

    videos.sort();
    let mut pairs = Vec::new();
    for video in videos {
        let (Some(parent), Some(stem)) = (video.parent(), stem_of(&video)) else {
            continue;
        };
        match subtitles.get(&(parent.to_path_buf(), stem)) {
            Some(candidates) => {
                let subtitle = candidates
                    .iter()
                    .min_by_key(|p| (preference(p), (*p).clone()))
                    .cloned();
                if let Some(subtitle) = subtitle {
                    pairs.push(MediaPair::new(video, subtitle));
                }
            }
            None => debug!("No subtitle for {}", video.display()),
        }
    }

    info!("Found {} video/subtitle pairs in {}", pairs.len(), dir.display());
    Ok(pairs)
}
