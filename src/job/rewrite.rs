use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

use crate::config::RewritePolicy;
use crate::error::{Result, SyncError};

/// Answer to a rewrite confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteDecision {
    pub rewrite: bool,
    /// Apply the same answer to every later path in this process
    pub remember: bool,
}

/// Asks whether a path the tool cannot parse may be rewritten
#[async_trait]
pub trait PathRewritePrompt: Send + Sync {
    async fn confirm(&self, path: &Path, offending: &[char]) -> RewriteDecision;
}

/// Prompt for unattended runs: never rewrite
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclineRewrite;

#[async_trait]
impl PathRewritePrompt for DeclineRewrite {
    async fn confirm(&self, _path: &Path, _offending: &[char]) -> RewriteDecision {
        RewriteDecision { rewrite: false, remember: false }
    }
}

/// Remembered answer, shared by every job of a process
#[derive(Debug, Default)]
pub struct RewritePreference {
    remembered: RwLock<Option<bool>>,
}

impl RewritePreference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<bool> {
        *self.remembered.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, rewrite: bool) {
        *self.remembered.write().unwrap_or_else(PoisonError::into_inner) = Some(rewrite);
    }
}

/// Decide for one path according to the policy, asking only when nothing is remembered
pub async fn should_rewrite(
    policy: RewritePolicy,
    prompt: &dyn PathRewritePrompt,
    preference: &RewritePreference,
    path: &Path,
    offending: &[char],
) -> bool {
    match policy {
        RewritePolicy::Always => true,
        RewritePolicy::Never => false,
        RewritePolicy::Ask => {
            if let Some(remembered) = preference.get() {
                return remembered;
            }
            let decision = prompt.confirm(path, offending).await;
            if decision.remember {
                preference.set(decision.rewrite);
            }
            decision.rewrite
        }
    }
}

/// Characters of `path` the tool cannot handle, in order of first appearance
pub fn offending_chars(path: &Path, unsupported: &[char]) -> Vec<char> {
    let text = path.to_string_lossy();
    let mut found: Vec<char> = Vec::new();
    for c in text.chars() {
        if unsupported.contains(&c) && !found.contains(&c) {
            found.push(c);
        }
    }
    found
}

pub fn sanitize_file_name(name: &str, unsupported: &[char]) -> String {
    name.chars()
        .map(|c| if unsupported.contains(&c) { '_' } else { c })
        .collect()
}

/// Sanitized location for `path` inside `work_dir`
pub fn sanitized_location(path: &Path, work_dir: &Path, unsupported: &[char]) -> Result<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SyncError::PathRewrite(format!("{} has no file name", path.display())))?;
    let target = work_dir.join(sanitize_file_name(&name, unsupported));
    if !offending_chars(&target, unsupported).is_empty() {
        return Err(SyncError::PathRewrite(format!(
            "work directory {} itself contains unsupported characters",
            work_dir.display()
        )));
    }
    Ok(target)
}

/// Copy an input to its sanitized location
pub async fn rewrite_input(path: &Path, work_dir: &Path, unsupported: &[char]) -> Result<PathBuf> {
    let target = sanitized_location(path, work_dir, unsupported)?;
    // a converted input may already sit in the work directory
    if target == path {
        return Ok(target);
    }
    let target = if target.exists() { unique(&target) } else { target };
    tokio::fs::copy(path, &target)
        .await
        .map_err(|e| SyncError::PathRewrite(format!("{} -> {}: {}", path.display(), target.display(), e)))?;
    info!("Rewrote {} as {}", path.display(), target.display());
    Ok(target)
}

fn unique(path: &Path) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let extension = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    (1..)
        .map(|n| dir.join(format!("{}_{}{}", stem, n, extension)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| {
            debug!("No free name next to {}", path.display());
            path.to_path_buf()
        })
}
