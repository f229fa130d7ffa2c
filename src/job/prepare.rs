use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::OutputConfig;
use crate::error::{Result, SyncError};
use crate::tools::ToolDescriptor;

pub const BACKUP_PREFIX: &str = "backup_";

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Check both inputs before anything is prepared; returns them as absolute paths
pub fn validate_inputs(reference: &Path, subtitle: &Path) -> Result<(PathBuf, PathBuf)> {
    let reference = absolute(reference)?;
    let subtitle = absolute(subtitle)?;

    if reference == subtitle {
        return Err(SyncError::IdenticalInputs(subtitle));
    }

    match (reference.is_file(), subtitle.is_file()) {
        (false, false) => return Err(SyncError::MissingInputs { reference, subtitle }),
        (false, true) => return Err(SyncError::MissingReference(reference)),
        (true, false) => return Err(SyncError::MissingSubtitle(subtitle)),
        (true, true) => {}
    }

    if same_file(&reference, &subtitle) {
        return Err(SyncError::IdenticalInputs(subtitle));
    }
    Ok((reference, subtitle))
}

/// `<dir>/<stem>.<suffix>.<ext>`, keeping the subtitle's format when the tool can write it
pub fn default_output_path(subtitle: &Path, tool: &ToolDescriptor, output: &OutputConfig) -> PathBuf {
    let dir = output
        .directory
        .clone()
        .or_else(|| subtitle.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let stem = subtitle
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "subtitle".to_string());
    let extension = match subtitle.extension().and_then(|e| e.to_str()) {
        Some(ext) if tool.supports_format(ext) => ext.to_string(),
        _ => tool.preferred_format().to_string(),
    };
    let suffix = output.suffix.trim_matches('.');
    let name = if suffix.is_empty() {
        format!("{}.{}", stem, extension)
    } else {
        format!("{}.{}.{}", stem, suffix, extension)
    };
    dir.join(name)
}

/// Resolve the output path and make sure the tool cannot clobber an input with it
pub fn resolve_output(explicit: Option<&Path>, computed: PathBuf, inputs: &[&Path]) -> Result<PathBuf> {
    let output = match explicit {
        Some(path) => absolute(path)?,
        None => absolute(&computed)?,
    };
    if inputs.iter().any(|input| *input == output || same_file(input, &output)) {
        return Err(SyncError::OutputConflict(output));
    }
    Ok(output)
}

/// First free `backup_<name>` next to `output`, then `backup_<stem>_1.<ext>`, ...
pub fn backup_path(output: &Path) -> PathBuf {
    let dir = output.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = output.extension().map(|e| e.to_string_lossy().into_owned());

    let name = |n: u32| {
        let stem = if n == 0 { stem.clone() } else { format!("{}_{}", stem, n) };
        match &extension {
            Some(ext) => format!("{}{}.{}", BACKUP_PREFIX, stem, ext),
            None => format!("{}{}", BACKUP_PREFIX, stem),
        }
    };

    let mut n = 0;
    loop {
        let candidate = dir.join(name(n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Copy of an output that existed before the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub output: PathBuf,
    pub copy: PathBuf,
}

impl Backup {
    /// Put the previous content back when a failed run left the output path empty
    pub async fn restore_if_missing(&self) -> Result<bool> {
        if self.output.exists() {
            return Ok(false);
        }
        tokio::fs::copy(&self.copy, &self.output).await.map_err(|e| {
            SyncError::Backup(format!("{} -> {}: {}", self.copy.display(), self.output.display(), e))
        })?;
        debug!("Restored {} from {}", self.output.display(), self.copy.display());
        Ok(true)
    }
}

/// Copy an existing output aside; the original stays in place until the tool replaces it
pub async fn backup_existing(output: &Path) -> Result<Option<Backup>> {
    if !output.exists() {
        return Ok(None);
    }
    let copy = backup_path(output);
    tokio::fs::copy(output, &copy)
        .await
        .map_err(|e| SyncError::Backup(format!("{} -> {}: {}", output.display(), copy.display(), e)))?;
    debug!("Backed up {} to {}", output.display(), copy.display());
    Ok(Some(Backup {
        output: output.to_path_buf(),
        copy,
    }))
}

/// Rename, falling back to copy and delete across filesystems
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_err() {
        tokio::fs::copy(from, to).await?;
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}

/// Per-job directory for converted, extracted and rewritten files
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub async fn create(root: &Path, id: Uuid) -> Result<Self> {
        let path = root.join(format!("autosubsync-{}", id));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn!("Failed to remove work directory {}: {}", self.path.display(), e);
        }
    }
}

/// Remembers what sat at the output path before the tool ran
#[derive(Debug)]
pub struct OutputGuard {
    path: PathBuf,
    before: Option<SystemTime>,
}

impl OutputGuard {
    pub fn new(path: PathBuf) -> Self {
        let before = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self { path, before }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file exists and was (re)written since the guard was taken
    pub fn written(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => match self.before {
                None => true,
                Some(before) => meta.modified().map(|m| m != before).unwrap_or(true),
            },
            Err(_) => false,
        }
    }

    /// Delete whatever the tool left behind
    pub async fn discard(&self) {
        if !self.written() {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed partial output {}", self.path.display()),
            Err(e) => warn!("Failed to remove partial output {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin_tools;
    use assert_fs::prelude::*;

    fn tool(name: &str) -> ToolDescriptor {
        builtin_tools().into_iter().find(|t| t.name == name).unwrap()
    }

    #[test]
    fn distinguishes_missing_inputs() {
        let temp = assert_fs::TempDir::new().unwrap();
        let video = temp.child("ep01.mkv");
        let subtitle = temp.child("ep01.srt");

        let err = validate_inputs(video.path(), subtitle.path()).unwrap_err();
        assert!(matches!(err, SyncError::MissingInputs { .. }));

        video.touch().unwrap();
        let err = validate_inputs(video.path(), subtitle.path()).unwrap_err();
        assert!(matches!(err, SyncError::MissingSubtitle(_)));

        let err = validate_inputs(subtitle.path(), video.path()).unwrap_err();
        assert!(matches!(err, SyncError::MissingReference(_)));

        subtitle.touch().unwrap();
        assert!(validate_inputs(video.path(), subtitle.path()).is_ok());
    }

    #[test]
    fn identical_paths_are_rejected_even_when_missing() {
        let err = validate_inputs(Path::new("ep01.srt"), Path::new("./ep01.srt")).unwrap_err();
        assert!(matches!(err, SyncError::IdenticalInputs(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_inputs_are_identical() {
        let temp = assert_fs::TempDir::new().unwrap();
        let subtitle = temp.child("ep01.srt");
        subtitle.touch().unwrap();
        let link = temp.child("link.srt");
        std::os::unix::fs::symlink(subtitle.path(), link.path()).unwrap();

        let err = validate_inputs(link.path(), subtitle.path()).unwrap_err();
        assert!(matches!(err, SyncError::IdenticalInputs(_)));
    }

    #[test]
    fn default_output_keeps_supported_format() {
        let output = OutputConfig::default();
        let path = default_output_path(Path::new("/tv/ep01.srt"), &tool("ffsubsync"), &output);
        assert_eq!(path, PathBuf::from("/tv/ep01.synced.srt"));

        let path = default_output_path(Path::new("/tv/ep01.vtt"), &tool("alass"), &output);
        assert_eq!(path, PathBuf::from("/tv/ep01.synced.srt"));

        let output = OutputConfig {
            directory: Some(PathBuf::from("/out")),
            suffix: "fixed".to_string(),
        };
        let path = default_output_path(Path::new("/tv/ep01.ass"), &tool("alass"), &output);
        assert_eq!(path, PathBuf::from("/out/ep01.fixed.ass"));
    }

    #[test]
    fn output_must_not_replace_an_input() {
        let err = resolve_output(
            Some(Path::new("/tv/ep01.srt")),
            PathBuf::from("/tv/ep01.synced.srt"),
            &[Path::new("/tv/ep01.mkv"), Path::new("/tv/ep01.srt")],
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::OutputConflict(_)));
    }

    #[tokio::test]
    async fn backups_avoid_collisions() {
        let temp = assert_fs::TempDir::new().unwrap();
        let output = temp.child("ep01.synced.srt");
        temp.child("backup_ep01.synced.srt").write_str("older").unwrap();
        output.write_str("previous run").unwrap();

        let backup = backup_existing(output.path()).await.unwrap().unwrap();
        assert_eq!(backup.copy, temp.path().join("backup_ep01.synced_1.srt"));
        assert_eq!(std::fs::read_to_string(&backup.copy).unwrap(), "previous run");
        output.assert("previous run");

        let again = backup_existing(output.path()).await.unwrap().unwrap();
        assert_eq!(again.copy, temp.path().join("backup_ep01.synced_2.srt"));

        assert_eq!(backup_existing(&temp.path().join("missing.srt")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn backup_is_restored_only_when_the_output_is_gone() {
        let temp = assert_fs::TempDir::new().unwrap();
        let output = temp.child("ep01.synced.srt");
        output.write_str("previous run").unwrap();
        let backup = backup_existing(output.path()).await.unwrap().unwrap();

        output.write_str("fresh result").unwrap();
        assert!(!backup.restore_if_missing().await.unwrap());
        output.assert("fresh result");

        std::fs::remove_file(output.path()).unwrap();
        assert!(backup.restore_if_missing().await.unwrap());
        output.assert("previous run");
        temp.child("backup_ep01.synced.srt").assert("previous run");
    }

    #[tokio::test]
    async fn guard_only_discards_fresh_output() {
        let temp = assert_fs::TempDir::new().unwrap();
        let output = temp.child("out.srt");
        output.write_str("user file").unwrap();

        let guard = OutputGuard::new(output.to_path_buf());
        assert!(!guard.written());
        guard.discard().await;
        assert!(output.path().exists());

        std::fs::remove_file(output.path()).unwrap();
        let guard = OutputGuard::new(output.to_path_buf());
        output.write_str("partial").unwrap();
        assert!(guard.written());
        guard.discard().await;
        assert!(!output.path().exists());
    }
}
