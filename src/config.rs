use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::tools::{builtin_tools, ToolDescriptor, ToolRegistry};

fn default_tool_name() -> String {
    "ffsubsync".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tool substituted when the selected one cannot take a subtitle as reference
    #[serde(default = "default_tool_name")]
    pub default_tool: String,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub work: WorkConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub media: MediaConfig,
    /// Tool registry; replaces the built-in descriptors when present
    #[serde(default = "builtin_tools")]
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for synchronized subtitles; defaults to the subtitle's directory
    pub directory: Option<PathBuf>,
    /// Inserted between the subtitle stem and extension: `ep01.synced.srt`
    pub suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Back up an existing file at the output location before the tool overwrites it
    pub enabled: bool,
    /// Keep backups after the job; otherwise they are removed with the other temporaries
    pub keep: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingPolicy {
    /// Leave the tool's output untouched
    Keep,
    /// Re-encode the output to the input subtitle's encoding
    MatchInput,
    /// Re-encode the output to `encoding.target`
    Force,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    pub policy: EncodingPolicy,
    /// Encoding label (WHATWG) used by the `force` policy
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewritePolicy {
    /// Ask through the configured prompt; the answer may be remembered
    Ask,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// What to do with paths containing characters the tool cannot parse
    pub rewrite: RewritePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkConfig {
    /// Parent of per-job work directories; defaults to the system temp dir
    pub directory: Option<PathBuf>,
    /// Keep converted/extracted temporaries after the job
    pub keep_temp_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Advertised terminal width for wrapped CLIs
    pub terminal_columns: u16,
    /// Bytes per read from the tool's output
    pub read_chunk_size: usize,
    /// Time between graceful termination and forced kill
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Python interpreter used for module tools
    pub python: String,
    /// Pipe poll timeout between cancellation checks
    pub poll_interval_ms: u64,
    /// Worker executable; defaults to the running binary
    pub program: Option<PathBuf>,
    /// Arguments placed before the `worker` subcommand
    pub program_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pause between items so consumers can flush UI state
    pub item_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub ffmpeg: String,
    /// Path to ffprobe binary
    pub ffprobe: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_tool: default_tool_name(),
            output: OutputConfig::default(),
            backup: BackupConfig::default(),
            encoding: EncodingConfig::default(),
            paths: PathsConfig::default(),
            work: WorkConfig::default(),
            process: ProcessConfig::default(),
            worker: WorkerConfig::default(),
            batch: BatchConfig::default(),
            media: MediaConfig::default(),
            tools: builtin_tools(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: None,
            suffix: "synced".to_string(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { enabled: true, keep: true }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            policy: EncodingPolicy::Keep,
            target: "utf-8".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { rewrite: RewritePolicy::Ask }
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            directory: None,
            keep_temp_files: false,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            terminal_columns: 80,
            read_chunk_size: 1024,
            grace_period_ms: 3000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            python: if cfg!(windows) { "python" } else { "python3" }.to_string(),
            poll_interval_ms: 100,
            program: None,
            program_args: Vec::new(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { item_delay_ms: 100 }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

impl ProcessConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl WorkConfig {
    pub fn root(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| SyncError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Build the read-only tool registry and check the default tool exists in it
    pub fn registry(&self) -> Result<ToolRegistry> {
        let registry = ToolRegistry::new(self.tools.clone())?;
        if !registry.contains(&self.default_tool) {
            return Err(SyncError::Config(format!(
                "Default tool '{}' is not defined",
                self.default_tool
            )));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            default_tool = "alass"

            [encoding]
            policy = "match-input"

            [batch]
            item_delay_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.default_tool, "alass");
        assert_eq!(config.encoding.policy, EncodingPolicy::MatchInput);
        assert_eq!(config.encoding.target, "utf-8");
        assert_eq!(config.batch.item_delay_ms, 0);
        assert_eq!(config.output.suffix, "synced");
        assert!(config.backup.enabled);
        assert_eq!(config.tools.len(), 3);
        assert!(config.registry().is_ok());
    }

    #[test]
    fn unknown_default_tool_is_a_config_error() {
        let config = Config {
            default_tool: "missing".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.registry(), Err(SyncError::Config(_))));
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autosubsync.toml");
        let mut config = Config::default();
        config.paths.rewrite = RewritePolicy::Never;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.paths.rewrite, RewritePolicy::Never);
        assert_eq!(loaded.tools, config.tools);
    }
}
