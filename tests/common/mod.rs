//! Fixtures for driving jobs through `/bin/sh` stand-ins for real tools.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use autosubsync::config::Config;
use autosubsync::job::JobContext;
use autosubsync::tools::{ExecutablePaths, ToolDescriptor, ToolKind};

/// Tool running `script` as `sh -c script sh <reference> <subtitle> <output>`
pub fn sh_tool(name: &str, script: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        kind: ToolKind::Executable,
        executable: ExecutablePaths::everywhere("/bin/sh"),
        module: None,
        command: ["-c", script, "sh", "{reference}", "{subtitle}", "{output}"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        options: Vec::new(),
        supports_subtitle_as_reference: true,
        supported_formats: vec!["srt".to_string(), "ass".to_string()],
        unsupported_path_chars: Vec::new(),
    }
}

/// Copies the subtitle to the output, printing carriage-return progress on the way
pub const COPY_WITH_PROGRESS: &str = r#"printf 'Loading\n'; printf ' 25%%\r'; printf ' 75%%\r'; printf '100%%\n'; cp "$2" "$3""#;

pub struct Workspace {
    pub dir: TempDir,
    pub config: Config,
}

impl Workspace {
    /// Registers `tools` plus a `copy` tool that is also the default
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.default_tool = "copy".to_string();
        config.work.directory = Some(dir.path().join("work"));
        config.process.grace_period_ms = 300;
        config.batch.item_delay_ms = 0;
        config.tools = tools;
        config.tools.push(sh_tool("copy", COPY_WITH_PROGRESS));
        Self { dir, config }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn context(&self) -> JobContext {
        JobContext::new(self.config.clone()).unwrap()
    }

    pub fn exists(&self, name: &str) -> bool {
        Path::new(&self.path(name)).exists()
    }
}
