// Synchronization tool descriptors
//
// A tool is described once, from static configuration, and never mutated:
// - options: typed option schema and argument emission
// - command: placeholder expansion into a final argument vector

pub mod command;
pub mod options;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub use command::*;
pub use options::*;

use crate::error::{Result, SyncError};

/// How a tool is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Standalone executable, run through the process runner
    Executable,
    /// Importable Python entry point, run inside an isolated worker process
    Module,
}

/// Executable path per operating system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutablePaths {
    #[serde(default)]
    pub linux: Option<String>,
    #[serde(default)]
    pub macos: Option<String>,
    #[serde(default)]
    pub windows: Option<String>,
    /// Used when the current OS has no dedicated entry
    #[serde(default)]
    pub default: Option<String>,
}

impl ExecutablePaths {
    pub fn everywhere<S: Into<String>>(path: S) -> Self {
        Self {
            default: Some(path.into()),
            ..Self::default()
        }
    }

    /// Resolve the executable for `os` (one of `std::env::consts::OS`)
    pub fn resolve_for(&self, os: &str) -> Option<&str> {
        let specific = match os {
            "linux" => self.linux.as_deref(),
            "macos" => self.macos.as_deref(),
            "windows" => self.windows.as_deref(),
            _ => None,
        };
        specific.or(self.default.as_deref())
    }

    pub fn resolve(&self) -> Option<&str> {
        self.resolve_for(std::env::consts::OS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub kind: ToolKind,
    #[serde(default)]
    pub executable: ExecutablePaths,
    /// Python entry point (`package.module:function`) for module tools
    #[serde(default)]
    pub module: Option<String>,
    /// Argument template with `{reference}`, `{subtitle}` and `{output}` placeholders
    pub command: Vec<String>,
    #[serde(default)]
    pub options: Vec<ToolOption>,
    #[serde(default)]
    pub supports_subtitle_as_reference: bool,
    /// Subtitle extensions the tool reads natively (lowercase, without dot)
    #[serde(default)]
    pub supported_formats: Vec<String>,
    /// Characters the tool cannot handle in file paths
    #[serde(default)]
    pub unsupported_path_chars: Vec<char>,
}

impl ToolDescriptor {
    pub fn program(&self) -> Option<&str> {
        self.executable.resolve()
    }

    pub fn option(&self, name: &str) -> Option<&ToolOption> {
        self.options.iter().find(|o| o.name == name)
    }

    /// Whether the tool reads subtitles with this extension without conversion
    pub fn supports_format(&self, extension: &str) -> bool {
        let extension = extension.trim_start_matches('.').to_lowercase();
        self.supported_formats.iter().any(|f| f.eq_ignore_ascii_case(&extension))
    }

    pub fn supports_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.supports_format(e))
    }

    /// Whether the tool can be handed this path as-is
    pub fn accepts_path(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        !self.unsupported_path_chars.iter().any(|c| text.contains(*c))
    }

    /// Format used for converted inputs and for outputs of unsupported formats
    pub fn preferred_format(&self) -> &str {
        self.supported_formats.first().map(String::as_str).unwrap_or("srt")
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Config("Tool with empty name".to_string()));
        }
        match self.kind {
            ToolKind::Executable if self.program().is_none() => {
                return Err(SyncError::Config(format!(
                    "Tool '{}' has no executable for {}",
                    self.name,
                    std::env::consts::OS
                )));
            }
            ToolKind::Module if self.module.as_deref().is_none_or(|m| m.trim().is_empty()) => {
                return Err(SyncError::Config(format!(
                    "Module tool '{}' has no module entry point",
                    self.name
                )));
            }
            _ => {}
        }
        for option in &self.options {
            option.normalize(&option.default)?;
        }
        Ok(())
    }
}

/// Read-only lookup of tool descriptors by name
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new(descriptors: Vec<ToolDescriptor>) -> Result<Self> {
        let mut registry = Self::default();
        for descriptor in descriptors {
            descriptor.validate()?;
            if registry.tools.contains_key(&descriptor.name) {
                return Err(SyncError::Config(format!(
                    "Tool '{}' is defined more than once",
                    descriptor.name
                )));
            }
            registry.order.push(descriptor.name.clone());
            registry.tools.insert(descriptor.name.clone(), Arc::new(descriptor));
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ToolDescriptor>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Descriptors in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ToolDescriptor>> {
        self.order.iter().filter_map(|name| self.tools.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Descriptors shipped with the default configuration
pub fn builtin_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "ffsubsync".to_string(),
            kind: ToolKind::Module,
            executable: ExecutablePaths::default(),
            module: Some("ffsubsync.ffsubsync:main".to_string()),
            command: vec![
                "{reference}".to_string(),
                "-i".to_string(),
                "{subtitle}".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
            ],
            options: vec![
                ToolOption::new(
                    "max-offset-seconds",
                    "--max-offset-seconds",
                    OptionKind::Integer { min: Some(1), max: Some(3600) },
                    OptionValue::Integer(60),
                ),
                ToolOption::new(
                    "vad",
                    "--vad",
                    OptionKind::Choice {
                        values: vec![
                            "subs_then_webrtc".to_string(),
                            "webrtc".to_string(),
                            "subs_then_auditok".to_string(),
                            "auditok".to_string(),
                            "subs_then_silero".to_string(),
                            "silero".to_string(),
                        ],
                    },
                    OptionValue::Text("subs_then_webrtc".to_string()),
                ),
                ToolOption::new("no-fix-framerate", "--no-fix-framerate", OptionKind::Flag, OptionValue::Bool(false)),
                ToolOption::new("gss", "--gss", OptionKind::Flag, OptionValue::Bool(false)),
            ],
            supports_subtitle_as_reference: true,
            supported_formats: vec!["srt".to_string(), "ass".to_string(), "ssa".to_string(), "sub".to_string()],
            unsupported_path_chars: Vec::new(),
        },
        ToolDescriptor {
            name: "alass".to_string(),
            kind: ToolKind::Executable,
            executable: ExecutablePaths {
                linux: Some("alass-cli".to_string()),
                macos: Some("alass-cli".to_string()),
                windows: Some("alass-cli.exe".to_string()),
                default: Some("alass".to_string()),
            },
            module: None,
            command: vec!["{reference}".to_string(), "{subtitle}".to_string(), "{output}".to_string()],
            options: vec![
                ToolOption::new(
                    "split-penalty",
                    "--split-penalty",
                    OptionKind::Float { min: Some(0.0), max: Some(1000.0) },
                    OptionValue::Float(7.0),
                ),
                ToolOption::new("no-split", "--no-split", OptionKind::Flag, OptionValue::Bool(false)),
                ToolOption::new(
                    "disable-fps-guessing",
                    "--disable-fps-guessing",
                    OptionKind::Flag,
                    OptionValue::Bool(false),
                ),
            ],
            supports_subtitle_as_reference: true,
            supported_formats: vec!["srt".to_string(), "ass".to_string(), "ssa".to_string(), "idx".to_string()],
            unsupported_path_chars: vec!['[', ']'],
        },
        ToolDescriptor {
            name: "autosubsync".to_string(),
            // shares its console script name with this binary, so always go through the module
            kind: ToolKind::Module,
            executable: ExecutablePaths::default(),
            module: Some("autosubsync.main:cli".to_string()),
            command: vec!["{reference}".to_string(), "{subtitle}".to_string(), "{output}".to_string()],
            options: Vec::new(),
            supports_subtitle_as_reference: false,
            supported_formats: vec!["srt".to_string()],
            unsupported_path_chars: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builtin_registry_is_valid() {
        let registry = ToolRegistry::new(builtin_tools()).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("alass").unwrap().kind, ToolKind::Executable);
        assert!(matches!(registry.get("nope"), Err(SyncError::UnknownTool(_))));
        let names: Vec<_> = registry.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["ffsubsync", "alass", "autosubsync"]);
    }

    #[test]
    fn builtin_tools_never_launch_this_binary() {
        let own_name = env!("CARGO_PKG_NAME");
        for tool in builtin_tools() {
            let programs = [
                &tool.executable.linux,
                &tool.executable.macos,
                &tool.executable.windows,
                &tool.executable.default,
            ];
            for program in programs.into_iter().flatten() {
                let stem = Path::new(program).file_stem().and_then(|s| s.to_str());
                assert_ne!(stem, Some(own_name), "{} would run {}", tool.name, program);
            }
        }
        let autosubsync = builtin_tools().into_iter().find(|t| t.name == "autosubsync").unwrap();
        assert_eq!(autosubsync.kind, ToolKind::Module);
        assert_eq!(autosubsync.module.as_deref(), Some("autosubsync.main:cli"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut tools = builtin_tools();
        tools.push(tools[0].clone());
        assert!(ToolRegistry::new(tools).is_err());
    }

    #[test]
    fn resolves_executable_per_os() {
        let paths = ExecutablePaths {
            windows: Some("tool.exe".into()),
            default: Some("tool".into()),
            ..ExecutablePaths::default()
        };
        assert_eq!(paths.resolve_for("windows"), Some("tool.exe"));
        assert_eq!(paths.resolve_for("linux"), Some("tool"));
        assert_eq!(ExecutablePaths::default().resolve_for("linux"), None);
    }

    #[test]
    fn format_and_path_checks() {
        let alass = builtin_tools().into_iter().find(|t| t.name == "alass").unwrap();
        assert!(alass.supports_format("SRT"));
        assert!(alass.supports_file(&PathBuf::from("/tmp/x.ass")));
        assert!(!alass.supports_file(&PathBuf::from("/tmp/x.vtt")));
        assert!(!alass.accepts_path(&PathBuf::from("/tmp/[Group] Show 01.srt")));
        assert!(alass.accepts_path(&PathBuf::from("/tmp/Show 01.srt")));
    }

    #[test]
    fn descriptor_deserializes_from_toml() {
        let text = r#"
            name = "custom"
            kind = "executable"
            executable = { default = "custom-sync" }
            command = ["--ref", "{reference}", "{subtitle}", "-o", "{output}"]
            supported_formats = ["srt"]

            [[options]]
            name = "window"
            flag = "--window"
            kind = { type = "integer", min = 1, max = 10 }
            default = 5
        "#;
        let descriptor: ToolDescriptor = toml::from_str(text).unwrap();
        assert_eq!(descriptor.program(), Some("custom-sync"));
        assert_eq!(descriptor.options[0].default, OptionValue::Integer(5));
        assert!(!descriptor.supports_subtitle_as_reference);
    }
}
