use std::collections::BTreeMap;
use std::path::Path;

use super::{OptionValue, ToolDescriptor};
use crate::error::{Result, SyncError};

/// Resolved file paths substituted into a command template
#[derive(Debug, Clone, Copy)]
pub struct CommandPaths<'a> {
    pub reference: &'a Path,
    pub subtitle: &'a Path,
    pub output: &'a Path,
}

/// Expand the placeholders of a single template token
pub fn expand_token(token: &str, paths: &CommandPaths<'_>) -> String {
    token
        .replace("{reference}", &paths.reference.to_string_lossy())
        .replace("{subtitle}", &paths.subtitle.to_string_lossy())
        .replace("{output}", &paths.output.to_string_lossy())
}

/// Build the full argument vector: template, then changed options, then extra arguments.
///
/// Option values are looked up by name; unknown names are rejected so that a
/// typo never silently drops an argument.
pub fn build_arguments(
    tool: &ToolDescriptor,
    paths: &CommandPaths<'_>,
    values: &BTreeMap<String, OptionValue>,
    extra_args: &[String],
) -> Result<Vec<String>> {
    if let Some(unknown) = values.keys().find(|name| tool.option(name).is_none()) {
        return Err(SyncError::InvalidOption {
            option: unknown.clone(),
            reason: format!("tool '{}' has no such option", tool.name),
        });
    }

    let mut args: Vec<String> = tool.command.iter().map(|t| expand_token(t, paths)).collect();

    for option in &tool.options {
        if let Some(value) = values.get(&option.name) {
            args.extend(option.arguments(value)?);
        }
    }

    args.extend(extra_args.iter().cloned());
    Ok(args)
}
