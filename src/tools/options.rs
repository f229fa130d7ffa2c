use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SyncError};

/// Value type and constraints of a tool option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptionKind {
    /// Boolean switch; only the flag itself is passed when enabled
    Flag,
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Float {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Text,
    Choice { values: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Integer(i) => write!(f, "{}", i),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A single entry of a tool's options schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOption {
    pub name: String,
    /// Command line flag, e.g. `--max-offset-seconds`
    pub flag: String,
    pub kind: OptionKind,
    pub default: OptionValue,
}

impl ToolOption {
    pub fn new(name: &str, flag: &str, kind: OptionKind, default: OptionValue) -> Self {
        Self {
            name: name.to_string(),
            flag: flag.to_string(),
            kind,
            default,
        }
    }

    /// Check a value against this option's kind and range, returning it in canonical form.
    pub fn normalize(&self, value: &OptionValue) -> Result<OptionValue> {
        let invalid = |reason: String| SyncError::InvalidOption {
            option: self.name.clone(),
            reason,
        };

        match (&self.kind, value) {
            (OptionKind::Flag, OptionValue::Bool(b)) => Ok(OptionValue::Bool(*b)),
            (OptionKind::Integer { min, max }, OptionValue::Integer(i)) => {
                if min.is_some_and(|m| *i < m) || max.is_some_and(|m| *i > m) {
                    return Err(invalid(format!(
                        "{} is outside {}..={}",
                        i,
                        min.map_or("-inf".to_string(), |m| m.to_string()),
                        max.map_or("inf".to_string(), |m| m.to_string())
                    )));
                }
                Ok(OptionValue::Integer(*i))
            }
            (OptionKind::Float { min, max }, OptionValue::Integer(i)) => {
                self.check_float(*i as f64, *min, *max)
            }
            (OptionKind::Float { min, max }, OptionValue::Float(v)) => {
                self.check_float(*v, *min, *max)
            }
            (OptionKind::Text, OptionValue::Text(s)) => Ok(OptionValue::Text(s.clone())),
            (OptionKind::Choice { values }, OptionValue::Text(s)) => {
                if values.iter().any(|v| v == s) {
                    Ok(OptionValue::Text(s.clone()))
                } else {
                    Err(invalid(format!("'{}' is not one of {:?}", s, values)))
                }
            }
            (kind, value) => Err(invalid(format!("{:?} does not accept {:?}", kind, value))),
        }
    }

    fn check_float(&self, v: f64, min: Option<f64>, max: Option<f64>) -> Result<OptionValue> {
        if !v.is_finite() {
            return Err(SyncError::InvalidOption {
                option: self.name.clone(),
                reason: "value must be finite".to_string(),
            });
        }
        if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
            return Err(SyncError::InvalidOption {
                option: self.name.clone(),
                reason: format!(
                    "{} is outside {}..={}",
                    v,
                    min.map_or("-inf".to_string(), |m| m.to_string()),
                    max.map_or("inf".to_string(), |m| m.to_string())
                ),
            });
        }
        Ok(OptionValue::Float(v))
    }

    /// Parse a textual value (e.g. from the command line) according to this option's kind.
    pub fn parse_value(&self, raw: &str) -> Result<OptionValue> {
        let invalid = |reason: &str| SyncError::InvalidOption {
            option: self.name.clone(),
            reason: format!("cannot parse '{}' as {}", raw, reason),
        };

        let value = match &self.kind {
            OptionKind::Flag => match raw.to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => OptionValue::Bool(true),
                "false" | "no" | "off" | "0" => OptionValue::Bool(false),
                _ => return Err(invalid("a boolean")),
            },
            OptionKind::Integer { .. } => {
                OptionValue::Integer(raw.trim().parse().map_err(|_| invalid("an integer"))?)
            }
            OptionKind::Float { .. } => {
                OptionValue::Float(raw.trim().parse().map_err(|_| invalid("a number"))?)
            }
            OptionKind::Text | OptionKind::Choice { .. } => OptionValue::Text(raw.to_string()),
        };
        self.normalize(&value)
    }

    /// Command line arguments for `value`; empty when it equals the default.
    pub fn arguments(&self, value: &OptionValue) -> Result<Vec<String>> {
        let value = self.normalize(value)?;
        let default = self.normalize(&self.default)?;

        if values_equal(&value, &default) {
            return Ok(Vec::new());
        }

        Ok(match value {
            OptionValue::Bool(true) => vec![self.flag.clone()],
            // a flag switched off relative to an enabled default has no negated form
            OptionValue::Bool(false) => Vec::new(),
            other => vec![self.flag.clone(), other.to_string()],
        })
    }
}

fn values_equal(a: &OptionValue, b: &OptionValue) -> bool {
    match (a, b) {
        (OptionValue::Float(x), OptionValue::Float(y)) => (x - y).abs() <= f64::EPSILON,
        _ => a == b,
    }
}
