use crate::error::{ArgusError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// One step in the pipeline that narrows a response body down to a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UrlCommand {
    /// Take the last capture group (or the whole match) of the `index`-th
    /// match. Negative indexes count from the end.
    Regex {
        regex: String,
        #[serde(default, skip_serializing_if = "is_zero")]
        index: i64,
    },
    /// Take capture group `index` of the first match.
    RegexSubmatch {
        regex: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    Replace { old: String, new: String },
    Split {
        text: String,
        #[serde(default, skip_serializing_if = "is_zero")]
        index: i64,
    },
}

fn is_zero(i: &i64) -> bool {
    *i == 0
}

/// Resolve a possibly negative index against `len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    (0..len as i64).contains(&resolved).then_some(resolved as usize)
}

impl UrlCommand {
    pub fn run(&self, text: &str) -> Result<String> {
        match self {
            UrlCommand::Regex { regex, index } => {
                let re = Regex::new(regex)?;
                let matches: Vec<_> = re.captures_iter(text).collect();
                if matches.is_empty() {
                    return Err(ArgusError::NoMatch {
                        kind: "regex".into(),
                        pattern: regex.clone(),
                    });
                }
                let i = resolve_index(*index, matches.len()).ok_or_else(|| {
                    ArgusError::Query {
                        service: "url_commands".into(),
                        reason: format!(
                            "regex ({regex}) returned {} elements but the index wants element number {}",
                            matches.len(),
                            index + 1
                        ),
                    }
                })?;
                let caps = &matches[i];
                Ok(caps
                    .get(caps.len() - 1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default())
            }
            UrlCommand::RegexSubmatch { regex, index } => {
                let re = Regex::new(regex)?;
                let group = index.unwrap_or(1);
                re.captures(text)
                    .and_then(|caps| caps.get(group))
                    .map(|m| m.as_str().to_string())
                    .ok_or_else(|| ArgusError::NoMatch {
                        kind: "regex_submatch".into(),
                        pattern: regex.clone(),
                    })
            }
            UrlCommand::Replace { old, new } => Ok(text.replace(old.as_str(), new)),
            UrlCommand::Split { text: sep, index } => {
                let parts: Vec<&str> = text.split(sep.as_str()).collect();
                if parts.len() == 1 {
                    return Err(ArgusError::NoMatch {
                        kind: "split".into(),
                        pattern: sep.clone(),
                    });
                }
                let i = resolve_index(*index, parts.len()).ok_or_else(|| ArgusError::Query {
                    service: "url_commands".into(),
                    reason: format!(
                        "split ({sep}) returned {} elements but the index wants element number {}",
                        parts.len(),
                        index + 1
                    ),
                })?;
                Ok(parts[i].to_string())
            }
        }
    }

    fn validate(&self) -> Option<String> {
        match self {
            UrlCommand::Regex { regex, .. } | UrlCommand::RegexSubmatch { regex, .. } => {
                Regex::new(regex)
                    .err()
                    .map(|e| format!("regex {regex:?} <invalid> ({e})"))
            }
            UrlCommand::Split { text, .. } if text.is_empty() => {
                Some("split text: <required>".into())
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// UrlCommands
// ---------------------------------------------------------------------------

/// Ordered list of [`UrlCommand`]s. A single mapping in YAML is accepted as a
/// one-element list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct UrlCommands(pub Vec<UrlCommand>);

impl<'de> Deserialize<'de> for UrlCommands {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            Many(Vec<UrlCommand>),
            One(UrlCommand),
        }
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::Many(v) => UrlCommands(v),
            OneOrMany::One(c) => UrlCommands(vec![c]),
        })
    }
}

impl UrlCommands {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Run every command in order, feeding each output into the next.
    pub fn run(&self, text: &str) -> Result<String> {
        let mut current = text.to_string();
        for command in &self.0 {
            let next = command.run(&current)?;
            tracing::trace!(result = %next, "url_command applied");
            current = next;
        }
        Ok(current)
    }

    pub fn validate(&self) -> Vec<String> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.validate().map(|p| format!("item_{i}: {p}")))
            .collect()
    }
}
