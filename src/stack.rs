use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Stack name must not be empty")]
    Empty,

    #[error("Invalid segment `{segment}` in stack name `{name}`")]
    InvalidSegment { name: String, segment: String },

    #[error("Stack name `{0}` has more than three segments")]
    TooManySegments(String),
}

/// A stack name as the engine understands it: `[organization/[project/]]stack`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackName {
    organization: Option<String>,
    project: Option<String>,
    stack: String,
}

impl StackName {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Empty);
        }

        let segments: Vec<&str> = raw.split('/').collect();
        for segment in &segments {
            if !is_valid_segment(segment) {
                return Err(Error::InvalidSegment {
                    name: raw.to_string(),
                    segment: segment.to_string(),
                });
            }
        }

        let name = match segments.as_slice() {
            [stack] => Self {
                organization: None,
                project: None,
                stack: stack.to_string(),
            },
            [organization, stack] => Self {
                organization: Some(organization.to_string()),
                project: None,
                stack: stack.to_string(),
            },
            [organization, project, stack] => Self {
                organization: Some(organization.to_string()),
                project: Some(project.to_string()),
                stack: stack.to_string(),
            },
            _ => return Err(Error::TooManySegments(raw.to_string())),
        };

        return Ok(name);
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    /// Fills in the organization when the name was given without one.
    pub fn or_organization(mut self, organization: &str) -> Self {
        if self.organization.is_none() {
            self.organization = Some(organization.to_string());
        }
        self
    }

    /// The `organization/project/stack` form used for stack references.
    pub fn fully_qualified(&self, project: &str) -> Self {
        Self {
            organization: self.organization.clone(),
            project: Some(self.project.clone().unwrap_or_else(|| project.to_string())),
            stack: self.stack.clone(),
        }
    }
}

impl fmt::Display for StackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(organization) = &self.organization {
            write!(f, "{}/", organization)?;
            // the engine cannot address `project/stack` without an organization
            if let Some(project) = &self.project {
                write!(f, "{}/", project)?;
            }
        }
        write!(f, "{}", self.stack)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue {
    pub value: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secret: bool,
}

impl ConfigValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: true,
        }
    }

    /// The value as it may appear in logs and local files.
    pub fn display_value(&self) -> &str {
        if self.secret {
            "[secret]"
        } else {
            &self.value
        }
    }
}

/// Configuration entries for one stack, keyed by config key (e.g. `aws:region`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigMap(BTreeMap<String, ConfigValue>);

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ConfigValue) -> Option<ConfigValue> {
        self.0.insert(key.into(), value)
    }

    pub fn with(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.0.iter()
    }

    /// Layers `self` over `global`. Entries of `self` win on collision; the
    /// overridden keys are returned alongside the merged map.
    pub fn merged_over(&self, global: &ConfigMap) -> (ConfigMap, Vec<String>) {
        let mut merged = global.clone();
        let mut overridden = Vec::new();

        for (key, value) in &self.0 {
            if merged.insert(key.clone(), value.clone()).is_some() {
                overridden.push(key.clone());
            }
        }

        return (merged, overridden);
    }
}
