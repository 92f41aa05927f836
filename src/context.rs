use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::outputs::OutputValue;
use crate::stack::{ConfigMap, StackName};

/// The CLI command that started the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliCommand {
    Init,
    App,
    Destroy,
}

impl fmt::Display for CliCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CliCommand::Init => "init",
            CliCommand::App => "app",
            CliCommand::Destroy => "destroy",
        };
        write!(f, "{}", name)
    }
}

/// An output of another stack that a stack reads while being applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OutputRef {
    pub stack: String,
    pub output: String,
}

impl OutputRef {
    pub fn new(stack: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stack, self.output)
    }
}

pub type ResolvedReferences = BTreeMap<OutputRef, OutputValue>;

/// Everything a program factory may read while building the program of one stack.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub command: CliCommand,
    pub project: String,
    pub organization: String,
    pub stack: StackName,
    pub global_config: ConfigMap,
    /// Global entries merged with the stack's own entries.
    pub config: ConfigMap,
    pub references: ResolvedReferences,
}

impl ExecutionContext {
    pub fn reference(&self, stack: &str, output: &str) -> Option<&OutputValue> {
        self.references.get(&OutputRef::new(stack, output))
    }

    /// References as a JSON document `{ "<stack>": { "<output>": value } }`.
    pub fn references_json(&self) -> serde_json::Value {
        let mut by_stack = serde_json::Map::new();
        for (reference, value) in &self.references {
            let entry = by_stack
                .entry(reference.stack.clone())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if let serde_json::Value::Object(outputs) = entry {
                outputs.insert(reference.output.clone(), value.value.clone());
            }
        }
        serde_json::Value::Object(by_stack)
    }
}
