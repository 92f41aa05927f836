use std::collections::BTreeMap;
use tracing::debug;

use crate::context::{OutputRef, ResolvedReferences};
use crate::engine::{self, Engine};
use crate::outputs::OutputMap;
use crate::stack::{self, StackName};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Stack {stack} does not exist; it must be applied before its outputs can be read")]
    StackNotFound { stack: String },

    #[error("Stack {stack} has no output `{output}`")]
    OutputNotFound { stack: String, output: String },

    #[error("Invalid referenced stack name: {0}")]
    InvalidName(#[from] stack::Error),

    #[error(transparent)]
    Engine(#[from] engine::Error),
}

/// Reads outputs of other stacks of the same project through the engine.
pub struct StackReferences<'a, E: Engine> {
    engine: &'a E,
    organization: &'a str,
    project: &'a str,
}

impl<'a, E: Engine> StackReferences<'a, E> {
    pub fn new(engine: &'a E, organization: &'a str, project: &'a str) -> Self {
        Self {
            engine,
            organization,
            project,
        }
    }

    /// Resolves every reference, reading each referenced stack once.
    pub async fn resolve(&self, references: &[OutputRef]) -> Result<ResolvedReferences, Error> {
        let mut by_stack: BTreeMap<&str, OutputMap> = BTreeMap::new();
        let mut resolved = ResolvedReferences::new();

        for reference in references {
            if !by_stack.contains_key(reference.stack.as_str()) {
                let outputs = self.stack_outputs(&reference.stack).await?;
                by_stack.insert(&reference.stack, outputs);
            }

            let value = by_stack
                .get(reference.stack.as_str())
                .and_then(|outputs| outputs.get(&reference.output));

            match value {
                Some(value) => {
                    resolved.insert(reference.clone(), value.clone());
                }
                None => {
                    return Err(Error::OutputNotFound {
                        stack: reference.stack.clone(),
                        output: reference.output.clone(),
                    })
                }
            }
        }

        return Ok(resolved);
    }

    async fn stack_outputs(&self, stack: &str) -> Result<OutputMap, Error> {
        let name = StackName::parse(stack)?
            .or_organization(self.organization)
            .fully_qualified(self.project);
        debug!(stack = %name, "Reading stack outputs");

        match self.engine.outputs(&name).await? {
            Some(outputs) => Ok(outputs),
            None => Err(Error::StackNotFound {
                stack: name.to_string(),
            }),
        }
    }
}
