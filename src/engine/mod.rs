//! The external provisioning engine the driver delegates all state management to.

use async_trait::async_trait;

use crate::outputs::OutputMap;
use crate::stack::{ConfigMap, StackName};

#[cfg(test)]
pub mod memory;
pub mod pulumi;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Unable to read outputs of stack {stack}: {source}")]
    Outputs {
        stack: String,
        #[source]
        source: crate::outputs::Error,
    },

    #[error("Unable to read the stack list: {0}")]
    StackList(String),

    #[error("Engine rejected the operation: {0}")]
    Rejected(String),
}

/// Operations the driver needs from the engine, one stack at a time.
///
/// Every call completes (or fails) before the driver issues the next one.
#[async_trait]
pub trait Engine: Send + Sync {
    /// What a program factory produces for this engine.
    type Program: Send;

    /// Selects the stack, creating it when it does not exist yet.
    async fn select_or_create(&self, stack: &StackName) -> Result<(), Error>;

    /// Selects an existing stack; a missing stack is an error.
    async fn select(&self, stack: &StackName) -> Result<(), Error>;

    /// Stacks of the project that currently exist in the backend.
    async fn list_stacks(&self) -> Result<Vec<StackName>, Error>;

    async fn set_config(&self, stack: &StackName, config: &ConfigMap) -> Result<(), Error>;

    /// Applies the program and returns the stack outputs after the update.
    async fn up(&self, stack: &StackName, program: Self::Program) -> Result<OutputMap, Error>;

    /// Outputs of a stack, or `None` when the stack does not exist.
    async fn outputs(&self, stack: &StackName) -> Result<Option<OutputMap>, Error>;

    async fn destroy(&self, stack: &StackName) -> Result<(), Error>;

    /// Deletes the stack together with its history and configuration.
    async fn remove(&self, stack: &StackName) -> Result<(), Error>;
}
