//! Sequences stack operations against the engine.
//!
//! Every stack is brought up one at a time: select (or create) it, set the merged
//! configuration, resolve the outputs it reads from earlier stacks, build its program
//! from an explicit [`ExecutionContext`] and apply it. Teardown walks the same plan
//! backwards. Nothing is retried; the first error ends the run and a re-run relies on
//! the engine's idempotent apply and destroy.

use futures::future::BoxFuture;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::context::{CliCommand, ExecutionContext, OutputRef};
use crate::engine::{self, Engine};
use crate::outputs::OutputMap;
use crate::plan::{StackPlan, StackStep};
use crate::references::{self, StackReferences};
use crate::stack::{self, ConfigMap, StackName};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid stack name: {0}")]
    InvalidName(#[from] stack::Error),

    #[error("Stack {0} was already brought up in this run")]
    DuplicateStack(String),

    #[error("Unable to select stack {stack}: {source}")]
    Select {
        stack: String,
        #[source]
        source: engine::Error,
    },

    #[error("Unable to configure stack {stack}: {source}")]
    Configure {
        stack: String,
        #[source]
        source: engine::Error,
    },

    #[error("Unable to resolve references of stack {stack}: {source}")]
    Reference {
        stack: String,
        #[source]
        source: references::Error,
    },

    #[error("Unable to build the program of stack {stack}: {reason:#}")]
    Program { stack: String, reason: anyhow::Error },

    #[error("Update of stack {stack} failed: {source}")]
    Apply {
        stack: String,
        #[source]
        source: engine::Error,
    },

    #[error("Destroy of stack {stack} failed: {source}")]
    Destroy {
        stack: String,
        #[source]
        source: engine::Error,
    },

    #[error("Unable to list the stacks of the project: {0}")]
    List(#[source] engine::Error),

    #[error("Removal of stack {stack} failed: {source}")]
    Remove {
        stack: String,
        #[source]
        source: engine::Error,
    },

    #[error("After-run hook of stack {stack} failed: {reason:#}")]
    Hook { stack: String, reason: anyhow::Error },
}

/// Builds the program of one stack from its execution context.
pub type ProgramFactory<P> = Box<dyn FnOnce(&ExecutionContext) -> anyhow::Result<P> + Send>;

pub struct StackUpOptions<P> {
    pub config: ConfigMap,
    pub references: Vec<OutputRef>,
    pub create_program: ProgramFactory<P>,
}

impl<P> StackUpOptions<P> {
    pub fn new(
        create_program: impl FnOnce(&ExecutionContext) -> anyhow::Result<P> + Send + 'static,
    ) -> Self {
        Self {
            config: ConfigMap::new(),
            references: Vec::new(),
            create_program: Box::new(create_program),
        }
    }

    pub fn config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    pub fn references(mut self, references: Vec<OutputRef>) -> Self {
        self.references = references;
        self
    }
}

/// What the after-run hook is told once a stack operation has completed.
#[derive(Debug, Clone, PartialEq)]
pub enum AfterRun {
    Up { stack: StackName, config: ConfigMap },
    Destroy { stack: StackName, remove: bool },
}

type BeforeRunHook = Box<dyn Fn(&StackName) + Send + Sync>;
type AfterRunHook = Box<dyn Fn(AfterRun) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    before_run: Option<BeforeRunHook>,
    after_run: Option<AfterRunHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_run(mut self, hook: impl Fn(&StackName) + Send + Sync + 'static) -> Self {
        self.before_run = Some(Box::new(hook));
        self
    }

    pub fn after_run(
        mut self,
        hook: impl Fn(AfterRun) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.after_run = Some(Box::new(hook));
        self
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub command: CliCommand,
    pub project: String,
    pub organization: String,
    /// Entries set on every stack; per-stack entries win on collision.
    pub global_config: ConfigMap,
}

pub struct StackDriver<E: Engine> {
    engine: E,
    settings: DriverSettings,
    hooks: Hooks,
    brought_up: HashSet<StackName>,
}

impl<E: Engine> StackDriver<E> {
    pub fn new(engine: E, settings: DriverSettings, hooks: Hooks) -> Self {
        Self {
            engine,
            settings,
            hooks,
            brought_up: HashSet::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn qualify(&self, name: &str) -> Result<StackName, Error> {
        Ok(StackName::parse(name)?.or_organization(&self.settings.organization))
    }

    pub async fn stack_up(
        &mut self,
        name: &str,
        options: StackUpOptions<E::Program>,
    ) -> Result<OutputMap, Error> {
        let stack = self.qualify(name)?;
        if self.brought_up.contains(&stack) {
            return Err(Error::DuplicateStack(stack.to_string()));
        }

        if let Some(before_run) = &self.hooks.before_run {
            before_run(&stack);
        }
        info!(stack = %stack, "Bringing up stack");

        if let Err(source) = self.engine.select_or_create(&stack).await {
            return Err(Error::Select {
                stack: stack.to_string(),
                source,
            });
        }

        let (config, overridden) = options.config.merged_over(&self.settings.global_config);
        for key in overridden {
            warn!(stack = %stack, key = %key, "Stack config overrides a global entry");
        }
        if let Err(source) = self.engine.set_config(&stack, &config).await {
            return Err(Error::Configure {
                stack: stack.to_string(),
                source,
            });
        }

        let resolver = StackReferences::new(
            &self.engine,
            &self.settings.organization,
            &self.settings.project,
        );
        let references = match resolver.resolve(&options.references).await {
            Ok(references) => references,
            Err(source) => {
                return Err(Error::Reference {
                    stack: stack.to_string(),
                    source,
                })
            }
        };

        let ctx = ExecutionContext {
            command: self.settings.command,
            project: self.settings.project.clone(),
            organization: self.settings.organization.clone(),
            stack: stack.clone(),
            global_config: self.settings.global_config.clone(),
            config: config.clone(),
            references,
        };
        let program = match (options.create_program)(&ctx) {
            Ok(program) => program,
            Err(reason) => {
                return Err(Error::Program {
                    stack: stack.to_string(),
                    reason,
                })
            }
        };

        let outputs = match self.engine.up(&stack, program).await {
            Ok(outputs) => outputs,
            Err(source) => {
                return Err(Error::Apply {
                    stack: stack.to_string(),
                    source,
                })
            }
        };
        self.brought_up.insert(stack.clone());
        debug!(stack = %stack, outputs = outputs.len(), "Stack is up");

        self.after_run(
            &stack,
            AfterRun::Up {
                stack: stack.clone(),
                config,
            },
        )
        .await?;

        return Ok(outputs);
    }

    /// Destroys the stack's resources and, with `remove`, the stack itself.
    pub async fn stack_destroy(&mut self, name: &str, remove: bool) -> Result<(), Error> {
        let stack = self.qualify(name)?;

        if let Some(before_run) = &self.hooks.before_run {
            before_run(&stack);
        }
        info!(stack = %stack, remove, "Destroying stack");

        // a stack that does not exist is the engine's error to report
        if let Err(source) = self.engine.select(&stack).await {
            return Err(Error::Select {
                stack: stack.to_string(),
                source,
            });
        }

        if let Err(source) = self.engine.destroy(&stack).await {
            return Err(Error::Destroy {
                stack: stack.to_string(),
                source,
            });
        }

        if remove {
            if let Err(source) = self.engine.remove(&stack).await {
                return Err(Error::Remove {
                    stack: stack.to_string(),
                    source,
                });
            }
        }
        self.brought_up.remove(&stack);

        self.after_run(
            &stack,
            AfterRun::Destroy {
                stack: stack.clone(),
                remove,
            },
        )
        .await
    }

    /// Short names of the project's stacks that exist in the engine right now.
    pub async fn existing_stacks(&self) -> Result<Vec<String>, Error> {
        match self.engine.list_stacks().await {
            Ok(stacks) => Ok(stacks
                .iter()
                .map(|stack| stack.stack().to_string())
                .collect()),
            Err(source) => Err(Error::List(source)),
        }
    }

    /// Brings up every step of the plan in order, stopping at the first failure.
    pub async fn run_up<F>(
        &mut self,
        plan: &StackPlan,
        mut make_program: F,
    ) -> Result<Vec<(StackName, OutputMap)>, Error>
    where
        F: FnMut(&StackStep) -> ProgramFactory<E::Program>,
    {
        let mut applied = Vec::with_capacity(plan.steps().len());

        for step in plan.steps() {
            let options = StackUpOptions {
                config: step.config.clone(),
                references: step.references.clone(),
                create_program: make_program(step),
            };
            let outputs = self.stack_up(&step.name, options).await?;
            applied.push((self.qualify(&step.name)?, outputs));
        }

        return Ok(applied);
    }

    /// Destroys every step of the plan in reverse order.
    pub async fn run_destroy(&mut self, plan: &StackPlan, remove: bool) -> Result<Vec<StackName>, Error> {
        let mut destroyed = Vec::with_capacity(plan.steps().len());

        for step in plan.destroy_order() {
            self.stack_destroy(&step.name, remove).await?;
            destroyed.push(self.qualify(&step.name)?);
        }

        return Ok(destroyed);
    }

    async fn after_run(&self, stack: &StackName, event: AfterRun) -> Result<(), Error> {
        let after_run = match &self.hooks.after_run {
            Some(after_run) => after_run,
            None => return Ok(()),
        };

        match after_run(event).await {
            Ok(()) => Ok(()),
            Err(reason) => Err(Error::Hook {
                stack: stack.to_string(),
                reason,
            }),
        }
    }
}
