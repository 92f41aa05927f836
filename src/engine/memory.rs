//! In-memory engine that records every call, for driver tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::{Engine, Error};
use crate::outputs::OutputMap;
use crate::stack::{ConfigMap, StackName};

#[derive(Debug, Default)]
struct MemoryStack {
    config: ConfigMap,
    outputs: OutputMap,
}

#[derive(Debug, Default)]
pub struct MemoryEngine {
    stacks: Mutex<BTreeMap<String, MemoryStack>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `up` and `set_config` of the stack fail.
    pub fn fail_on(&self, stack: &str) {
        self.failing.lock().unwrap().insert(stack.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn exists(&self, stack: &str) -> bool {
        self.stacks.lock().unwrap().contains_key(stack)
    }

    pub fn config_of(&self, stack: &str) -> Option<ConfigMap> {
        self.stacks
            .lock()
            .unwrap()
            .get(stack)
            .map(|state| state.config.clone())
    }

    fn record(&self, call: &str, stack: &StackName) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", call, stack.stack()));
    }

    fn check_failing(&self, stack: &StackName) -> Result<(), Error> {
        if self.failing.lock().unwrap().contains(stack.stack()) {
            return Err(Error::Rejected(format!("{} is set up to fail", stack)));
        }
        Ok(())
    }

    fn missing(stack: &StackName) -> Error {
        Error::Rejected(format!("no stack named '{}' found", stack))
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    /// The outputs the stack should expose once applied.
    type Program = OutputMap;

    async fn select_or_create(&self, stack: &StackName) -> Result<(), Error> {
        self.record("select", stack);
        self.stacks
            .lock()
            .unwrap()
            .entry(stack.stack().to_string())
            .or_default();
        Ok(())
    }

    async fn select(&self, stack: &StackName) -> Result<(), Error> {
        self.record("select", stack);
        match self.stacks.lock().unwrap().contains_key(stack.stack()) {
            true => Ok(()),
            false => Err(Self::missing(stack)),
        }
    }

    async fn list_stacks(&self) -> Result<Vec<StackName>, Error> {
        self.stacks
            .lock()
            .unwrap()
            .keys()
            .map(|name| StackName::parse(name).map_err(|error| Error::StackList(error.to_string())))
            .collect()
    }

    async fn set_config(&self, stack: &StackName, config: &ConfigMap) -> Result<(), Error> {
        self.record("config", stack);
        self.check_failing(stack)?;
        let mut stacks = self.stacks.lock().unwrap();
        match stacks.get_mut(stack.stack()) {
            Some(state) => {
                state.config = config.clone();
                Ok(())
            }
            None => Err(Self::missing(stack)),
        }
    }

    async fn up(&self, stack: &StackName, program: OutputMap) -> Result<OutputMap, Error> {
        self.record("up", stack);
        self.check_failing(stack)?;
        let mut stacks = self.stacks.lock().unwrap();
        match stacks.get_mut(stack.stack()) {
            Some(state) => {
                state.outputs = program;
                Ok(state.outputs.clone())
            }
            None => Err(Self::missing(stack)),
        }
    }

    async fn outputs(&self, stack: &StackName) -> Result<Option<OutputMap>, Error> {
        Ok(self
            .stacks
            .lock()
            .unwrap()
            .get(stack.stack())
            .map(|state| state.outputs.clone()))
    }

    async fn destroy(&self, stack: &StackName) -> Result<(), Error> {
        self.record("destroy", stack);
        let mut stacks = self.stacks.lock().unwrap();
        match stacks.get_mut(stack.stack()) {
            Some(state) => {
                state.outputs.clear();
                Ok(())
            }
            None => Err(Self::missing(stack)),
        }
    }

    async fn remove(&self, stack: &StackName) -> Result<(), Error> {
        self.record("remove", stack);
        match self.stacks.lock().unwrap().remove(stack.stack()) {
            Some(_) => Ok(()),
            None => Err(Self::missing(stack)),
        }
    }
}
