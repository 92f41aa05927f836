//! Engine backed by the `pulumi` command line tool.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Engine, Error};
use crate::context::ExecutionContext;
use crate::outputs::{self, OutputMap, SECRET_PLACEHOLDER};
use crate::stack::{ConfigMap, StackName};

/// The Pulumi project in the working directory, parameterized through its environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectProgram {
    pub environment: BTreeMap<String, String>,
}

impl ProjectProgram {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        let mut environment = BTreeMap::new();
        environment.insert("STACK_DRIVER_COMMAND".to_string(), ctx.command.to_string());
        environment.insert("STACK_DRIVER_PROJECT".to_string(), ctx.project.clone());
        environment.insert("STACK_DRIVER_ORGANIZATION".to_string(), ctx.organization.clone());
        environment.insert("STACK_DRIVER_STACK".to_string(), ctx.stack.stack().to_string());
        environment.insert(
            "STACK_DRIVER_REFERENCES".to_string(),
            ctx.references_json().to_string(),
        );

        return Self { environment };
    }
}

pub struct PulumiCli {
    binary: PathBuf,
    /// Arguments placed before the pulumi arguments, for wrappers such as
    /// `aws-vault exec <profile> -- pulumi`.
    leading_args: Vec<String>,
    work_dir: PathBuf,
}

impl PulumiCli {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("pulumi"),
            leading_args: Vec::new(),
            work_dir: work_dir.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        self.binary = binary.into();
        self.leading_args = leading_args;
        self
    }

    async fn run(&self, args: &[String], environment: &BTreeMap<String, String>) -> Result<String, Error> {
        self.run_redacted(args, &[], environment).await
    }

    /// Runs the engine with every occurrence of `secrets` masked in what is logged
    /// and in returned errors.
    async fn run_redacted(
        &self,
        args: &[String],
        secrets: &[&str],
        environment: &BTreeMap<String, String>,
    ) -> Result<String, Error> {
        let command_line = redact(&format!("pulumi {}", args.join(" ")), secrets);
        debug!(command = %command_line, "Running engine command");

        let output = Command::new(&self.binary)
            .args(&self.leading_args)
            .args(args)
            .arg("--non-interactive")
            .current_dir(&self.work_dir)
            .envs(environment)
            .stdin(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(source) => {
                return Err(Error::Spawn {
                    command: command_line,
                    source,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        for line in stdout.lines() {
            debug!(target: "pulumi", "{}", redact(line, secrets));
        }

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: command_line,
                status: output.status.to_string(),
                stderr: redact(String::from_utf8_lossy(&output.stderr).trim(), secrets),
            });
        }

        return Ok(stdout);
    }

    async fn stack_output(&self, stack: &StackName, show_secrets: bool) -> Result<String, Error> {
        let mut args = strings(&["stack", "output", "--json", "--stack"]);
        args.push(stack.to_string());
        if show_secrets {
            args.push("--show-secrets".to_string());
        }
        self.run(&args, &BTreeMap::new()).await
    }
}

#[async_trait]
impl Engine for PulumiCli {
    type Program = ProjectProgram;

    async fn select_or_create(&self, stack: &StackName) -> Result<(), Error> {
        let mut args = strings(&["stack", "select"]);
        args.push(stack.to_string());
        args.push("--create".to_string());
        self.run(&args, &BTreeMap::new()).await?;
        Ok(())
    }

    async fn select(&self, stack: &StackName) -> Result<(), Error> {
        let mut args = strings(&["stack", "select"]);
        args.push(stack.to_string());
        self.run(&args, &BTreeMap::new()).await?;
        Ok(())
    }

    async fn list_stacks(&self) -> Result<Vec<StackName>, Error> {
        let listing = self.run(&strings(&["stack", "ls", "--json"]), &BTreeMap::new()).await?;
        parse_stack_list(&listing)
    }

    async fn set_config(&self, stack: &StackName, config: &ConfigMap) -> Result<(), Error> {
        if config.is_empty() {
            return Ok(());
        }

        let mut args = strings(&["config", "set-all", "--stack"]);
        args.push(stack.to_string());
        let mut secrets = Vec::new();
        for (key, value) in config.iter() {
            let flag = if value.secret { "--secret" } else { "--plaintext" };
            args.push(flag.to_string());
            args.push(format!("{}={}", key, value.value));
            if value.secret {
                secrets.push(value.value.as_str());
            }
        }

        debug!(stack = %stack, entries = config.len(), "Setting stack configuration");
        self.run_redacted(&args, &secrets, &BTreeMap::new()).await?;
        Ok(())
    }

    async fn up(&self, stack: &StackName, program: ProjectProgram) -> Result<OutputMap, Error> {
        info!(stack = %stack, "Updating stack");

        let mut args = strings(&["up", "--yes", "--skip-preview", "--stack"]);
        args.push(stack.to_string());
        self.run(&args, &program.environment).await?;

        match self.outputs(stack).await? {
            Some(outputs) => Ok(outputs),
            None => Err(Error::Rejected(format!(
                "stack {} disappeared after a successful update",
                stack
            ))),
        }
    }

    async fn outputs(&self, stack: &StackName) -> Result<Option<OutputMap>, Error> {
        let masked = match self.stack_output(stack, false).await {
            Ok(masked) => masked,
            Err(Error::CommandFailed { stderr, .. }) if is_missing_stack(&stderr) => {
                return Ok(None)
            }
            Err(error) => return Err(error),
        };
        let revealed = self.stack_output(stack, true).await?;

        match outputs::from_engine_json(&masked, &revealed) {
            Ok(outputs) => Ok(Some(outputs)),
            Err(source) => Err(Error::Outputs {
                stack: stack.to_string(),
                source,
            }),
        }
    }

    async fn destroy(&self, stack: &StackName) -> Result<(), Error> {
        info!(stack = %stack, "Destroying stack resources");

        let mut args = strings(&["destroy", "--yes", "--skip-preview", "--stack"]);
        args.push(stack.to_string());
        self.run(&args, &BTreeMap::new()).await?;
        Ok(())
    }

    async fn remove(&self, stack: &StackName) -> Result<(), Error> {
        let mut args = strings(&["stack", "rm", "--yes", "--stack"]);
        args.push(stack.to_string());
        self.run(&args, &BTreeMap::new()).await?;
        Ok(())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

fn is_missing_stack(stderr: &str) -> bool {
    stderr.contains("no stack named")
}

fn redact(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|secret| !secret.is_empty())
        .fold(text.to_string(), |text, secret| text.replace(secret, SECRET_PLACEHOLDER))
}

#[derive(Deserialize)]
struct StackSummary {
    name: String,
}

/// Names from `pulumi stack ls --json`, which lists the stacks of the current project.
fn parse_stack_list(listing: &str) -> Result<Vec<StackName>, Error> {
    if listing.trim().is_empty() {
        return Ok(Vec::new());
    }

    let summaries: Vec<StackSummary> = match serde_json::from_str(listing) {
        Ok(summaries) => summaries,
        Err(error) => return Err(Error::StackList(error.to_string())),
    };

    summaries
        .iter()
        .map(|summary| match StackName::parse(&summary.name) {
            Ok(name) => Ok(name),
            Err(error) => Err(Error::StackList(error.to_string())),
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{parse_stack_list, redact, ProjectProgram, PulumiCli};
    use crate::context::{CliCommand, ExecutionContext, ResolvedReferences};
    use crate::engine::{Engine, Error};
    use crate::outputs::OutputValue;
    use crate::stack::{ConfigMap, ConfigValue, StackName};
    use serde_json::json;
    use tempfile::tempdir;

    const FAKE_PULUMI: &str = r#"#!/bin/sh
log="$(dirname "$0")/calls.log"
echo "$*" >> "$log"
case "$1 $2" in
  "stack ls")
    echo '[{"name": "acme/cluster", "current": true}, {"name": "tls", "current": false}]' ;;
  "config set-all")
    case "$*" in
      *broken*) echo "error: config failed: $*" >&2; exit 1 ;;
    esac ;;
  "stack select")
    case "$*" in
      *--create*) ;;
      *missing*) echo "error: no stack named 'acme/missing' found" >&2; exit 255 ;;
    esac ;;
  "stack output")
    case "$*" in
      *missing*) echo "error: no stack named 'acme/missing' found" >&2; exit 255 ;;
      *--show-secrets*) echo '{"eksHash": "abc", "kubeconfig": {"apiVersion": "v1"}}' ;;
      *) echo '{"eksHash": "abc", "kubeconfig": "[secret]"}' ;;
    esac ;;
  "up --yes")
    echo "env STACK=$STACK_DRIVER_STACK COMMAND=$STACK_DRIVER_COMMAND" >> "$log" ;;
  "destroy --yes")
    echo "error: update failed" >&2; exit 1 ;;
esac
"#;

    fn fake_pulumi(dir: &Path) -> PulumiCli {
        let script = dir.join("pulumi.sh");
        fs::write(&script, FAKE_PULUMI).unwrap();
        PulumiCli::new(dir).with_binary("sh", vec![script.display().to_string()])
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("calls.log"))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn selects_and_configures_stack() {
        let dir = tempdir().unwrap();
        let engine = fake_pulumi(dir.path());
        let stack = StackName::parse("acme/tls").unwrap();
        let config = ConfigMap::new()
            .with("hostname", ConfigValue::plain("example.com"))
            .with("grafana_password", ConfigValue::secret("pw"));

        engine.select_or_create(&stack).await.unwrap();
        engine.set_config(&stack, &config).await.unwrap();

        assert_eq!(
            vec![
                "stack select acme/tls --create --non-interactive",
                "config set-all --stack acme/tls --secret grafana_password=pw --plaintext hostname=example.com --non-interactive",
            ],
            calls(dir.path())
        );
    }

    #[tokio::test]
    async fn secret_config_stays_out_of_errors() {
        let dir = tempdir().unwrap();
        let engine = fake_pulumi(dir.path());
        let stack = StackName::parse("acme/broken").unwrap();
        let config = ConfigMap::new()
            .with("hostname", ConfigValue::plain("example.com"))
            .with("grafana_password", ConfigValue::secret("hunter2"));

        let error = engine.set_config(&stack, &config).await.err().unwrap();

        let message = error.to_string();
        assert_eq!(false, message.contains("hunter2"));
        assert_eq!(true, message.contains("--secret grafana_password=[secret]"));
        assert_eq!(true, message.contains("--plaintext hostname=example.com"));
        match error {
            Error::CommandFailed { command, stderr, .. } => {
                assert_eq!(false, command.contains("hunter2"));
                assert_eq!(true, stderr.starts_with("error: config failed"));
                assert_eq!(false, stderr.contains("hunter2"));
            }
            other => panic!("Expected `CommandFailed` error, got {:?}", other),
        }
    }

    #[test]
    fn redacts_every_occurrence_of_a_secret() {
        assert_eq!(
            "pulumi config set-all --secret a=[secret] --secret b=[secret] c=plain",
            redact(
                "pulumi config set-all --secret a=hunter2 --secret b=s3cr3t c=plain",
                &["hunter2", "s3cr3t", ""]
            )
        );
        assert_eq!("no secrets here", redact("no secrets here", &[]));
    }

    #[tokio::test]
    async fn selecting_a_missing_stack_fails() {
        let dir = tempdir().unwrap();
        let engine = fake_pulumi(dir.path());
        let stack = StackName::parse("acme/missing").unwrap();

        match engine.select(&stack).await {
            Err(Error::CommandFailed { stderr, .. }) => {
                assert_eq!(true, stderr.contains("no stack named"))
            }
            other => panic!("Expected `CommandFailed` error, got {:?}", other),
        }
        assert_eq!(
            vec!["stack select acme/missing --non-interactive"],
            calls(dir.path())
        );
    }

    #[tokio::test]
    async fn lists_project_stacks() {
        let dir = tempdir().unwrap();
        let engine = fake_pulumi(dir.path());

        let stacks = engine.list_stacks().await.unwrap();

        let names: Vec<&str> = stacks.iter().map(|stack| stack.stack()).collect();
        assert_eq!(vec!["cluster", "tls"], names);
        assert_eq!(Some("acme"), stacks[0].organization());
    }

    #[test]
    fn stack_list_must_be_json() {
        assert_eq!(true, parse_stack_list("").unwrap().is_empty());
        match parse_stack_list("not json") {
            Err(Error::StackList(_)) => {}
            other => panic!("Expected `StackList` error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_config_is_not_sent() {
        let dir = tempdir().unwrap();
        let engine = fake_pulumi(dir.path());
        let stack = StackName::parse("acme/tls").unwrap();

        engine.set_config(&stack, &ConfigMap::new()).await.unwrap();
        assert_eq!(false, dir.path().join("calls.log").exists());
    }

    #[tokio::test]
    async fn up_passes_program_environment_and_returns_outputs() {
        let dir = tempdir().unwrap();
        let engine = fake_pulumi(dir.path());
        let stack = StackName::parse("acme/cluster").unwrap();
        let ctx = ExecutionContext {
            command: CliCommand::Init,
            project: String::from("platform"),
            organization: String::from("acme"),
            stack: stack.clone(),
            global_config: ConfigMap::new(),
            config: ConfigMap::new(),
            references: ResolvedReferences::new(),
        };

        let outputs = engine
            .up(&stack, ProjectProgram::from_context(&ctx))
            .await
            .unwrap();

        assert_eq!(Some(&OutputValue::plain("abc")), outputs.get("eksHash"));
        assert_eq!(
            Some(&OutputValue::secret(json!({"apiVersion": "v1"}))),
            outputs.get("kubeconfig")
        );
        assert_eq!(
            "env STACK=cluster COMMAND=init",
            calls(dir.path())[1]
        );
    }

    #[tokio::test]
    async fn missing_stack_has_no_outputs() {
        let dir = tempdir().unwrap();
        let engine = fake_pulumi(dir.path());
        let stack = StackName::parse("acme/missing").unwrap();

        assert_eq!(None, engine.outputs(&stack).await.unwrap());
    }

    #[tokio::test]
    async fn failed_command_surfaces_stderr() {
        let dir = tempdir().unwrap();
        let engine = fake_pulumi(dir.path());
        let stack = StackName::parse("acme/cluster").unwrap();

        match engine.destroy(&stack).await {
            Err(Error::CommandFailed { stderr, .. }) => assert_eq!("error: update failed", stderr),
            other => panic!("Expected `CommandFailed` error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let engine = PulumiCli::new(dir.path()).with_binary(dir.path().join("nope"), Vec::new());
        let stack = StackName::parse("acme/cluster").unwrap();

        match engine.remove(&stack).await {
            Err(Error::Spawn { .. }) => {}
            other => panic!("Expected `Spawn` error, got {:?}", other),
        }
    }
}
