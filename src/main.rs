use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod outputs;
pub mod plan;
pub mod references;
pub mod stack;
pub mod writer;

use context::{CliCommand, ExecutionContext};
use driver::{AfterRun, DriverSettings, Hooks, ProgramFactory, StackDriver, StackUpOptions};
use engine::pulumi::{ProjectProgram, PulumiCli};
use outputs::OutputMap;
use stack::{ConfigMap, ConfigValue};
use writer::LocalStackFiles;

const KUBECONFIG_FILE: &str = "kubeconfig-devs.json";

/// Bring the platform's Pulumi stacks up in order and tear them down in reverse.
#[derive(Parser, Debug)]
#[command(name = "pulumi-stack-driver")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory holding the Pulumi project (`Pulumi.yaml`)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Show engine output and debug logs
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the Kubernetes platform: cluster, autoscaling, ingress, TLS, Dapr, monitoring
    Init,

    /// Create the application stacks on top of the platform
    App,

    /// Destroy every stack in reverse order
    Destroy {
        /// Keep the cluster and its autoscaler
        #[arg(long)]
        keep_cluster: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .init();

    let started = Instant::now();
    let config = config::parse(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let project = config::project_name(&cli.project_dir)
        .context("A Pulumi project is required; create one before running this command")?;

    match cli.command {
        Commands::Init => init(&cli.project_dir, &project, &config).await?,
        Commands::App => app(&cli.project_dir, &project, &config).await?,
        Commands::Destroy { keep_cluster } => {
            destroy(&cli.project_dir, &project, &config, keep_cluster).await?
        }
    }

    println!("Done in {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}

async fn init(project_dir: &Path, project: &str, config: &config::Config) -> anyhow::Result<()> {
    println!("Initializing project '{}'...", project);

    let mut driver = new_driver(project_dir, project, config, CliCommand::Init).await?;
    let plan = plan::platform(&config.init)?;

    let mut applied = Vec::new();
    for step in plan.steps() {
        let options = StackUpOptions::new(project_program)
            .config(step.config.clone())
            .references(step.references.clone());
        let outputs = driver.stack_up(&step.name, options).await?;

        // later stacks and kubectl users need the cluster credentials right away
        if step.name == plan::CLUSTER_STACK {
            export_kubeconfig(project_dir, &outputs, config.init.use_direnv).await?;
        }
        applied.push((step.name.clone(), outputs));
    }

    print_outputs(&applied);
    println!("Successfully created '{}' project", project);
    Ok(())
}

async fn app(project_dir: &Path, project: &str, config: &config::Config) -> anyhow::Result<()> {
    println!("Creating app...");

    let mut driver = new_driver(project_dir, project, config, CliCommand::App).await?;
    let plan = plan::apps(&config.init, &config.app)?;

    let applied = driver
        .run_up(&plan, |_| {
            let factory: ProgramFactory<ProjectProgram> = Box::new(project_program);
            factory
        })
        .await?;

    let applied: Vec<(String, OutputMap)> = applied
        .into_iter()
        .map(|(stack, outputs)| (stack.stack().to_string(), outputs))
        .collect();
    print_outputs(&applied);
    println!("Successfully created app");
    Ok(())
}

async fn destroy(
    project_dir: &Path,
    project: &str,
    config: &config::Config,
    keep_cluster: bool,
) -> anyhow::Result<()> {
    println!("Destroying project '{}'...", project);

    let mut driver = new_driver(project_dir, project, config, CliCommand::Destroy).await?;
    let existing = driver.existing_stacks().await?;
    let mut plan = plan::teardown(&config.init, &config.app, &existing)?;
    if keep_cluster {
        plan = plan.without(&plan::CLUSTER_STACKS);
    }

    let destroyed = driver.run_destroy(&plan, config.destroy.remove_stacks).await?;

    info!(stacks = destroyed.len(), "Destroyed stacks");
    println!("Successfully destroyed '{}' project", project);
    Ok(())
}

async fn new_driver(
    project_dir: &Path,
    project: &str,
    config: &config::Config,
    command: CliCommand,
) -> anyhow::Result<StackDriver<PulumiCli>> {
    let organization = config.init.pulumi_organization.clone();

    let global_config = match command {
        // destroy never applies configuration
        CliCommand::Destroy => ConfigMap::new(),
        CliCommand::Init | CliCommand::App => {
            let region = config::resolve_region(config.init.aws_region.as_deref()).await?;
            let region: &str = region.as_ref();
            ConfigMap::new()
                .with("aws:region", ConfigValue::plain(region))
                .with("pulumi_organization", ConfigValue::plain(&organization))
        }
    };

    let settings = DriverSettings {
        command,
        project: project.to_string(),
        organization,
        global_config,
    };

    let files = LocalStackFiles::new(project_dir, project);
    let hooks = Hooks::new()
        .before_run(|stack| println!("Stack {}...", stack))
        .after_run(move |event| {
            let files = files.clone();
            async move {
                match event {
                    AfterRun::Up { stack, config } => {
                        let path = files.write(&stack, &config).await?;
                        info!(stack = %stack, path = %path.display(), "Saved local stack config");
                    }
                    AfterRun::Destroy { stack, remove: true } => {
                        files.remove(&stack).await?;
                    }
                    AfterRun::Destroy { remove: false, .. } => {}
                }
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });

    return Ok(StackDriver::new(PulumiCli::new(project_dir), settings, hooks));
}

fn project_program(ctx: &ExecutionContext) -> anyhow::Result<ProjectProgram> {
    Ok(ProjectProgram::from_context(ctx))
}

async fn export_kubeconfig(project_dir: &Path, outputs: &OutputMap, use_direnv: bool) -> anyhow::Result<()> {
    let kubeconfig = match outputs.get("kubeconfig") {
        Some(kubeconfig) => kubeconfig_document(&kubeconfig.value),
        None => {
            warn!("Cluster stack has no `kubeconfig` output; skipping kubeconfig export");
            return Ok(());
        }
    };

    let path = project_dir.join(KUBECONFIG_FILE);
    writer::write_json(&path, &kubeconfig).await?;

    if use_direnv {
        writer::write_envrc(project_dir, &path).await?;
        let allowed = tokio::process::Command::new("direnv")
            .arg("allow")
            .arg(".")
            .current_dir(project_dir)
            .status()
            .await;
        match allowed {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(%status, "`direnv allow` failed"),
            Err(error) => warn!(%error, "Unable to run `direnv allow`"),
        }
    } else {
        println!("Run `export KUBECONFIG={}` to use kubectl", path.display());
    }

    info!(path = %path.display(), "Exported kubeconfig");
    Ok(())
}

/// The engine hands kubeconfig back either as an object or as JSON text.
fn kubeconfig_document(value: &Value) -> Value {
    match value {
        Value::String(raw) => match serde_json::from_str(raw) {
            Ok(document) => document,
            Err(_) => value.clone(),
        },
        other => other.clone(),
    }
}

fn print_outputs(applied: &[(String, OutputMap)]) {
    for (stack, outputs) in applied {
        if outputs.is_empty() {
            continue;
        }
        println!("Outputs of {}:", stack);
        print!("{}", outputs::summary(outputs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn cli_init_command() {
        let cli = Cli::try_parse_from(["pulumi-stack-driver", "init"]).unwrap();
        assert_eq!(PathBuf::from("config.yaml"), cli.config);
        match cli.command {
            Commands::Init => {}
            _ => panic!("Expected Init command"),
        }
    }

    #[test]
    fn cli_destroy_keep_cluster() {
        let cli = Cli::try_parse_from(["pulumi-stack-driver", "destroy", "--keep-cluster"]).unwrap();
        match cli.command {
            Commands::Destroy { keep_cluster } => assert_eq!(true, keep_cluster),
            _ => panic!("Expected Destroy command"),
        }
    }

    #[test]
    fn cli_global_flags() {
        let cli = Cli::try_parse_from([
            "pulumi-stack-driver",
            "--debug",
            "--config",
            "platform.yaml",
            "--project-dir",
            "infra",
            "app",
        ])
        .unwrap();
        assert_eq!(true, cli.debug);
        assert_eq!(PathBuf::from("platform.yaml"), cli.config);
        assert_eq!(PathBuf::from("infra"), cli.project_dir);
    }

    #[test]
    fn kubeconfig_text_is_parsed() {
        let value = json!("{\"apiVersion\": \"v1\"}");
        assert_eq!(json!({"apiVersion": "v1"}), kubeconfig_document(&value));

        let object = json!({"apiVersion": "v1"});
        assert_eq!(object, kubeconfig_document(&object));
    }

    #[tokio::test]
    async fn exports_kubeconfig() {
        let dir = tempdir().unwrap();
        let mut outputs = OutputMap::new();
        outputs.insert(
            String::from("kubeconfig"),
            outputs::OutputValue::secret(json!({"apiVersion": "v1"})),
        );

        export_kubeconfig(dir.path(), &outputs, false).await.unwrap();

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(KUBECONFIG_FILE)).unwrap())
                .unwrap();
        assert_eq!(json!({"apiVersion": "v1"}), written);
        assert_eq!(false, dir.path().join(".envrc").exists());
    }

    #[tokio::test]
    async fn export_without_kubeconfig_output() {
        let dir = tempdir().unwrap();

        export_kubeconfig(dir.path(), &OutputMap::new(), false).await.unwrap();
        assert_eq!(false, dir.path().join(KUBECONFIG_FILE).exists());
    }
}
