//! Ordered stack plans. Stacks are brought up in plan order and destroyed in reverse.

use std::collections::HashSet;

use crate::config::{AppConfig, AppEnvironment, InitConfig};
use crate::context::OutputRef;
use crate::stack::{ConfigMap, ConfigValue};

/// Stacks that `destroy --keep-cluster` leaves in place.
pub const CLUSTER_STACKS: [&str; 2] = ["karpenter", "cluster"];

pub const CLUSTER_STACK: &str = "cluster";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Stack name must not be empty")]
    EmptyName,

    #[error("Stack {0} appears more than once in the plan")]
    Duplicate(String),

    #[error("Stack {stack} reads `{reference}` but that stack is applied later in the plan")]
    ForwardReference { stack: String, reference: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackStep {
    pub name: String,
    pub config: ConfigMap,
    pub references: Vec<OutputRef>,
}

impl StackStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ConfigMap::new(),
            references: Vec::new(),
        }
    }

    pub fn config(mut self, key: &str, value: ConfigValue) -> Self {
        self.config.insert(key, value);
        self
    }

    pub fn reference(mut self, stack: &str, output: &str) -> Self {
        self.references.push(OutputRef::new(stack, output));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackPlan {
    steps: Vec<StackStep>,
}

impl StackPlan {
    /// Builds a plan, rejecting duplicates and references to stacks placed later.
    /// References to stacks outside the plan are left to be resolved at run time.
    pub fn new(steps: Vec<StackStep>) -> Result<Self, Error> {
        let names: HashSet<&str> = steps.iter().map(|step| step.name.as_str()).collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for step in &steps {
            if step.name.trim().is_empty() {
                return Err(Error::EmptyName);
            }
            if !seen.insert(step.name.as_str()) {
                return Err(Error::Duplicate(step.name.clone()));
            }
            for reference in &step.references {
                let in_plan = names.contains(reference.stack.as_str());
                if in_plan && !seen.contains(reference.stack.as_str()) {
                    return Err(Error::ForwardReference {
                        stack: step.name.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
        }

        return Ok(Self { steps });
    }

    pub fn steps(&self) -> &[StackStep] {
        &self.steps
    }

    pub fn destroy_order(&self) -> impl Iterator<Item = &StackStep> {
        self.steps.iter().rev()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    pub fn without(&self, excluded: &[&str]) -> Self {
        Self {
            steps: self
                .steps
                .iter()
                .filter(|step| !excluded.contains(&step.name.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Cluster, autoscaling, ingress controller, TLS, sidecar runtime and monitoring.
pub fn platform(init: &InitConfig) -> Result<StackPlan, Error> {
    let mut cluster = StackStep::new(CLUSTER_STACK);
    if let Some(arn) = &init.encryption_config_key_arn {
        cluster = cluster.config("encryptionConfigKeyArn", ConfigValue::plain(arn));
    }

    let steps = vec![
        cluster,
        StackStep::new("karpenter")
            .reference(CLUSTER_STACK, "kubeconfig")
            .reference(CLUSTER_STACK, "clusterName")
            .reference(CLUSTER_STACK, "eksHash"),
        StackStep::new("cert-manager")
            .reference(CLUSTER_STACK, "kubeconfig")
            .reference(CLUSTER_STACK, "eksHash"),
        StackStep::new("emissary").reference(CLUSTER_STACK, "kubeconfig"),
        StackStep::new("tls")
            .config("hostname", ConfigValue::plain(&init.hostname))
            .config("acme_email", ConfigValue::plain(&init.acme_email))
            .reference(CLUSTER_STACK, "kubeconfig"),
        StackStep::new("dapr").reference(CLUSTER_STACK, "kubeconfig"),
        StackStep::new("kube-prometheus-stack")
            .config("hostname", ConfigValue::plain(&init.hostname))
            .config("grafana_user", ConfigValue::plain(&init.grafana_user))
            .config("grafana_password", ConfigValue::secret(&init.grafana_password))
            .reference(CLUSTER_STACK, "kubeconfig"),
    ];

    StackPlan::new(steps)
}

/// Per environment: optional database, namespace init, app and app ingress.
pub fn apps(init: &InitConfig, app: &AppConfig) -> Result<StackPlan, Error> {
    let mut steps = Vec::new();

    for environment in &app.environments {
        let env = &environment.name;
        let db = format!("db-{}", env);

        let mut app_step = StackStep::new(format!("app-{}", env)).reference(CLUSTER_STACK, "kubeconfig");

        if environment.database {
            steps.push(
                StackStep::new(&db)
                    .config("db_user", ConfigValue::plain(&environment.db_user))
                    .config("db_password", ConfigValue::secret(&environment.db_password))
                    .reference(CLUSTER_STACK, "kubeconfig")
                    .reference(CLUSTER_STACK, "vpc")
                    .reference(CLUSTER_STACK, "vpcPublicSubnetIds"),
            );
            app_step = app_step
                .config("db_user", ConfigValue::plain(&environment.db_user))
                .config("db_password", ConfigValue::secret(&environment.db_password))
                .reference(&db, "rdsName")
                .reference(&db, "rdsEndpoint")
                .reference(&db, "rdsPort");
        }

        steps.push(StackStep::new(format!("app-{}-init", env)).reference(CLUSTER_STACK, "kubeconfig"));
        steps.push(app_step);
        steps.push(
            StackStep::new(format!("app-{}-ingress", env))
                .config("hostname", ConfigValue::plain(&init.hostname))
                .reference(CLUSTER_STACK, "kubeconfig"),
        );
    }

    StackPlan::new(steps)
}

/// What `destroy` tears down: every known stack that exists in the engine. Environments
/// are taken from the configuration and from the existing stack names, and every
/// environment's database stack is included, so stacks dropped from the configuration
/// after they were brought up are still destroyed.
pub fn teardown(init: &InitConfig, app: &AppConfig, existing: &[String]) -> Result<StackPlan, Error> {
    let mut environments: Vec<String> = app
        .environments
        .iter()
        .map(|environment| environment.name.clone())
        .collect();
    for environment in existing.iter().filter_map(|stack| environment_of(stack)) {
        if !environments.contains(&environment) {
            environments.push(environment);
        }
    }

    let mut steps = platform(init)?.steps;
    for name in environments {
        let environment = AppConfig {
            environments: vec![AppEnvironment {
                database: true,
                ..AppEnvironment::new(name)
            }],
        };
        for step in apps(init, &environment)?.steps {
            // `app-<env>-init` of one environment can be `app-<env>` of another
            if !steps.iter().any(|known| known.name == step.name) {
                steps.push(step);
            }
        }
    }

    steps.retain(|step| existing.contains(&step.name));
    StackPlan::new(steps)
}

/// The environment an application or database stack belongs to.
fn environment_of(stack: &str) -> Option<String> {
    let environment = match stack.strip_prefix("db-") {
        Some(environment) => environment,
        None => {
            let rest = stack.strip_prefix("app-")?;
            rest.strip_suffix("-init")
                .or_else(|| rest.strip_suffix("-ingress"))
                .unwrap_or(rest)
        }
    };

    match environment.is_empty() {
        true => None,
        false => Some(environment.to_string()),
    }
}
