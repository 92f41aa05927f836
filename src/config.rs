use aws_config::meta::region::RegionProviderChain;
use aws_types::region::Region;
use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path};
use validator::{Validate, ValidationError};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("No AWS region configured and none found in the environment")]
    RegionMissing,

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub init: InitConfig,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub destroy: DestroyConfig,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct InitConfig {
    #[validate(length(min = 1))]
    pub aws_region: Option<String>,

    #[validate(custom = "validate_organization")]
    pub pulumi_organization: String,

    #[validate(length(min = 1))]
    pub hostname: String,

    #[validate(email)]
    pub acme_email: String,

    pub encryption_config_key_arn: Option<String>,

    #[serde(default)]
    pub use_direnv: bool,

    #[serde(default = "default_admin_user")]
    #[validate(length(min = 1))]
    pub grafana_user: String,

    #[validate(length(min = 1))]
    pub grafana_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environments")]
    pub environments: Vec<AppEnvironment>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environments: default_environments(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_database_credentials"))]
pub struct AppEnvironment {
    #[validate(custom = "validate_environment_name")]
    pub name: String,

    #[serde(default)]
    pub database: bool,

    #[serde(default = "default_admin_user")]
    pub db_user: String,

    #[serde(default)]
    pub db_password: String,
}

impl AppEnvironment {
    /// An environment without a database.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: false,
            db_user: default_admin_user(),
            db_password: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyConfig {
    #[serde(default = "default_true")]
    pub remove_stacks: bool,
}

impl Default for DestroyConfig {
    fn default() -> Self {
        Self { remove_stacks: true }
    }
}

pub fn parse(path: &Path) -> Result<Config, Error> {
    let contents = read(path)?;

    let config: Config = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    validate(&config.init)?;
    for environment in &config.app.environments {
        validate(environment)?;
    }

    return Ok(config);
}

/// The project name from the `Pulumi.yaml` in `project_dir`.
pub fn project_name(project_dir: &Path) -> Result<String, Error> {
    #[derive(Deserialize)]
    struct ProjectFile {
        name: String,
    }

    let contents = read(&project_dir.join("Pulumi.yaml"))?;
    let project: ProjectFile = match serde_yaml::from_str(&contents) {
        Ok(data) => data,
        Err(error) => return Err(Error::ParsingError(error.to_string())),
    };

    if project.name.trim().is_empty() {
        return Err(Error::ValidationError(String::from(
            "Pulumi.yaml must declare a project name",
        )));
    }

    return Ok(project.name);
}

/// The configured region, or the one the AWS default provider chain finds.
pub async fn resolve_region(configured: Option<&str>) -> Result<Region, Error> {
    let region = match configured {
        Some(provided_region) => Some(Region::new(provided_region.to_string())),
        None => RegionProviderChain::default_provider().region().await,
    };

    match region {
        Some(region) => Ok(region),
        None => Err(Error::RegionMissing),
    }
}

fn read(path: &Path) -> Result<String, Error> {
    match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }
}

fn validate(entry: &impl Validate) -> Result<(), Error> {
    match entry.validate() {
        Ok(_) => Ok(()),
        Err(error) => Err(Error::ValidationError(error.to_string())),
    }
}

fn validate_organization(organization: &str) -> Result<(), ValidationError> {
    if organization.is_empty() || organization.contains('/') {
        return Err(ValidationError::new(
            "The Pulumi organization must be a single non-empty name",
        ));
    }

    return Ok(());
}

fn validate_environment_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(ValidationError::new(
            "Environment names may only contain lowercase letters, digits and `-`",
        ));
    }

    return Ok(());
}

fn validate_database_credentials(environment: &AppEnvironment) -> Result<(), ValidationError> {
    if environment.database && (environment.db_user.is_empty() || environment.db_password.is_empty()) {
        return Err(ValidationError::new(
            "An environment with a database needs `db_user` and `db_password`",
        ));
    }

    return Ok(());
}

fn default_admin_user() -> String {
    String::from("admin")
}

fn default_environments() -> Vec<AppEnvironment> {
    vec![AppEnvironment::new("staging")]
}

fn default_true() -> bool {
    true
}
