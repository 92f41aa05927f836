//! Local files mirroring engine state: per-stack config files and the kubeconfig export.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::stack::{ConfigMap, StackName};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to serialize {path}: {reason}")]
    Serialize { path: String, reason: String },
}

#[derive(Debug, Serialize)]
struct StackFile<'a> {
    stack: &'a str,
    config: BTreeMap<&'a str, &'a str>,
}

/// One `<project>.<stack>.yaml` file per stack, next to the Pulumi project.
#[derive(Debug, Clone)]
pub struct LocalStackFiles {
    dir: PathBuf,
    project: String,
}

impl LocalStackFiles {
    pub fn new(dir: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            project: project.into(),
        }
    }

    pub fn path_for(&self, stack: &StackName) -> PathBuf {
        self.dir
            .join(format!("{}.{}.yaml", self.project, stack.stack()))
    }

    /// Writes the effective configuration of the stack, secrets redacted.
    pub async fn write(&self, stack: &StackName, config: &ConfigMap) -> Result<PathBuf, Error> {
        let path = self.path_for(stack);
        let contents = StackFile {
            stack: stack.stack(),
            config: config
                .iter()
                .map(|(key, value)| (key.as_str(), value.display_value()))
                .collect(),
        };

        let file_contents = match serde_yaml::to_string(&contents) {
            Ok(file_contents) => file_contents,
            Err(error) => {
                return Err(Error::Serialize {
                    path: path.display().to_string(),
                    reason: error.to_string(),
                })
            }
        };

        write_file(&path, file_contents).await?;
        debug!(path = %path.display(), "Wrote local stack config");
        return Ok(path);
    }

    /// Deletes the stack's file. A file that is already gone is not an error, so a
    /// destroy interrupted half-way can simply be run again.
    pub async fn remove(&self, stack: &StackName) -> Result<bool, Error> {
        let path = self.path_for(stack);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) => match error.kind() {
                io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Local stack config already removed");
                    Ok(false)
                }
                _ => Err(Error::Io {
                    path: path.display().to_string(),
                    source: error,
                }),
            },
        }
    }
}

/// Writes a value as pretty-printed JSON.
pub async fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), Error> {
    let file_contents = match serde_json::to_string_pretty(value) {
        Ok(file_contents) => file_contents,
        Err(error) => {
            return Err(Error::Serialize {
                path: path.display().to_string(),
                reason: error.to_string(),
            })
        }
    };

    write_file(path, file_contents).await
}

/// An `.envrc` pointing `KUBECONFIG` at the exported kubeconfig, for direnv users.
pub async fn write_envrc(dir: &Path, kubeconfig: &Path) -> Result<PathBuf, Error> {
    let path = dir.join(".envrc");
    let file_contents = format!("export KUBECONFIG={}\n", kubeconfig.display());

    write_file(&path, file_contents).await?;
    return Ok(path);
}

async fn write_file(path: &Path, contents: String) -> Result<(), Error> {
    match fs::write(path, contents).await {
        Ok(()) => Ok(()),
        Err(source) => Err(Error::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}
