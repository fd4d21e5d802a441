//! Owner of the tunnel ingress YAML. All mutation goes through a single
//! writer lock; writes are atomic (temp file + rename) with a pre-write
//! backup and a best-effort version-control commit.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// The mandatory last ingress rule.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("error reading ingress file `{path}`: {err}")]
    Read { path: String, err: String },

    #[error("error writing ingress file `{path}`: {err}")]
    Write { path: String, err: String },

    #[error("error parsing ingress file: `{0}`")]
    Parse(#[from] serde_yaml::Error),

    #[error("ingress list does not end with the `{CATCH_ALL_SERVICE}` catch-all")]
    MissingCatchAll,

    #[error("hostname `{0}` already has an ingress rule")]
    DuplicateHostname(String),

    #[error("ingress file failed validation after write and was restored from backup: {0}")]
    ConfigCorrupted(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OriginRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_tls_verify: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequest>,
}

impl IngressRule {
    fn is_catch_all(&self) -> bool {
        self.hostname.is_none() && self.service == CATCH_ALL_SERVICE
    }
}

/// The tunnel configuration document. `tunnel` and `credentials-file`
/// are owned by provisioning; this process only edits the rule list.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IngressDocument {
    pub tunnel: String,
    #[serde(rename = "credentials-file")]
    pub credentials_file: String,
    pub ingress: Vec<IngressRule>,
}

impl IngressDocument {
    pub fn parse(content: &str) -> Result<Self, IngressError> {
        let document: IngressDocument = serde_yaml::from_str(content)?;
        document.validate()?;
        Ok(document)
    }

    /// The ordered rule list must end with the bare catch-all.
    pub fn validate(&self) -> Result<(), IngressError> {
        match self.ingress.last() {
            Some(last) if last.is_catch_all() => Ok(()),
            _ => Err(IngressError::MissingCatchAll),
        }
    }

    /// Inserts a rule immediately before the catch-all.
    pub fn add_rule(
        &mut self,
        hostname: &str,
        service_url: &str,
        origin_request: Option<OriginRequest>,
    ) -> Result<(), IngressError> {
        self.validate()?;
        if self.rule_for(hostname).is_some() {
            return Err(IngressError::DuplicateHostname(hostname.to_string()));
        }

        let catch_all_index = self.ingress.len() - 1;
        self.ingress.insert(
            catch_all_index,
            IngressRule {
                hostname: Some(hostname.to_string()),
                service: service_url.to_string(),
                origin_request,
            },
        );
        Ok(())
    }

    /// Deletes the rule for `hostname` if present. Idempotent.
    pub fn remove_rule(&mut self, hostname: &str) -> bool {
        let before = self.ingress.len();
        self.ingress
            .retain(|rule| rule.hostname.as_deref() != Some(hostname));
        self.ingress.len() != before
    }

    pub fn rule_for(&self, hostname: &str) -> Option<&IngressRule> {
        self.ingress
            .iter()
            .find(|rule| rule.hostname.as_deref() == Some(hostname))
    }
}

/// Serialized access to the ingress file on disk.
pub struct IngressFileManager {
    path: PathBuf,
    write_lock: Mutex<()>,
    commit_changes: bool,
}

impl IngressFileManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            commit_changes: true,
        }
    }

    #[cfg(test)]
    pub fn without_commits(path: PathBuf) -> Self {
        Self {
            commit_changes: false,
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Readers proceed without the writer lock; they observe the last
    /// fully renamed file.
    pub async fn read(&self) -> Result<IngressDocument, IngressError> {
        let content = self.read_bytes().await?;
        IngressDocument::parse(&content)
    }

    pub async fn add(
        &self,
        hostname: &str,
        service_url: &str,
        origin_request: Option<OriginRequest>,
    ) -> Result<(), IngressError> {
        let _guard = self.write_lock.lock().await;

        let previous = self.read_bytes().await?;
        let mut document = IngressDocument::parse(&previous)?;
        document.add_rule(hostname, service_url, origin_request)?;
        self.write_validated(&document, &previous).await?;

        info!(hostname, service = service_url, "ingress rule added");
        self.commit(&format!("ingress: route {hostname}")).await;
        Ok(())
    }

    pub async fn remove(&self, hostname: &str) -> Result<bool, IngressError> {
        let _guard = self.write_lock.lock().await;

        let previous = self.read_bytes().await?;
        let mut document = IngressDocument::parse(&previous)?;
        if !document.remove_rule(hostname) {
            return Ok(false);
        }
        self.write_validated(&document, &previous).await?;

        info!(hostname, "ingress rule removed");
        self.commit(&format!("ingress: drop {hostname}")).await;
        Ok(true)
    }

    async fn read_bytes(&self) -> Result<String, IngressError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| IngressError::Read {
                path: self.path.display().to_string(),
                err: err.to_string(),
            })
    }

    /// Temp-file write, rename over the original, then re-parse. When the
    /// re-parse fails the previous bytes are restored verbatim.
    async fn write_validated(
        &self,
        document: &IngressDocument,
        previous: &str,
    ) -> Result<(), IngressError> {
        let serialized = serde_yaml::to_string(document)?;

        let backup_path = self.path.with_extension("yml.bak");
        self.write_atomic(&backup_path, previous).await?;
        self.write_atomic(&self.path, &serialized).await?;

        match self.read().await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error_msg = %err, "ingress file invalid after write, restoring backup");
                self.write_atomic(&self.path, previous).await?;
                Err(IngressError::ConfigCorrupted(err.to_string()))
            }
        }
    }

    async fn write_atomic(&self, target: &Path, content: &str) -> Result<(), IngressError> {
        // The temp file lives next to the target so the rename stays on
        // one filesystem.
        let tmp_path = target.with_extension("tmp");
        let map_err = |err: std::io::Error| IngressError::Write {
            path: target.display().to_string(),
            err: err.to_string(),
        };

        tokio::fs::write(&tmp_path, content).await.map_err(map_err)?;
        tokio::fs::rename(&tmp_path, target).await.map_err(map_err)
    }

    /// Commits the change when the config directory is a git work tree.
    /// Best-effort: failures are logged, never propagated.
    async fn commit(&self, message: &str) {
        if !self.commit_changes {
            return;
        }
        let Some(dir) = self.path.parent() else {
            return;
        };
        let file_name = self.path.file_name().unwrap_or_default();

        let add = tokio::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .arg("add")
            .arg(file_name)
            .output()
            .await;
        if !matches!(&add, Ok(output) if output.status.success()) {
            debug!("config directory is not a git work tree, skipping backup commit");
            return;
        }

        let committed = tokio::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .arg("commit")
            .arg("-m")
            .arg(message)
            .output()
            .await;
        match committed {
            Ok(output) if output.status.success() => {
                debug!(message, "ingress change committed");
            }
            Ok(output) => {
                warn!(
                    status = %output.status,
                    "git commit of ingress change did not succeed"
                );
            }
            Err(err) => warn!(error_msg = %err, "running git commit"),
        }
    }
}
