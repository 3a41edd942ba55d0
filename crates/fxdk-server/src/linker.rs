//! Resource directory reconciliation
//!
//! The server resources directory is rebuilt from scratch on every call: the old directory is
//! removed, recreated empty, and one directory link is created per resource. The bridge
//! resource is always linked first. A resource that cannot be linked is logged and skipped so
//! the rest of the server still comes up.

use crate::config::SupervisorConfig;
use fxdk_core::{FxdkError, ResourceLink, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info};

/// Outcome of one reconciliation
#[derive(Debug, Default)]
pub struct LinkReport {
    /// Links that were created, bridge resource first
    pub links: Vec<ResourceLink>,
    /// Resources that could not be linked, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

impl LinkReport {
    /// Names of the linked resources
    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|link| link.name.as_str()).collect()
    }
}

/// Mirrors resource directories into a server working directory
#[derive(Debug, Clone)]
pub struct ResourceLinker {
    bridge_resource: PathBuf,
    resources_dir_name: String,
}

impl ResourceLinker {
    pub fn new(bridge_resource: impl Into<PathBuf>, resources_dir_name: impl Into<String>) -> Self {
        Self {
            bridge_resource: bridge_resource.into(),
            resources_dir_name: resources_dir_name.into(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(&config.bridge_resource, &config.resources_dir_name)
    }

    /// Replace the resources directory under `server_dir` with links to `resources`.
    ///
    /// `server_dir` must exist. Failing to remove or recreate the resources directory is an
    /// error; failing to link a single resource is only logged.
    pub async fn link_resources(&self, server_dir: &Path, resources: &[PathBuf]) -> Result<LinkReport> {
        let resources_dir = server_dir.join(&self.resources_dir_name);

        match fs::remove_dir_all(&resources_dir).await {
            Ok(()) => debug!("Removed {:?}", resources_dir),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FxdkError::FilesystemError(format!(
                    "Failed to remove {:?}: {}",
                    resources_dir, e
                )));
            }
        }

        fs::create_dir_all(&resources_dir).await.map_err(|e| {
            FxdkError::FilesystemError(format!("Failed to create {:?}: {}", resources_dir, e))
        })?;

        let mut report = LinkReport::default();
        for source in std::iter::once(&self.bridge_resource).chain(resources) {
            let Some(link) = ResourceLink::new(source, &resources_dir) else {
                error!("Cannot link resource without a name: {:?}", source);
                report.failed.push((source.clone(), "resource path has no name".into()));
                continue;
            };

            match create_link(&link).await {
                Ok(()) => {
                    debug!("Linked {:?} -> {:?}", link.destination, link.source);
                    report.links.push(link);
                }
                Err(e) => {
                    error!("Failed to link resource {}: {}", link.name, e);
                    report.failed.push((source.clone(), e));
                }
            }
        }

        info!(
            "Linked {} resource(s) into {:?} ({} failed)",
            report.links.len(),
            resources_dir,
            report.failed.len()
        );
        Ok(report)
    }
}

async fn create_link(link: &ResourceLink) -> std::result::Result<(), String> {
    match fs::metadata(&link.source).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(format!("{:?} is not a directory", link.source)),
        Err(e) => return Err(format!("{:?}: {}", link.source, e)),
    }

    #[cfg(unix)]
    let result = fs::symlink(&link.source, &link.destination).await;
    #[cfg(windows)]
    let result = fs::symlink_dir(&link.source, &link.destination).await;

    result.map_err(|e| format!("{:?} -> {:?}: {}", link.destination, link.source, e))
}
