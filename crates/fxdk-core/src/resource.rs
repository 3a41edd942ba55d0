//! Resource paths, links and control request payloads

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name a resource is known by inside the server: the basename of its directory
pub fn resource_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// A directory link from a resource source to its place in the server resources directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLink {
    /// Resource name (basename of the source)
    pub name: String,
    /// Resource directory in the project
    pub source: PathBuf,
    /// Link location under the server resources directory
    pub destination: PathBuf,
}

impl ResourceLink {
    /// Pair a source resource with its destination under `resources_dir`.
    ///
    /// Returns `None` when the source has no basename (e.g. a filesystem root).
    pub fn new(source: &Path, resources_dir: &Path) -> Option<Self> {
        let name = resource_name(source)?;
        Some(Self {
            destination: resources_dir.join(&name),
            source: source.to_path_buf(),
            name,
        })
    }
}

/// Payload of the `start` and `refreshResources` commands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub project_path: PathBuf,
    /// Enabled resources, in load order
    #[serde(default)]
    pub enabled_resource_paths: Vec<PathBuf>,
}

/// Payload of the `relinkResources` collaborator event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelinkRequest {
    pub project_path: PathBuf,
    #[serde(default)]
    pub resource_paths: Vec<PathBuf>,
    /// Linked resources under this path get a `restart` directive after relinking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_resources_with_path: Option<PathBuf>,
}
