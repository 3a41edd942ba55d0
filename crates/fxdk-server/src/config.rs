//! Supervisor configuration

use fxdk_core::{FxdkError, Result, resource_name};
use std::path::{Path, PathBuf};

/// Configuration for launching and supervising the server
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Server working directory, relative to the project (default: .fxserver)
    pub server_dir_name: String,
    /// Resources directory, relative to the server working directory (default: resources)
    pub resources_dir_name: String,
    /// TCP and UDP endpoint the server binds (default: 127.0.0.1:30120)
    pub endpoint: String,
    /// OneSync feature flag
    pub onesync: bool,
    /// Client limit (default: 48)
    pub max_clients: u32,
    /// LAN mode
    pub lan: bool,
    /// Directory of the bridge resource that runs inside the server
    pub bridge_resource: PathBuf,
    /// Local socket name of the IPC channel
    pub ipc_name: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_dir_name: ".fxserver".into(),
            resources_dir_name: "resources".into(),
            endpoint: "127.0.0.1:30120".into(),
            onesync: true,
            max_clients: 48,
            lan: true,
            bridge_resource: PathBuf::from("sdk-game"),
            ipc_name: "fxdk-supervisor.sock".into(),
        }
    }
}

impl SupervisorConfig {
    /// Server working directory for a project
    pub fn server_dir(&self, project_path: &Path) -> PathBuf {
        project_path.join(&self.server_dir_name)
    }

    /// Name the bridge resource is ensured under
    pub fn bridge_name(&self) -> Result<String> {
        resource_name(&self.bridge_resource).ok_or_else(|| {
            FxdkError::ConfigError(format!(
                "Bridge resource path has no name: {:?}",
                self.bridge_resource
            ))
        })
    }

    /// Check the configuration before a supervisor is built from it
    pub fn validate(&self) -> Result<()> {
        self.bridge_name()?;
        if self.endpoint.trim().is_empty() {
            return Err(FxdkError::ConfigError("Endpoint must not be empty".into()));
        }
        if self.ipc_name.trim().is_empty() {
            return Err(FxdkError::ConfigError("IPC name must not be empty".into()));
        }
        if self.server_dir_name.is_empty() || self.resources_dir_name.is_empty() {
            return Err(FxdkError::ConfigError(
                "Server and resources directory names must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = SupervisorConfig::default();
        let server_dir = config.server_dir(Path::new("/p"));
        assert_eq!(server_dir, PathBuf::from("/p/.fxserver"));
        assert_eq!(config.bridge_name().unwrap(), "sdk-game");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_nameless_bridge() {
        let config = SupervisorConfig {
            bridge_resource: PathBuf::from("/"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FxdkError::ConfigError(_))));
    }
}
