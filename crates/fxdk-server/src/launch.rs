//! Server executable resolution and startup arguments

use crate::config::SupervisorConfig;
use fxdk_core::{Result, resource_name};
use std::path::PathBuf;
use tracing::warn;

#[cfg(windows)]
const SERVER_EXECUTABLE: &str = "FXServer.exe";
#[cfg(not(windows))]
const SERVER_EXECUTABLE: &str = "FXServer";

/// Locates the server executable.
///
/// Version selection is the caller's business; resolvers only report whether the
/// executable they point at exists.
pub trait ExecutableResolver: Send + Sync {
    /// Path to the executable, or `None` if it is not installed
    fn resolve(&self) -> Option<PathBuf>;
}

/// An explicitly configured executable
#[derive(Debug, Clone)]
pub struct FixedExecutable(pub PathBuf);

impl ExecutableResolver for FixedExecutable {
    fn resolve(&self) -> Option<PathBuf> {
        self.0.is_file().then(|| self.0.clone())
    }
}

/// An executable inside a versioned install tree: `<root>/<version>/FXServer`
#[derive(Debug, Clone)]
pub struct VersionedInstall {
    pub root: PathBuf,
    pub version: String,
}

impl VersionedInstall {
    pub fn new(root: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            version: version.into(),
        }
    }

    /// Where the executable is expected for this version
    pub fn executable_path(&self) -> PathBuf {
        self.root.join(&self.version).join(SERVER_EXECUTABLE)
    }
}

impl ExecutableResolver for VersionedInstall {
    fn resolve(&self) -> Option<PathBuf> {
        let path = self.executable_path();
        path.is_file().then_some(path)
    }
}

/// Build the server command line.
///
/// Fixed settings come first, then the bridge resource, then one `+ensure` per enabled
/// resource in the given order, which is the order the server loads them in.
pub fn server_args(config: &SupervisorConfig, enabled_resources: &[PathBuf]) -> Result<Vec<String>> {
    let bridge = config.bridge_name()?;

    let mut args: Vec<String> = vec![
        "+endpoint_add_tcp".into(),
        config.endpoint.clone(),
        "+endpoint_add_udp".into(),
        config.endpoint.clone(),
        "+set".into(),
        "onesync".into(),
        if config.onesync { "on" } else { "off" }.into(),
        "+set".into(),
        "sv_maxclients".into(),
        config.max_clients.to_string(),
        "+set".into(),
        "sv_lan".into(),
        if config.lan { "1" } else { "0" }.into(),
        "+add_ace".into(),
        format!("resource.{}", bridge),
        "command".into(),
        "allow".into(),
        "+ensure".into(),
        bridge,
    ];

    for path in enabled_resources {
        match resource_name(path) {
            Some(name) => {
                args.push("+ensure".into());
                args.push(name);
            }
            None => warn!("Skipping resource without a name: {:?}", path),
        }
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_end_with_resources_in_order() {
        let config = SupervisorConfig {
            bridge_resource: PathBuf::from("/opt/fxdk/bridge"),
            ..Default::default()
        };
        let args = server_args(
            &config,
            &[PathBuf::from("/p/res/a"), PathBuf::from("/p/res/b")],
        )
        .unwrap();

        assert_eq!(&args[..4], ["+endpoint_add_tcp", "127.0.0.1:30120", "+endpoint_add_udp", "127.0.0.1:30120"]);
        let tail: Vec<&str> = args[args.len() - 10..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            [
                "+add_ace", "resource.bridge", "command", "allow", "+ensure", "bridge", "+ensure", "a",
                "+ensure", "b"
            ]
        );
    }

    #[test]
    fn test_flags_follow_config() {
        let config = SupervisorConfig {
            onesync: false,
            lan: false,
            max_clients: 8,
            ..Default::default()
        };
        let args = server_args(&config, &[]).unwrap().join(" ");
        assert!(args.contains("+set onesync off"));
        assert!(args.contains("+set sv_maxclients 8"));
        assert!(args.contains("+set sv_lan 0"));
        assert!(args.ends_with("+ensure sdk-game"));
    }

    #[test]
    fn test_nameless_resource_is_skipped() {
        let args = server_args(&SupervisorConfig::default(), &[PathBuf::from("/")]).unwrap();
        assert_eq!(args.last().map(String::as_str), Some("sdk-game"));
    }

    #[test]
    fn test_versioned_install_requires_executable() {
        let root = tempfile::tempdir().unwrap();
        let install = VersionedInstall::new(root.path(), "7290");
        assert_eq!(install.resolve(), None);

        std::fs::create_dir_all(root.path().join("7290")).unwrap();
        std::fs::write(install.executable_path(), b"").unwrap();
        assert_eq!(install.resolve(), Some(install.executable_path()));
    }

    #[test]
    fn test_fixed_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("FXServer");
        assert_eq!(FixedExecutable(exe.clone()).resolve(), None);
        std::fs::write(&exe, b"").unwrap();
        assert_eq!(FixedExecutable(exe.clone()).resolve(), Some(exe));
    }
}
