//! # fxdk-server
//!
//! Local development server supervisor for FxDK projects.
//!
//! This crate provides:
//! - `ResourceLinker` for mirroring project resources into the server directory
//! - `Supervisor` for launching, watching and killing the server process
//! - `Lifecycle` state machine driven by process events and the bridge resource
//! - `ControlBus` and a stdio transport for the UI collaborator

pub mod config;
pub mod control;
pub mod launch;
pub mod lifecycle;
pub mod linker;
pub mod supervisor;
pub mod transport;

pub use config::SupervisorConfig;
pub use control::{ControlBus, ControlCommand, ControlEvent, EventReceiver};
pub use launch::{ExecutableResolver, FixedExecutable, VersionedInstall, server_args};
pub use lifecycle::Lifecycle;
pub use linker::{LinkReport, ResourceLinker};
pub use supervisor::Supervisor;
