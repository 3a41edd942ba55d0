//! # fxdk-core
//!
//! Core types for the FxDK server supervisor.
//!
//! This crate provides the foundational types shared by the IPC channel and the supervisor:
//! - Server lifecycle state
//! - Resource paths and links
//! - Control requests and resource commands
//! - Dynamic handler registration with subscription tokens

pub mod error;
pub mod events;
pub mod resource;
pub mod state;

pub use error::{FxdkError, Result};
pub use events::{HandlerSet, ResourceCommand, SubscriptionId, SubscriptionScope};
pub use resource::{RelinkRequest, ResourceLink, StartRequest, resource_name};
pub use state::ServerState;
