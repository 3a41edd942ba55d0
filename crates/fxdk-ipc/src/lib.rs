//! IPC channel between the supervisor and the bridge resource
//!
//! This crate provides:
//! - Wire protocol: newline-delimited JSON arrays `[type, payload]`
//! - Line transport abstractions (AsyncReader/AsyncWriter traits)
//! - The listening channel that owns the single peer connection and its handlers

pub mod channel;
pub mod protocol;
pub mod transport;

pub use channel::{InboundSink, IpcChannel};
pub use protocol::{Directive, Notice, decode_notice, encode_frame};
pub use transport::{AsyncReader, AsyncWriter, LineReader, LineWriter};
