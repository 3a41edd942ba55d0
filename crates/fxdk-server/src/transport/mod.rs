//! Control surface transports

pub mod stdio;
