//! Keep an SSH port forward alive: local listener, forwarded channels,
//! health checks and bounded reconnects.

pub mod config;
pub mod logging;
pub mod ssh;
