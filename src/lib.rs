//! pbxwatch library - MikoPBX extension and trunk monitoring
//!
//! This module exports internal components for integration testing.

pub mod cli;
pub mod config;
pub mod health;
pub mod notify;
pub mod pbx;
pub mod redact;
pub mod scheduler;
pub mod watch;
