//! zippy-link agent.
//!
//! Wraps a [`zlink_core::PeerNode`] in a long-running process: file and
//! environment configuration, a persistent identity, SQLite storage, the
//! built-in command handlers and a small CLI.

#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod handlers;
pub mod identity;
pub mod logging;
pub mod runtime;

pub use cli::{Cli, Commands};
pub use config::{AgentConfig, ConfigError};
pub use runtime::Agent;
