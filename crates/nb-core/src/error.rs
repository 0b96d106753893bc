//! Core error types for nixbridge

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while starting a bridged process
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The configured command could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A standard stream was not captured on the child
    #[error("Child process has no {0} pipe")]
    MissingPipe(&'static str),

    /// The command line is empty
    #[error("No command configured")]
    EmptyCommand,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
