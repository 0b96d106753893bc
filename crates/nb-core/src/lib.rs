//! nb-core: Core types and configuration for nixbridge
//!
//! This crate provides the configuration structures, error types and the
//! channel/request vocabulary shared by the daemon and its tests.

pub mod config;
pub mod error;
pub mod types;

pub use error::{BridgeError, ConfigError};
pub use types::{ChannelKind, RequestKind};
