//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

/// Address the daemon listens on when nothing else is configured
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:2022";

/// The fixed command run for every accepted exec request
pub const DEFAULT_COMMAND: &[&str] = &[
    "/bin/nix",
    "daemon",
    "--stdio",
    "--extra-experimental-features",
    "nix-command daemon-trust-override",
    "--force-trusted",
];

/// Configuration for the nixbridge daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address to bind the SSH server to
    pub listen_address: String,

    /// Program and arguments started for each exec request.
    /// Never combined with anything the client sends.
    pub command: Vec<String>,

    /// Maximum number of concurrent connections
    pub max_connections: Option<u32>,

    /// Maximum open session channels per connection
    pub max_channels_per_connection: Option<u32>,

    /// Drop connections idle for this long (seconds)
    #[serde(with = "optional_secs")]
    pub inactivity_timeout: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            command: DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect(),
            max_connections: Some(128),
            max_channels_per_connection: Some(16),
            inactivity_timeout: None,
        }
    }
}

impl DaemonConfig {
    /// Check the values that would otherwise only fail once a client connects
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.first().map_or(true, |program| program.is_empty()) {
            return Err(ConfigError::Invalid("command must not be empty".to_string()));
        }

        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!(
                "listen_address {:?} is not host:port: {}",
                self.listen_address, e
            ))
        })?;

        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// The program to execute
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments passed to the program
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}

// Duration as whole seconds, absent means no timeout
mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_address, "127.0.0.1:2022");
        assert_eq!(config.program(), "/bin/nix");
        assert_eq!(
            config.args(),
            [
                "daemon",
                "--stdio",
                "--extra-experimental-features",
                "nix-command daemon-trust-override",
                "--force-trusted",
            ]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let config = DaemonConfig {
            command: vec![],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = DaemonConfig {
            command: vec![String::new()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let config = DaemonConfig {
            listen_address: "localhost".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let config = DaemonConfig {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_program_without_args() {
        let config = DaemonConfig {
            command: vec!["/bin/cat".to_string()],
            ..Default::default()
        };
        assert_eq!(config.program(), "/bin/cat");
        assert!(config.args().is_empty());
    }
}
