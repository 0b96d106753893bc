//! Configuration management for nixbridge

mod daemon;

pub use daemon::{DaemonConfig, DEFAULT_COMMAND, DEFAULT_LISTEN_ADDRESS};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nixbridge")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_missing_file() {
        let err = load_config::<DaemonConfig>(Path::new("/nonexistent/nixbridge.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_partial_config_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "listen_address = \"0.0.0.0:2222\"").unwrap();
        writeln!(file, "max_connections = 4").unwrap();

        let config: DaemonConfig = load_config(file.path()).unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:2222");
        assert_eq!(config.max_connections, Some(4));
        assert_eq!(config.command, DaemonConfig::default().command);
        assert_eq!(config.inactivity_timeout, None);
    }

    #[test]
    fn test_load_command_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "command = [\"/bin/cat\"]").unwrap();
        writeln!(file, "inactivity_timeout = 300").unwrap();

        let config: DaemonConfig = load_config(file.path()).unwrap();
        assert_eq!(config.command, vec!["/bin/cat".to_string()]);
        assert_eq!(
            config.inactivity_timeout,
            Some(std::time::Duration::from_secs(300))
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_load_malformed_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "listen_address = ").unwrap();

        let err = load_config::<DaemonConfig>(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
