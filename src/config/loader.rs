//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "service:\n  endpoint: http://localhost:8000/api/v1\n"
        )
        .unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.service.endpoint, "http://localhost:8000/api/v1");
        assert_eq!(config.transfer.concurrent_parts, 3);
    }

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("MIZUCHI_TEST_ENDPOINT", "http://upload.test:9000");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "service:\n  endpoint: ${{MIZUCHI_TEST_ENDPOINT}}\n"
        )
        .unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.service.endpoint, "http://upload.test:9000");
        std::env::remove_var("MIZUCHI_TEST_ENDPOINT");
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "service:\n  endpoint: http://localhost:8000\ntransfer:\n  chunk_size: 0\n"
        )
        .unwrap();

        assert!(matches!(
            ConfigLoader::load(file.path()),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
