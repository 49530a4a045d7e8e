//! Engine configuration (`[redefine]` table)
//!
//! ```toml
//! [redefine]
//! introspectable-prefixes = ["app/", "lib/model/"]
//! verify-rewritten = true
//! max-stack = 1024
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Redefinition engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Types whose name starts with one of these may always be introspected
    /// for a baseline
    #[serde(default)]
    pub introspectable_prefixes: Vec<String>,

    /// Run the verifier over every rewritten body before installing it
    #[serde(default = "default_verify_rewritten")]
    pub verify_rewritten: bool,

    /// Largest operand stack a rewritten body may need
    #[serde(default = "default_max_stack")]
    pub max_stack: u16,
}

fn default_verify_rewritten() -> bool {
    true
}

fn default_max_stack() -> u16 {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            introspectable_prefixes: Vec::new(),
            verify_rewritten: default_verify_rewritten(),
            max_stack: default_max_stack(),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    redefine: EngineConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse the `[redefine]` table of a TOML document
    ///
    /// A document without the table yields the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        file.redefine.validate()?;
        Ok(file.redefine)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_stack == 0 {
            return Err(ConfigError::ValidationError(
                "max-stack must be at least 1".to_string(),
            ));
        }
        if let Some(empty) = self.introspectable_prefixes.iter().position(String::is_empty) {
            return Err(ConfigError::ValidationError(format!(
                "introspectable-prefixes[{}] is empty and would match every type",
                empty
            )));
        }
        Ok(())
    }

    /// Whether `type_name` matches a configured introspectable prefix
    pub fn is_introspectable(&self, type_name: &str) -> bool {
        self.introspectable_prefixes
            .iter()
            .any(|prefix| type_name.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_table() {
        let config = EngineConfig::from_toml_str("[other]\nkey = 1\n").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.verify_rewritten);
        assert_eq!(config.max_stack, 1024);
    }

    #[test]
    fn test_parse_redefine_table() {
        let toml = r#"
[redefine]
introspectable-prefixes = ["app/", "lib/model/"]
verify-rewritten = false
max-stack = 64
"#;
        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert!(!config.verify_rewritten);
        assert_eq!(config.max_stack, 64);
        assert!(config.is_introspectable("app/Point"));
        assert!(config.is_introspectable("lib/model/User"));
        assert!(!config.is_introspectable("lib/Other"));
    }

    #[test]
    fn test_rejects_zero_stack() {
        let err = EngineConfig::from_toml_str("[redefine]\nmax-stack = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_rejects_empty_prefix() {
        let err =
            EngineConfig::from_toml_str("[redefine]\nintrospectable-prefixes = [\"\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("[redefine\n"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
