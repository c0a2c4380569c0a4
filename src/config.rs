//! Runtime configuration types.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Size of the stack region in bytes
    pub stack_size: u32,
    /// Heap capacity reserved when a program is loaded
    pub initial_heap_size: u32,
    /// Hard limit on the heap region; growing past it is fatal
    pub max_heap_size: u32,
    /// Maximum number of simultaneously active calls
    pub call_stack_size: usize,
    /// Grow the heap when less than this fraction is free after a collection
    pub min_heap_free_ratio: f32,
    /// Shrink the heap when more than this fraction is free after a collection
    pub max_heap_free_ratio: f32,
    /// Include the full call stack in fatal error reports
    pub print_call_stack: bool,
    /// Print GC statistics when the program finishes
    pub gc_stats: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: 1024 * 1024,
            initial_heap_size: 2 * 1024 * 1024,
            max_heap_size: 1024 * 1024 * 1024,
            call_stack_size: 1000,
            min_heap_free_ratio: 0.4,
            max_heap_free_ratio: 0.7,
            print_call_stack: true,
            gc_stats: false,
        }
    }
}

impl RuntimeConfig {
    /// Load a configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size == 0 {
            return Err(ConfigError::Invalid("stack_size must be positive".to_string()));
        }
        if self.call_stack_size == 0 {
            return Err(ConfigError::Invalid(
                "call_stack_size must be positive".to_string(),
            ));
        }
        if self.initial_heap_size > self.max_heap_size {
            return Err(ConfigError::Invalid(format!(
                "initial_heap_size ({}) exceeds max_heap_size ({})",
                self.initial_heap_size, self.max_heap_size
            )));
        }
        let ratio_ok = |r: f32| r > 0.0 && r < 1.0;
        if !ratio_ok(self.min_heap_free_ratio) || !ratio_ok(self.max_heap_free_ratio) {
            return Err(ConfigError::Invalid(
                "heap free ratios must lie strictly between 0 and 1".to_string(),
            ));
        }
        if self.min_heap_free_ratio >= self.max_heap_free_ratio {
            return Err(ConfigError::Invalid(format!(
                "min_heap_free_ratio ({}) must be below max_heap_free_ratio ({})",
                self.min_heap_free_ratio, self.max_heap_free_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: RuntimeConfig = toml::from_str("stack_size = 4096\ngc_stats = true\n").unwrap();
        assert_eq!(config.stack_size, 4096);
        assert!(config.gc_stats);
        assert_eq!(config.call_stack_size, RuntimeConfig::default().call_stack_size);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_ratios() {
        let config = RuntimeConfig {
            min_heap_free_ratio: 0.8,
            max_heap_free_ratio: 0.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.toml");
        fs::write(&path, "initial_heap_size = 128\nmax_heap_size = 4096\n").unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.initial_heap_size, 128);
        assert_eq!(config.max_heap_size, 4096);
    }
}
