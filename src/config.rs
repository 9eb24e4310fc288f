//! VM configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! { "stack_size": 4096, "fixed_stack": true }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compiler::CompileOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Initial (or, with `fixed_stack`, maximum) stack capacity in values.
    pub stack_size: usize,
    pub fixed_stack: bool,
    pub max_call_depth: usize,
    /// Record line tables and local live ranges when compiling.
    pub debug_info: bool,
    pub source_name: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: 1024,
            fixed_stack: false,
            max_call_depth: 256,
            debug_info: true,
            source_name: "main".into(),
        }
    }
}

impl VmConfig {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            source_name: self.source_name.clone(),
            debug_info: self.debug_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.stack_size, 1024);
        assert!(!config.fixed_stack);
        assert_eq!(config.max_call_depth, 256);
        assert!(config.debug_info);
        assert_eq!(config.source_name, "main");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = VmConfig::from_json(r#"{ "stack_size": 64, "fixed_stack": true }"#).unwrap();
        assert_eq!(config.stack_size, 64);
        assert!(config.fixed_stack);
        assert_eq!(config.max_call_depth, 256);
    }

    #[test]
    fn test_compile_options() {
        let config = VmConfig {
            debug_info: false,
            source_name: "lib".into(),
            ..VmConfig::default()
        };
        let options = config.compile_options();
        assert!(!options.debug_info);
        assert_eq!(options.source_name, "lib");
    }
}
