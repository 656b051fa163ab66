//! Bridge module configuration.
//!
//! A config names the module, fixes its namespace, sizes its queues and
//! carries the static descriptor list. It can be written by hand in TOML:
//!
//! ```toml
//! [module]
//! name = "ProgressBridge"
//! package = "com.example"
//!
//! [[futures]]
//! name = "add"
//! returns = "int"
//! parameters = [{ name = "a", type = "int" }, { name = "b", type = "int" }]
//!
//! [[streams]]
//! name = "progress"
//! payload = "float"
//! ```

use std::path::Path;

use chimera_types::{DescriptorSet, MethodDescriptor, StreamDescriptor};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Module identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Host-visible module name, usually PascalCase
    pub name: String,
    /// Package namespace the channel name is derived from
    #[serde(default = "default_package")]
    pub package: String,
}

fn default_package() -> String {
    "chimera".to_string()
}

/// Queue sizing and thread naming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of the queue feeding the confinement thread
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Per-subscriber event buffer before slow subscribers start lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Name of the confinement thread (defaults to `chimera:<channel>`)
    #[serde(default)]
    pub thread_name: Option<String>,
}

fn default_command_capacity() -> usize {
    32
}

fn default_event_capacity() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_capacity: default_command_capacity(),
            event_capacity: default_event_capacity(),
            thread_name: None,
        }
    }
}

/// Full configuration of one bridge module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub module: ModuleInfo,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(flatten)]
    pub descriptors: DescriptorSet,
}

impl BridgeConfig {
    pub fn new(name: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            module: ModuleInfo {
                name: name.into(),
                package: package.into(),
            },
            runtime: RuntimeConfig::default(),
            descriptors: DescriptorSet::default(),
        }
    }

    /// Declare a future method (builder style)
    pub fn future(mut self, method: MethodDescriptor) -> Self {
        self.descriptors.futures.push(method);
        self
    }

    /// Declare a stream (builder style)
    pub fn stream(mut self, stream: StreamDescriptor) -> Self {
        self.descriptors.streams.push(stream);
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.module.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        self.descriptors.validate()?;
        Ok(())
    }

    /// Channel and engine namespace: `"{package}.{snake_case(name)}"`
    pub fn channel_name(&self) -> String {
        format!("{}.{}", self.module.package, snake_case(&self.module.name))
    }

    pub fn thread_name(&self) -> String {
        self.runtime
            .thread_name
            .clone()
            .unwrap_or_else(|| format!("chimera:{}", self.channel_name()))
    }
}

/// Convert `PascalCase`/`camelCase`/`kebab-case` to `snake_case`.
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch == '-' || ch == ' ' || ch == '_' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        } else if ch.is_uppercase() {
            if prev_lower && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chimera_types::ParamType;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    const SAMPLE: &str = r#"
        [module]
        name = "ProgressBridge"
        package = "com.example"

        [runtime]
        event_capacity = 16

        [[futures]]
        name = "add"
        returns = "int"
        parameters = [{ name = "a", type = "int" }, { name = "b", type = "int" }]

        [[futures]]
        name = "fail"

        [[streams]]
        name = "progress"
        payload = "float"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = assert_ok!(BridgeConfig::from_toml_str(SAMPLE));
        assert_eq!(config.module.name, "ProgressBridge");
        assert_eq!(config.runtime.event_capacity, 16);
        assert_eq!(config.runtime.command_capacity, 32);
        assert_eq!(config.descriptors.futures.len(), 2);
        assert_eq!(
            config.descriptors.method("add").map(|m| m.returns),
            Some(ParamType::Int)
        );
        assert!(config.descriptors.has_stream("progress"));
        assert_eq!(config.channel_name(), "com.example.progress_bridge");
        assert_eq!(config.thread_name(), "chimera:com.example.progress_bridge");
    }

    #[test]
    fn test_invalid_configs() {
        let duplicate = r#"
            [module]
            name = "Dup"
            [[futures]]
            name = "x"
            [[streams]]
            name = "x"
        "#;
        assert!(matches!(
            BridgeConfig::from_toml_str(duplicate),
            Err(ConfigError::Descriptors(_))
        ));

        let unnamed = "[module]\nname = \"  \"\n";
        assert!(matches!(
            BridgeConfig::from_toml_str(unnamed),
            Err(ConfigError::MissingName)
        ));

        assert!(matches!(
            BridgeConfig::from_toml_str("module = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = assert_ok!(BridgeConfig::load(file.path()));
        assert_eq!(config.module.package, "com.example");

        assert_err!(BridgeConfig::load(file.path().with_extension("missing")));
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("ProgressBridge"), "progress_bridge");
        assert_eq!(snake_case("myHTTPModule"), "my_httpmodule");
        assert_eq!(snake_case("image-filters"), "image_filters");
        assert_eq!(snake_case("Sensor2Bridge"), "sensor2_bridge");
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::new("Calc", "org.test")
            .future(MethodDescriptor::new("add"))
            .stream(StreamDescriptor::new("tick", ParamType::Int));
        assert_ok!(config.validate());
        assert_eq!(config.channel_name(), "org.test.calc");
    }
}
