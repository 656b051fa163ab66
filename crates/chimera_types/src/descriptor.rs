//! Method and stream descriptors
//!
//! Descriptors are the static, generation-time description of a bridge
//! module: which future methods the host may call and which streams the
//! embedded side may push. They never change for the lifetime of a module.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::value::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Semantic Types
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic type of a parameter, return value or stream payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
    #[default]
    Any,
}

impl ParamType {
    /// Check whether a wire value conforms to this type.
    ///
    /// `float` admits integers, `any` admits everything.
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (ParamType::Any, _) => true,
            (ParamType::Bool, Value::Bool(_)) => true,
            (ParamType::Int, Value::Int(_)) => true,
            (ParamType::Float, Value::Float(_) | Value::Int(_)) => true,
            (ParamType::String, Value::String(_)) => true,
            (ParamType::List, Value::List(_)) => true,
            (ParamType::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::String => "string",
            ParamType::List => "list",
            ParamType::Map => "map",
            ParamType::Any => "any",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// One named parameter of a future method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: ParamType,
    /// Whether null is accepted in place of a value
    #[serde(default)]
    pub optional: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Check a single argument against this parameter
    pub fn accepts(&self, value: &Value) -> bool {
        (self.optional && value.is_null()) || self.ty.admits(value)
    }
}

/// Describes one future-returning call into the embedded runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub returns: ParamType,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            returns: ParamType::Any,
        }
    }

    /// Append a parameter (builder style)
    pub fn param(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.parameters.push(Parameter::new(name, ty));
        self
    }

    /// Append a parameter that also accepts null
    pub fn optional_param(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.parameters.push(Parameter::new(name, ty).optional());
        self
    }

    pub fn returns(mut self, ty: ParamType) -> Self {
        self.returns = ty;
        self
    }
}

/// Describes one named, one-way push from the embedded runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    #[serde(default)]
    pub payload: ParamType,
}

impl StreamDescriptor {
    pub fn new(name: impl Into<String>, payload: ParamType) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor Set
// ─────────────────────────────────────────────────────────────────────────────

/// Problems found while validating a descriptor set
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Descriptor name must not be empty")]
    EmptyName,

    #[error("Duplicate future method: {0}")]
    DuplicateMethod(String),

    #[error("Duplicate stream: {0}")]
    DuplicateStream(String),

    #[error("Name {0} is used by both a future method and a stream")]
    NameClash(String),

    #[error("Duplicate parameter {param} in method {method}")]
    DuplicateParameter { method: String, param: String },
}

/// The full, static descriptor list of one bridge module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSet {
    #[serde(default)]
    pub futures: Vec<MethodDescriptor>,
    #[serde(default)]
    pub streams: Vec<StreamDescriptor>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn future(mut self, method: MethodDescriptor) -> Self {
        self.futures.push(method);
        self
    }

    pub fn stream(mut self, stream: StreamDescriptor) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.futures.iter().find(|m| m.name == name)
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.streams.iter().any(|s| s.name == name)
    }

    /// Stream names, in declaration order
    pub fn stream_names(&self) -> Vec<String> {
        self.streams.iter().map(|s| s.name.clone()).collect()
    }

    /// Reject empty or duplicated names.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let mut methods = HashSet::new();
        for method in &self.futures {
            if method.name.is_empty() {
                return Err(DescriptorError::EmptyName);
            }
            if !methods.insert(method.name.as_str()) {
                return Err(DescriptorError::DuplicateMethod(method.name.clone()));
            }

            let mut params = HashSet::new();
            for param in &method.parameters {
                if param.name.is_empty() {
                    return Err(DescriptorError::EmptyName);
                }
                if !params.insert(param.name.as_str()) {
                    return Err(DescriptorError::DuplicateParameter {
                        method: method.name.clone(),
                        param: param.name.clone(),
                    });
                }
            }
        }

        let mut streams = HashSet::new();
        for stream in &self.streams {
            if stream.name.is_empty() {
                return Err(DescriptorError::EmptyName);
            }
            if methods.contains(stream.name.as_str()) {
                return Err(DescriptorError::NameClash(stream.name.clone()));
            }
            if !streams.insert(stream.name.as_str()) {
                return Err(DescriptorError::DuplicateStream(stream.name.clone()));
            }
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DescriptorSet {
        DescriptorSet::new()
            .future(
                MethodDescriptor::new("add")
                    .param("a", ParamType::Int)
                    .param("b", ParamType::Int)
                    .returns(ParamType::Int),
            )
            .future(MethodDescriptor::new("fail"))
            .stream(StreamDescriptor::new("progress", ParamType::Float))
    }

    #[test]
    fn test_valid_set() {
        let set = sample();
        assert!(set.validate().is_ok());
        assert_eq!(set.method("add").map(|m| m.parameters.len()), Some(2));
        assert!(set.has_stream("progress"));
        assert!(!set.has_stream("add"));
        assert_eq!(set.stream_names(), vec!["progress".to_string()]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let set = sample().future(MethodDescriptor::new("add"));
        assert_eq!(
            set.validate(),
            Err(DescriptorError::DuplicateMethod("add".into()))
        );

        let set = sample().stream(StreamDescriptor::new("fail", ParamType::Any));
        assert_eq!(set.validate(), Err(DescriptorError::NameClash("fail".into())));

        let set = DescriptorSet::new().future(
            MethodDescriptor::new("pair")
                .param("x", ParamType::Int)
                .param("x", ParamType::Int),
        );
        assert!(matches!(
            set.validate(),
            Err(DescriptorError::DuplicateParameter { .. })
        ));
    }

    #[test]
    fn test_param_type_admission() {
        assert!(ParamType::Float.admits(&Value::Int(1)));
        assert!(!ParamType::Int.admits(&Value::Float(1.5)));
        assert!(ParamType::Any.admits(&Value::Null));
        assert!(!ParamType::Map.admits(&Value::Null));

        let p = Parameter::new("config", ParamType::Map).optional();
        assert!(p.accepts(&Value::Null));
        assert!(!p.accepts(&Value::Int(3)));
    }

    #[test]
    fn test_deserialize_from_json() {
        let method: MethodDescriptor = serde_json::from_str(
            r#"{"name": "scale", "parameters": [{"name": "factor", "type": "float"}]}"#,
        )
        .unwrap();
        assert_eq!(method.parameters[0].ty, ParamType::Float);
        assert!(!method.parameters[0].optional);
        assert_eq!(method.returns, ParamType::Any);
    }
}
