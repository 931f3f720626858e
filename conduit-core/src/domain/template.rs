//! Template domain types
//!
//! A template is a named, versioned pipeline blueprint. Resolving it against
//! caller parameters yields the `PipelineConfig` an execution runs with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::domain::provider::PipelineType;

/// Pipeline template definition
///
/// Immutable once published. A new version is published under a new `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub description: Option<String>,
    /// Capability a provider must declare to run this template.
    pub pipeline_type: PipelineType,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub stages: Vec<String>,
    /// Provider-facing settings; string leaves may contain `${param}` placeholders.
    #[serde(default)]
    pub settings: serde_json::Value,
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub published_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

/// Declared schema of a single template parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Allowed values, if the parameter is an enumeration.
    #[serde(default)]
    pub options: Option<Vec<serde_json::Value>>,
}

/// JSON type a parameter value must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    pub fn matches(self, value: &serde_json::Value) -> bool {
        use serde_json::Value;

        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Number => value.is_number(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => matches!(value, Value::Array(_)),
            ParameterType::Object => matches!(value, Value::Object(_)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Integer => "integer",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }
}

/// Concrete pipeline configuration handed to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_type: PipelineType,
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    pub timeout_seconds: Option<u64>,
    pub template_id: Option<String>,
    pub template_version: Option<u32>,
}

impl PipelineConfig {
    pub fn new(pipeline_type: PipelineType) -> Self {
        Self {
            pipeline_type,
            stages: Vec::new(),
            settings: serde_json::Value::Null,
            variables: HashMap::new(),
            timeout_seconds: None,
            template_id: None,
            template_version: None,
        }
    }
}
