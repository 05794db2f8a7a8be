//! Tool parameter schema registry (C10).
//!
//! Grounded on `Tool::validate_args` in the teacher's `langgraph-core::tool`
//! module: a typed parameter description is compiled to JSON Schema with the
//! `jsonschema` crate and used both to validate a call before it reaches a
//! backend and to describe a tool's parameters to an LLM provider.

use crate::error::{OrchestratorError, Result};
use jsonschema::JSONSchema;
use std::collections::HashMap;

/// A single field in a tool's parameter record.
#[derive(Debug, Clone)]
pub enum FieldType {
    String { enum_values: Option<Vec<String>> },
    Integer { minimum: Option<i64>, maximum: Option<i64> },
    Number { minimum: Option<f64>, maximum: Option<f64> },
    Boolean,
    Array(Box<FieldType>),
    Object(Vec<Field>),
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self { name: name.into(), field_type, required }
    }
}

/// A typed description of a tool's parameters, convertible to JSON Schema.
#[derive(Debug, Clone)]
pub struct ParameterSchema {
    pub fields: Vec<Field>,
}

impl ParameterSchema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Renders this description as a portable JSON-schema-shaped object.
    pub fn to_json_schema(&self) -> serde_json::Value {
        fields_to_schema(&self.fields)
    }
}

fn field_type_to_schema(field_type: &FieldType) -> serde_json::Value {
    match field_type {
        FieldType::String { enum_values } => {
            let mut schema = serde_json::json!({"type": "string"});
            if let Some(values) = enum_values {
                schema["enum"] = serde_json::Value::Array(values.iter().map(|v| serde_json::Value::String(v.clone())).collect());
            }
            schema
        }
        FieldType::Integer { minimum, maximum } => {
            let mut schema = serde_json::json!({"type": "integer"});
            if let Some(min) = minimum {
                schema["minimum"] = serde_json::json!(min);
            }
            if let Some(max) = maximum {
                schema["maximum"] = serde_json::json!(max);
            }
            schema
        }
        FieldType::Number { minimum, maximum } => {
            let mut schema = serde_json::json!({"type": "number"});
            if let Some(min) = minimum {
                schema["minimum"] = serde_json::json!(min);
            }
            if let Some(max) = maximum {
                schema["maximum"] = serde_json::json!(max);
            }
            schema
        }
        FieldType::Boolean => serde_json::json!({"type": "boolean"}),
        FieldType::Array(item) => serde_json::json!({"type": "array", "items": field_type_to_schema(item)}),
        FieldType::Object(fields) => fields_to_schema(fields),
    }
}

fn fields_to_schema(fields: &[Field]) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for field in fields {
        properties.insert(field.name.clone(), field_type_to_schema(&field.field_type));
        if field.required {
            required.push(serde_json::Value::String(field.name.clone()));
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": serde_json::Value::Object(properties),
        "required": required,
    })
}

#[derive(Debug, Clone)]
pub struct ToolVersion {
    pub version: u32,
    pub schema: serde_json::Value,
    pub tags: Vec<String>,
    pub deprecated: bool,
}

struct ToolRecord {
    current: u32,
    history: HashMap<u32, ToolVersion>,
}

/// Versioned store of tool parameter schemas. Registering a tool name that
/// already exists adds a new version rather than replacing the old one.
pub struct SchemaRegistry {
    tools: HashMap<String, ToolRecord>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Pre-registers the six tool mappings the bridge and planner agree on,
    /// each starting at version 1.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        for (name, schema) in builtin_schemas() {
            registry.register(name, schema, None, vec!["builtin".to_string()]);
        }
        registry
    }

    /// Registers `schema` under `name`. `version` pins an explicit version
    /// number; omitting it appends the next one after the current latest.
    pub fn register(&mut self, name: impl Into<String>, schema: ParameterSchema, version: Option<u32>, tags: Vec<String>) -> u32 {
        let name = name.into();
        let json_schema = schema.to_json_schema();
        let record = self.tools.entry(name).or_insert_with(|| ToolRecord { current: 0, history: HashMap::new() });
        let version = version.unwrap_or(record.current + 1);
        record.history.insert(version, ToolVersion { version, schema: json_schema, tags, deprecated: false });
        if version >= record.current {
            record.current = version;
        }
        version
    }

    /// Returns the current version, or a specific historical one.
    pub fn get(&self, name: &str, version: Option<u32>) -> Option<&ToolVersion> {
        let record = self.tools.get(name)?;
        let version = version.unwrap_or(record.current);
        record.history.get(&version)
    }

    pub fn get_by_tags(&self, tags: &[String]) -> Vec<(&str, &ToolVersion)> {
        self.tools
            .iter()
            .filter_map(|(name, record)| {
                let current = record.history.get(&record.current)?;
                tags.iter().all(|t| current.tags.contains(t)).then_some((name.as_str(), current))
            })
            .collect()
    }

    /// Marks a specific version deprecated without removing it from history.
    pub fn deprecate(&mut self, name: &str, version: u32) -> bool {
        match self.tools.get_mut(name).and_then(|record| record.history.get_mut(&version)) {
            Some(entry) => {
                entry.deprecated = true;
                true
            }
            None => false,
        }
    }

    /// Validates `params` against the current schema registered for `name`.
    /// A tool with no registered schema passes validation unconditionally.
    pub fn validate(&self, name: &str, params: &serde_json::Value) -> Result<()> {
        let Some(entry) = self.get(name, None) else {
            return Ok(());
        };

        let compiled = JSONSchema::compile(&entry.schema)
            .map_err(|e| OrchestratorError::Schema(format!("invalid schema for '{name}': {e}")))?;

        if let Err(errors) = compiled.validate(params) {
            let messages: Vec<String> = errors.map(|e| format!("{}: {}", e.instance_path, e)).collect();
            return Err(OrchestratorError::Schema(format!("'{name}' parameters invalid: {}", messages.join("; "))));
        }

        Ok(())
    }
}

fn builtin_schemas() -> Vec<(&'static str, ParameterSchema)> {
    vec![
        (
            "sd_generate",
            ParameterSchema::new(vec![
                Field::new("prompt", FieldType::String { enum_values: None }, true),
                Field::new("model", FieldType::String { enum_values: None }, false),
                Field::new("width", FieldType::Integer { minimum: Some(64), maximum: Some(2048) }, false),
                Field::new("height", FieldType::Integer { minimum: Some(64), maximum: Some(2048) }, false),
                Field::new("steps", FieldType::Integer { minimum: Some(1), maximum: Some(150) }, false),
                Field::new("cfg_scale", FieldType::Number { minimum: Some(0.0), maximum: Some(30.0) }, false),
            ]),
        ),
        (
            "upscale_image",
            ParameterSchema::new(vec![
                Field::new("scale_factor", FieldType::Integer { minimum: Some(2), maximum: Some(4) }, true),
                Field::new("model", FieldType::String { enum_values: None }, false),
            ]),
        ),
        (
            "generate_animation",
            ParameterSchema::new(vec![
                Field::new(
                    "animation_type",
                    FieldType::String { enum_values: Some(vec!["video".to_string(), "gif".to_string()]) },
                    true,
                ),
                Field::new("duration_s", FieldType::Number { minimum: Some(0.5), maximum: Some(30.0) }, false),
                Field::new("fps", FieldType::Integer { minimum: Some(1), maximum: Some(60) }, false),
            ]),
        ),
        (
            "transcribe_audio",
            ParameterSchema::new(vec![
                Field::new("audio_input", FieldType::String { enum_values: None }, true),
                Field::new("model", FieldType::String { enum_values: None }, false),
            ]),
        ),
        (
            "synthesize_speech",
            ParameterSchema::new(vec![
                Field::new("text", FieldType::String { enum_values: None }, true),
                Field::new("voice", FieldType::String { enum_values: None }, false),
                Field::new("speed", FieldType::Number { minimum: Some(0.25), maximum: Some(4.0) }, false),
            ]),
        ),
        (
            "upload_file",
            ParameterSchema::new(vec![
                Field::new("description", FieldType::String { enum_values: None }, false),
                Field::new(
                    "destination",
                    FieldType::String { enum_values: Some(vec!["local".to_string(), "telegram".to_string()]) },
                    true,
                ),
            ]),
        ),
    ]
}
