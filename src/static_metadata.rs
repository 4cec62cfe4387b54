//! Static metadata reader: the tool list bundled with a template.

use std::collections::HashSet;

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::model::ToolDescriptor;
use crate::template::{TemplateMetadata, TemplateTool};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("template '{0}' declares no tools")]
    MissingTools(String),

    #[error("duplicate tool name '{0}'")]
    DuplicateTool(String),

    #[error("tool '{tool}' has unusable parameters: {reason}")]
    InvalidParameters { tool: String, reason: String },
}

/// Read the declared tool list, in declaration order.
///
/// An empty `tools` array is a valid, empty capability set. Only a missing
/// `tools` field or unusable entries fail.
pub fn read_static_tools(
    metadata: &TemplateMetadata,
) -> Result<Vec<ToolDescriptor>, MetadataError> {
    let tools = metadata
        .tools
        .as_ref()
        .ok_or_else(|| MetadataError::MissingTools(metadata.name.clone()))?;

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(tools.len());
    for tool in tools {
        if !seen.insert(tool.name.as_str()) {
            return Err(MetadataError::DuplicateTool(tool.name.clone()));
        }
        descriptors.push(ToolDescriptor {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: input_schema(tool)?,
            output_schema: None,
            category: tool.category.clone(),
        });
    }
    Ok(descriptors)
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn input_schema(tool: &TemplateTool) -> Result<Value, MetadataError> {
    match &tool.parameters {
        None | Some(Value::Null) => Ok(empty_object_schema()),
        Some(Value::Object(map)) if looks_like_schema(map) => Ok(Value::Object(map.clone())),
        // Bare property map
        Some(Value::Object(map)) => Ok(json!({"type": "object", "properties": map})),
        Some(Value::Array(params)) => schema_from_list(tool, params),
        Some(other) => Err(MetadataError::InvalidParameters {
            tool: tool.name.clone(),
            reason: format!("expected object or array, got {}", json_type(other)),
        }),
    }
}

fn looks_like_schema(map: &Map<String, Value>) -> bool {
    map.is_empty()
        || map.contains_key("type")
        || map.contains_key("properties")
        || map.contains_key("$schema")
}

/// `[{name, type, description, required}]` into an object schema.
fn schema_from_list(tool: &TemplateTool, params: &[Value]) -> Result<Value, MetadataError> {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        let Some(name) = param.get("name").and_then(Value::as_str) else {
            return Err(MetadataError::InvalidParameters {
                tool: tool.name.clone(),
                reason: "parameter entry without a name".to_string(),
            });
        };
        let mut property = Map::new();
        property.insert(
            "type".to_string(),
            param.get("type").cloned().unwrap_or_else(|| json!("string")),
        );
        if let Some(description) = param.get("description") {
            property.insert("description".to_string(), description.clone());
        }
        if param.get("required").and_then(Value::as_bool).unwrap_or(false) {
            required.push(Value::String(name.to_string()));
        }
        properties.insert(name.to_string(), Value::Object(property));
    }
    let mut schema = json!({"type": "object", "properties": properties});
    if !required.is_empty() {
        schema["required"] = Value::Array(required);
    }
    Ok(schema)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
