//! Translation of MCP tool input schemas (JSON Schema) into the model's
//! function-declaration schema.
//!
//! The translation never fails: unknown or unsupported types degrade to
//! `STRING` so a tool stays callable even when its schema cannot be modelled
//! exactly.

use crate::mcp::types::McpTool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

impl Schema {
    fn of(schema_type: SchemaType) -> Self {
        Self {
            schema_type,
            description: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
            items: None,
            enum_values: Vec::new(),
        }
    }

    /// Nesting depth, counting this node as 1.
    pub fn depth(&self) -> usize {
        let children = self
            .properties
            .values()
            .map(Schema::depth)
            .chain(self.items.iter().map(|items| items.depth()))
            .max()
            .unwrap_or(0);
        children + 1
    }
}

/// One callable function as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Schema>,
}

impl FunctionDeclaration {
    pub fn from_tool(tool: &McpTool) -> Self {
        let parameters = translate_schema(&tool.input_schema);
        let parameters = match parameters.schema_type {
            SchemaType::Object if parameters.properties.is_empty() => None,
            SchemaType::Object => Some(parameters),
            // Only object roots can describe named parameters.
            _ => None,
        };
        Self {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            parameters,
        }
    }
}

fn schema_type_of(node: &serde_json::Map<String, Value>) -> Option<SchemaType> {
    let declared = match node.get("type") {
        Some(Value::String(name)) => Some(name.as_str()),
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .find(|name| *name != "null"),
        _ => None,
    };

    match declared {
        Some("object") => Some(SchemaType::Object),
        Some("array") => Some(SchemaType::Array),
        Some("string") => Some(SchemaType::String),
        Some("number") | Some("integer") => Some(SchemaType::Number),
        Some("boolean") => Some(SchemaType::Boolean),
        Some(_) => Some(SchemaType::String),
        None if node.contains_key("properties") => Some(SchemaType::Object),
        None if node.contains_key("items") => Some(SchemaType::Array),
        None => None,
    }
}

/// Translates one JSON Schema node, recursing through objects and arrays.
pub fn translate_schema(node: &Value) -> Schema {
    let Some(node) = node.as_object() else {
        return Schema::of(SchemaType::String);
    };

    let schema_type = schema_type_of(node).unwrap_or(SchemaType::String);
    let mut schema = Schema::of(schema_type);
    schema.description = node
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|description| !description.trim().is_empty());

    match schema_type {
        SchemaType::Object => {
            if let Some(properties) = node.get("properties").and_then(Value::as_object) {
                schema.properties = properties
                    .iter()
                    .map(|(name, property)| (name.clone(), translate_schema(property)))
                    .collect();
            }
            if let Some(required) = node.get("required").and_then(Value::as_array) {
                schema.required = required
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|name| schema.properties.contains_key(*name))
                    .map(str::to_string)
                    .collect();
            }
        }
        SchemaType::Array => {
            let items = node
                .get("items")
                .map(translate_schema)
                .unwrap_or_else(|| Schema::of(SchemaType::String));
            schema.items = Some(Box::new(items));
        }
        SchemaType::String => {
            if let Some(values) = node.get("enum").and_then(Value::as_array) {
                schema.enum_values = values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
        }
        SchemaType::Number | SchemaType::Boolean => {}
    }

    schema
}
