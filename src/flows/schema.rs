//! Type descriptors attached to node inputs and outputs, and the structural
//! compatibility check run across every typed edge.
//!
//! A descriptor without a `type` is untyped and compatible with anything in
//! either direction, so partially typed flows still compile while they are
//! being built.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Boolean,
    Null,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
            SchemaType::Null => "null",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonSchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, JsonSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<JsonSchema>>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl JsonSchema {
    pub fn of(schema_type: SchemaType) -> Self {
        Self {
            schema_type: Some(schema_type),
            ..Default::default()
        }
    }

    pub fn object<I, K>(properties: I, required: &[&str]) -> Self
    where
        I: IntoIterator<Item = (K, JsonSchema)>,
        K: Into<String>,
    {
        Self {
            schema_type: Some(SchemaType::Object),
            properties: properties.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            required: required.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn array(items: JsonSchema) -> Self {
        Self {
            schema_type: Some(SchemaType::Array),
            items: Some(Box::new(items)),
            ..Default::default()
        }
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaCheck {
    pub compatible: bool,
    pub errors: Vec<SchemaError>,
}

/// Check whether values described by `source` can flow into an input
/// described by `target`. `path` prefixes every reported field path; pass
/// `""` at the root.
pub fn check_compatibility(source: &JsonSchema, target: &JsonSchema, path: &str) -> SchemaCheck {
    let mut errors = Vec::new();
    check_into(source, target, path, &mut errors);
    SchemaCheck {
        compatible: errors.is_empty(),
        errors,
    }
}

fn check_into(source: &JsonSchema, target: &JsonSchema, path: &str, errors: &mut Vec<SchemaError>) {
    let (Some(source_type), Some(target_type)) = (source.schema_type, target.schema_type) else {
        return;
    };

    if source_type != target_type {
        errors.push(SchemaError {
            path: path.to_string(),
            message: format!("type mismatch: expected {target_type}, got {source_type}"),
        });
        return;
    }

    match source_type {
        SchemaType::Object => {
            for field in &target.required {
                if !source.properties.contains_key(field) {
                    errors.push(SchemaError {
                        path: format!("{path}.{field}"),
                        message: format!("missing required field '{field}'"),
                    });
                }
            }
            for (name, target_prop) in &target.properties {
                if let Some(source_prop) = source.properties.get(name) {
                    check_into(source_prop, target_prop, &format!("{path}.{name}"), errors);
                }
            }
        }
        SchemaType::Array => {
            if let (Some(source_items), Some(target_items)) = (&source.items, &target.items) {
                check_into(source_items, target_items, &format!("{path}[]"), errors);
            }
        }
        _ => {}
    }

    if let (Some(source_enum), Some(target_enum)) = (&source.enum_values, &target.enum_values) {
        for value in source_enum {
            if !target_enum.contains(value) {
                errors.push(SchemaError {
                    path: path.to_string(),
                    message: format!("enum value {value} is not accepted by the target"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn string() -> JsonSchema {
        JsonSchema::of(SchemaType::String)
    }

    #[test]
    fn missing_required_field_reports_its_path() {
        let source = JsonSchema::object([("y", string())], &[]);
        let target = JsonSchema::object([("x", string())], &["x"]);

        let result = check_compatibility(&source, &target, "");
        assert!(!result.compatible);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, ".x");
    }

    #[test]
    fn type_mismatch_stops_recursion() {
        let source = JsonSchema::of(SchemaType::Number);
        let target = JsonSchema::object([("x", string())], &["x"]);

        let result = check_compatibility(&source, &target, "");
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("expected object, got number"));
    }

    #[test]
    fn optional_fields_present_on_both_sides_are_checked() {
        let source = JsonSchema::object([("count", string())], &[]);
        let target = JsonSchema::object([("count", JsonSchema::of(SchemaType::Number))], &[]);

        let result = check_compatibility(&source, &target, "");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, ".count");
    }

    #[test]
    fn nested_array_items_use_bracket_path() {
        let source = JsonSchema::object(
            [("tags", JsonSchema::array(JsonSchema::of(SchemaType::Number)))],
            &["tags"],
        );
        let target = JsonSchema::object([("tags", JsonSchema::array(string()))], &["tags"]);

        let result = check_compatibility(&source, &target, "");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, ".tags[]");
    }

    #[test]
    fn enum_values_must_be_a_subset() {
        let source = string().with_enum(vec![json!("red"), json!("blue")]);
        let target = string().with_enum(vec![json!("red"), json!("green")]);

        let result = check_compatibility(&source, &target, "");
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("\"blue\""));

        let open_target = string();
        assert!(check_compatibility(&source, &open_target, "").compatible);
    }

    #[test]
    fn untyped_descriptor_is_compatible_both_ways() {
        let any = JsonSchema::default();
        let typed = JsonSchema::object([("x", string())], &["x"]);
        assert!(check_compatibility(&any, &typed, "").compatible);
        assert!(check_compatibility(&typed, &any, "").compatible);
    }

    #[test]
    fn parses_json_schema_document() {
        let schema: JsonSchema = serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["fast", "slow"], "default": "fast"},
                "items": {"type": "array", "items": {"type": "number"}}
            },
            "required": ["mode"],
            "description": "run options"
        }))
        .unwrap();

        assert_eq!(schema.schema_type, Some(SchemaType::Object));
        assert_eq!(schema.required, vec!["mode"]);
        assert_eq!(schema.properties["mode"].enum_values.as_ref().unwrap().len(), 2);
        assert_eq!(
            schema.properties["items"].items.as_ref().unwrap().schema_type,
            Some(SchemaType::Number)
        );
    }
}
