//! Translation of generic JSON schemas into Gemini's restricted dialect.
//!
//! Gemini's `responseSchema` accepts a narrow OpenAPI-flavored subset: each
//! type admits a fixed field set and `additionalProperties` is rejected
//! outright. The translator keeps only what the target type supports and
//! drops everything else.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Schema shape accepted by Gemini's `generationConfig.responseSchema`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GeminiSchema {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(rename = "minItems", skip_serializing_if = "Option::is_none")]
    pub min_items: Option<u64>,
    #[serde(rename = "maxItems", skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<GeminiSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, GeminiSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(rename = "propertyOrdering", skip_serializing_if = "Option::is_none")]
    pub property_ordering: Option<Vec<String>>,
}

/// Convert a generic JSON schema value into the Gemini dialect.
///
/// An absent `type` defaults to `object`; an unrecognized `type` defaults to
/// `string`. Fields not permitted for the resulting type are dropped, which
/// also discards `additionalProperties`.
pub fn to_gemini_schema(schema: &Value) -> GeminiSchema {
    let kind = match schema.get("type").and_then(Value::as_str) {
        None => "object",
        Some(t @ ("string" | "integer" | "number" | "boolean" | "array" | "object")) => t,
        Some(_) => "string",
    };

    let mut out = GeminiSchema {
        kind: kind.to_string(),
        nullable: detect_nullable(schema),
        ..Default::default()
    };

    match kind {
        "string" => {
            out.enum_values = stringified_enum(schema);
            out.format = string_field(schema, "format");
            out.description = string_field(schema, "description");
        }
        "integer" | "number" => {
            out.format = string_field(schema, "format");
            out.minimum = number_field(schema, "minimum");
            out.maximum = number_field(schema, "maximum");
            out.enum_values = stringified_enum(schema);
        }
        "boolean" => {}
        "array" => {
            out.min_items = unsigned_field(schema, "minItems");
            out.max_items = unsigned_field(schema, "maxItems");
            out.items = schema
                .get("items")
                .filter(|items| items.is_object())
                .map(|items| Box::new(to_gemini_schema(items)));
        }
        "object" => {
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                let mapped = properties
                    .iter()
                    .map(|(name, prop)| (name.clone(), to_gemini_schema(prop)))
                    .collect::<BTreeMap<_, _>>();
                if !mapped.is_empty() {
                    out.properties = Some(mapped);
                }
            }
            out.required = string_list_field(schema, "required");
            out.property_ordering = string_list_field(schema, "propertyOrdering");
        }
        _ => {}
    }

    out
}

fn detect_nullable(schema: &Value) -> Option<bool> {
    if schema.get("nullable").and_then(Value::as_bool) == Some(true) {
        return Some(true);
    }
    for key in ["anyOf", "oneOf"] {
        let has_null_branch = schema
            .get(key)
            .and_then(Value::as_array)
            .is_some_and(|branches| {
                branches
                    .iter()
                    .any(|branch| branch.get("type").and_then(Value::as_str) == Some("null"))
            });
        if has_null_branch {
            return Some(true);
        }
    }
    None
}

fn stringified_enum(schema: &Value) -> Option<Vec<String>> {
    let values = schema.get("enum").and_then(Value::as_array)?;
    let out = values
        .iter()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>();
    (!out.is_empty()).then_some(out)
}

fn string_field(schema: &Value, field: &str) -> Option<String> {
    schema
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn number_field(schema: &Value, field: &str) -> Option<f64> {
    schema.get(field).and_then(Value::as_f64)
}

fn unsigned_field(schema: &Value, field: &str) -> Option<u64> {
    let value = schema.get(field)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f.max(0.0) as u64))
}

fn string_list_field(schema: &Value, field: &str) -> Option<Vec<String>> {
    let values = schema.get(field).and_then(Value::as_array)?;
    let out = values
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect::<Vec<_>>();
    (!out.is_empty()).then_some(out)
}
