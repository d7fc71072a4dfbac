//! Template field schemas.
//!
//! A schema is an ordered list of fields. Leaves are free text; `object` fields
//! carry their own nested field list. Every leaf is nullable because the model
//! may not find the value in the report.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashSet;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    #[serde(alias = "nested")]
    Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSpec>,
}

impl FieldSpec {
    pub fn text(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            kind: FieldKind::Text,
            description: description.into(),
            fields: Vec::new(),
        }
    }

    pub fn object(
        name: impl Into<String>,
        description: impl Into<String>,
        fields: Vec<FieldSpec>,
    ) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            kind: FieldKind::Object,
            description: description.into(),
            fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TemplateSchema {
    pub fields: Vec<FieldSpec>,
}

impl TemplateSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fields.is_empty() {
            return Err(ValidationError::InvalidTemplate(
                "template must define at least one field".to_string(),
            ));
        }
        validate_level(&self.fields, "")
    }

    /// JSON Schema handed to providers that support structured output.
    pub fn to_json_schema(&self) -> Value {
        object_schema(&self.fields)
    }

    /// Human-readable structure embedded in the extraction prompt.
    pub fn describe(&self) -> Value {
        describe_level(&self.fields)
    }

    /// Reshape a provider payload so it carries exactly the schema's fields.
    ///
    /// Known fields are kept, unknown ones dropped, and anything missing or of
    /// the wrong shape becomes null. Returns `None` if `value` is not an object.
    pub fn conform(&self, value: &Value) -> Option<Value> {
        let object = value.as_object()?;
        Some(conform_level(&self.fields, object))
    }

    /// An all-null document with the schema's shape.
    pub fn empty_document(&self) -> Value {
        conform_level(&self.fields, &Map::new())
    }
}

fn validate_level(fields: &[FieldSpec], path: &str) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for field in fields {
        let full_name = if path.is_empty() {
            field.name.clone()
        } else {
            format!("{}.{}", path, field.name)
        };

        if field.name.trim().is_empty() {
            return Err(ValidationError::InvalidTemplate(format!(
                "field name must not be empty (under '{}')",
                path
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(ValidationError::InvalidTemplate(format!(
                "duplicate field '{}'",
                full_name
            )));
        }

        match field.kind {
            FieldKind::Text if !field.fields.is_empty() => {
                return Err(ValidationError::InvalidTemplate(format!(
                    "text field '{}' cannot have nested fields",
                    full_name
                )));
            }
            FieldKind::Object if field.fields.is_empty() => {
                return Err(ValidationError::InvalidTemplate(format!(
                    "object field '{}' needs nested fields",
                    full_name
                )));
            }
            FieldKind::Object => validate_level(&field.fields, &full_name)?,
            FieldKind::Text => {}
        }
    }
    Ok(())
}

fn object_schema(fields: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    for field in fields {
        let property = match field.kind {
            FieldKind::Text => json!({
                "type": ["string", "null"],
                "description": field.description,
            }),
            FieldKind::Object => {
                let mut nested = object_schema(&field.fields);
                nested["type"] = json!(["object", "null"]);
                nested["description"] = json!(field.description);
                nested
            }
        };
        properties.insert(field.name.clone(), property);
    }

    let required: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn describe_level(fields: &[FieldSpec]) -> Value {
    let mut out = Map::new();
    for field in fields {
        let entry = match field.kind {
            FieldKind::Text => json!({
                "label": field.label,
                "type": "text",
                "description": field.description,
            }),
            FieldKind::Object => json!({
                "label": field.label,
                "type": "object",
                "description": field.description,
                "fields": describe_level(&field.fields),
            }),
        };
        out.insert(field.name.clone(), entry);
    }
    Value::Object(out)
}

fn conform_level(fields: &[FieldSpec], source: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for field in fields {
        let value = match (field.kind, source.get(&field.name)) {
            (FieldKind::Text, Some(Value::String(s))) => Value::String(s.clone()),
            (FieldKind::Text, Some(Value::Number(n))) => Value::String(n.to_string()),
            (FieldKind::Text, Some(Value::Bool(b))) => Value::String(b.to_string()),
            (FieldKind::Object, Some(Value::Object(nested))) => {
                conform_level(&field.fields, nested)
            }
            _ => Value::Null,
        };
        out.insert(field.name.clone(), value);
    }
    Value::Object(out)
}
