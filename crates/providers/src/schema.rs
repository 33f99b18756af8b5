//! Minimal structured-output schema.
//!
//! Covers the shapes this pipeline asks for: an object with required text
//! fields and lists of objects. It renders to JSON Schema for providers that
//! accept one, and checks returned values locally.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

/// Kind of a top-level field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Non-empty string.
    Text,
    /// List of strings.
    TextList { min_items: usize },
    /// List of objects, each with the given required fields.
    ObjectList {
        min_items: usize,
        item_fields: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn text(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind: FieldKind::Text,
        });
        self
    }

    pub fn text_list(mut self, name: impl Into<String>, min_items: usize) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind: FieldKind::TextList { min_items },
        });
        self
    }

    pub fn object_list(
        mut self,
        name: impl Into<String>,
        min_items: usize,
        item_fields: &[&str],
    ) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind: FieldKind::ObjectList {
                min_items,
                item_fields: item_fields.iter().map(|f| f.to_string()).collect(),
            },
        });
        self
    }

    /// Check a value against this schema.
    ///
    /// Returns a human-readable reason on the first violation.
    pub fn check(&self, value: &JsonValue) -> Result<(), String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("{}: expected a JSON object", self.name))?;

        for field in &self.fields {
            let v = obj
                .get(&field.name)
                .ok_or_else(|| format!("{}: missing field `{}`", self.name, field.name))?;
            match &field.kind {
                FieldKind::Text => {
                    let ok = v.as_str().is_some_and(|s| !s.trim().is_empty());
                    if !ok {
                        return Err(format!(
                            "{}: field `{}` must be a non-empty string",
                            self.name, field.name
                        ));
                    }
                }
                FieldKind::TextList { min_items } => {
                    let items = v.as_array().ok_or_else(|| {
                        format!("{}: field `{}` must be a list", self.name, field.name)
                    })?;
                    if items.len() < *min_items || !items.iter().all(JsonValue::is_string) {
                        return Err(format!(
                            "{}: field `{}` needs at least {} strings",
                            self.name, field.name, min_items
                        ));
                    }
                }
                FieldKind::ObjectList {
                    min_items,
                    item_fields,
                } => {
                    let items = v.as_array().ok_or_else(|| {
                        format!("{}: field `{}` must be a list", self.name, field.name)
                    })?;
                    if items.len() < *min_items {
                        return Err(format!(
                            "{}: field `{}` has {} items, expected at least {}",
                            self.name,
                            field.name,
                            items.len(),
                            min_items
                        ));
                    }
                    for (idx, item) in items.iter().enumerate() {
                        let item = item.as_object().ok_or_else(|| {
                            format!("{}: `{}[{idx}]` must be an object", self.name, field.name)
                        })?;
                        for required in item_fields {
                            if !item.contains_key(required) {
                                return Err(format!(
                                    "{}: `{}[{idx}]` is missing `{required}`",
                                    self.name, field.name
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Render as a JSON Schema object (for tool/function-call parameters).
    pub fn to_json_schema(&self) -> JsonValue {
        let mut properties = Map::new();
        for field in &self.fields {
            let prop = match &field.kind {
                FieldKind::Text => json!({ "type": "string" }),
                FieldKind::TextList { min_items } => json!({
                    "type": "array",
                    "minItems": min_items,
                    "items": { "type": "string" },
                }),
                FieldKind::ObjectList {
                    min_items,
                    item_fields,
                } => {
                    let item_props: Map<String, JsonValue> = item_fields
                        .iter()
                        .map(|f| {
                            let ty = if f == "position" { "integer" } else { "string" };
                            (f.clone(), json!({ "type": ty }))
                        })
                        .collect();
                    json!({
                        "type": "array",
                        "minItems": min_items,
                        "items": {
                            "type": "object",
                            "properties": item_props,
                            "required": item_fields,
                        },
                    })
                }
            };
            properties.insert(field.name.clone(), prop);
        }
        let required: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beats_schema() -> OutputSchema {
        OutputSchema::new("beats").object_list("beats", 2, &["position", "title", "description"])
    }

    #[test]
    fn accepts_conforming_value() {
        let v = json!({
            "beats": [
                {"position": 1, "title": "a", "description": "b"},
                {"position": 2, "title": "c", "description": "d"},
            ]
        });
        assert!(beats_schema().check(&v).is_ok());
    }

    #[test]
    fn reports_missing_item_field() {
        let v = json!({
            "beats": [
                {"position": 1, "title": "a", "description": "b"},
                {"position": 2, "title": "c"},
            ]
        });
        let err = beats_schema().check(&v).unwrap_err();
        assert!(err.contains("beats[1]"), "{err}");
        assert!(err.contains("description"), "{err}");
    }

    #[test]
    fn blank_text_field_is_rejected() {
        let schema = OutputSchema::new("summary").text("logline");
        assert!(schema.check(&json!({"logline": "   "})).is_err());
        assert!(schema.check(&json!({"logline": 3})).is_err());
    }

    #[test]
    fn json_schema_lists_every_field_as_required() {
        let schema = OutputSchema::new("summary")
            .text("logline")
            .text_list("themes", 1);
        let rendered = schema.to_json_schema();
        assert_eq!(rendered["required"], json!(["logline", "themes"]));
        assert_eq!(rendered["properties"]["themes"]["minItems"], json!(1));
    }
}
