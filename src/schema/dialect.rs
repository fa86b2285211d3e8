//! Canonical schema -> provider JSON.
//!
//! The three providers disagree on nullability, closed objects and which
//! keywords they accept. Adapters never fail: a keyword a provider cannot
//! take is dropped and restated in the description so the model still sees
//! it. Rejection is left to the provider.

use serde_json::{Map, Value, json};

use super::{Schema, SchemaKind};

/// String formats Gemini accepts on `type: string`.
const GEMINI_STRING_FORMATS: &[&str] = &["enum", "date-time"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dialect {
    Canonical,
    OpenAi,
    Gemini,
}

/// Plain JSON Schema, see [`Schema::to_json`].
pub fn canonical(schema: &Schema) -> Value {
    render(schema, Dialect::Canonical, None)
}

/// Anthropic takes standard JSON Schema: optional fields are left out of
/// `required`.
pub fn anthropic(schema: &Schema) -> Value {
    render(schema, Dialect::Canonical, None)
}

/// OpenAI strict mode: every key is required, optional fields widen their
/// type with `"null"`, and every object is closed with
/// `additionalProperties: false`.
pub fn openai(schema: &Schema) -> Value {
    render(schema, Dialect::OpenAi, None)
}

/// Gemini: optional fields are omitted from `required`, unsupported keywords
/// are stripped, and nested enum documentation is folded into the field
/// description.
pub fn gemini(schema: &Schema) -> Value {
    render(schema, Dialect::Gemini, None)
}

fn render(schema: &Schema, dialect: Dialect, field_description: Option<&str>) -> Value {
    let mut out = Map::new();
    let mut notes = Vec::new();
    let type_name = schema.kind().json_type();

    if dialect == Dialect::OpenAi && schema.is_nullable() {
        out.insert("type".to_string(), json!([type_name, "null"]));
    } else {
        out.insert("type".to_string(), json!(type_name));
    }

    match schema.kind() {
        SchemaKind::Object => render_object(schema, dialect, &mut out),
        SchemaKind::Array => {
            if let Some(items) = schema.items() {
                out.insert("items".to_string(), render(items, dialect, None));
            }
            let constraints = schema.constraints();
            insert_u64(&mut out, "minItems", constraints.min_items);
            insert_u64(&mut out, "maxItems", constraints.max_items);
        }
        SchemaKind::Enum => {
            let mut values = schema
                .enum_values()
                .into_iter()
                .map(Value::from)
                .collect::<Vec<_>>();
            if dialect == Dialect::OpenAi && schema.is_nullable() {
                values.push(Value::Null);
            }
            out.insert("enum".to_string(), Value::Array(values));
        }
        SchemaKind::String => render_string(schema, dialect, &mut out, &mut notes),
        SchemaKind::Integer | SchemaKind::Number => {
            render_numeric(schema, dialect, &mut out, &mut notes)
        }
        SchemaKind::Boolean => {}
    }

    if let Some(description) = compose_description(schema, field_description, &notes) {
        out.insert("description".to_string(), Value::String(description));
    }

    Value::Object(out)
}

fn render_object(schema: &Schema, dialect: Dialect, out: &mut Map<String, Value>) {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for property in schema.properties() {
        properties.insert(
            property.name.clone(),
            render(&property.schema, dialect, property.description.as_deref()),
        );
        if dialect == Dialect::OpenAi || schema.is_required(&property.name) {
            required.push(Value::String(property.name.clone()));
        }
    }

    // Gemini rejects object schemas without properties.
    if dialect == Dialect::Gemini && properties.is_empty() {
        properties.insert("_placeholder".to_string(), json!({"type": "string"}));
    }

    let ordering = properties
        .keys()
        .cloned()
        .map(Value::String)
        .collect::<Vec<_>>();

    out.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() || dialect == Dialect::OpenAi {
        out.insert("required".to_string(), Value::Array(required));
    }

    match dialect {
        Dialect::OpenAi => {
            out.insert("additionalProperties".to_string(), Value::Bool(false));
        }
        Dialect::Gemini => {
            out.insert("propertyOrdering".to_string(), Value::Array(ordering));
        }
        Dialect::Canonical => {}
    }
}

fn render_string(
    schema: &Schema,
    dialect: Dialect,
    out: &mut Map<String, Value>,
    notes: &mut Vec<String>,
) {
    let constraints = schema.constraints();

    if dialect == Dialect::OpenAi {
        if let Some(min) = constraints.min_length {
            notes.push(format!("minimum length {min}"));
        }
        if let Some(max) = constraints.max_length {
            notes.push(format!("maximum length {max}"));
        }
    } else {
        insert_u64(out, "minLength", constraints.min_length);
        insert_u64(out, "maxLength", constraints.max_length);
    }

    if let Some(pattern) = &constraints.pattern {
        out.insert("pattern".to_string(), Value::String(pattern.clone()));
    }

    if let Some(format) = &constraints.format {
        if dialect == Dialect::Gemini && !GEMINI_STRING_FORMATS.contains(&format.as_str()) {
            notes.push(format!("format {format}"));
        } else {
            out.insert("format".to_string(), Value::String(format.clone()));
        }
    }
}

fn render_numeric(
    schema: &Schema,
    dialect: Dialect,
    out: &mut Map<String, Value>,
    notes: &mut Vec<String>,
) {
    let constraints = schema.constraints();
    insert_f64(out, "minimum", constraints.minimum);
    insert_f64(out, "maximum", constraints.maximum);

    if dialect == Dialect::Gemini {
        if let Some(bound) = constraints.exclusive_minimum {
            notes.push(format!("must be greater than {bound}"));
        }
        if let Some(bound) = constraints.exclusive_maximum {
            notes.push(format!("must be less than {bound}"));
        }
    } else {
        insert_f64(out, "exclusiveMinimum", constraints.exclusive_minimum);
        insert_f64(out, "exclusiveMaximum", constraints.exclusive_maximum);
    }
}

fn compose_description(
    schema: &Schema,
    field_description: Option<&str>,
    notes: &[String],
) -> Option<String> {
    let mut parts = Vec::new();

    // Enums keep their own description next to the field's; Gemini would
    // otherwise drop it entirely.
    if schema.kind() == SchemaKind::Enum {
        parts.extend(field_description.map(str::to_string));
        parts.extend(
            schema
                .description()
                .filter(|own| Some(*own) != field_description)
                .map(str::to_string),
        );
    } else if let Some(description) = field_description.or(schema.description()) {
        parts.push(description.to_string());
    }

    if schema.kind() == SchemaKind::Enum {
        let cases = schema
            .enum_cases()
            .iter()
            .filter_map(|case| {
                case.description
                    .as_ref()
                    .map(|description| format!("- {}: {description}", case.value))
            })
            .collect::<Vec<_>>();
        if !cases.is_empty() {
            parts.push(format!("Options:\n{}", cases.join("\n")));
        }
    }

    if !notes.is_empty() {
        parts.push(format!("Constraints: {}.", notes.join(", ")));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn insert_u64(out: &mut Map<String, Value>, key: &str, value: Option<u64>) {
    if let Some(value) = value {
        out.insert(key.to_string(), Value::from(value));
    }
}

fn insert_f64(out: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(number) = value.and_then(serde_json::Number::from_f64) {
        out.insert(key.to_string(), Value::Number(number));
    }
}
