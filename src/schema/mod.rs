//! Canonical, provider-independent description of a structured output or
//! tool-argument shape.
//!
//! Schemas are built once per declared type and never mutated afterwards.
//! Provider-specific JSON is produced by the functions in [`dialect`].

pub mod dialect;

use serde_json::Value;

use crate::error::SchemaError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    Object,
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Enum,
}

impl SchemaKind {
    /// JSON Schema `type` keyword for this kind. Enumerations are string-typed.
    pub fn json_type(self) -> &'static str {
        match self {
            SchemaKind::Object => "object",
            SchemaKind::String | SchemaKind::Enum => "string",
            SchemaKind::Integer => "integer",
            SchemaKind::Number => "number",
            SchemaKind::Boolean => "boolean",
            SchemaKind::Array => "array",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Constraints {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub exclusive_minimum: Option<f64>,
    pub exclusive_maximum: Option<f64>,
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub pattern: Option<String>,
    pub min_items: Option<u64>,
    pub max_items: Option<u64>,
    pub format: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumCase {
    pub value: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub name: String,
    /// Field-level documentation, distinct from the documentation of the
    /// field's type.
    pub description: Option<String>,
    pub schema: Schema,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    kind: SchemaKind,
    description: Option<String>,
    nullable: bool,
    properties: Vec<Property>,
    required: Vec<String>,
    items: Option<Box<Schema>>,
    enum_cases: Vec<EnumCase>,
    constraints: Constraints,
}

impl Schema {
    fn leaf(kind: SchemaKind) -> Self {
        Self {
            kind,
            description: None,
            nullable: false,
            properties: Vec::new(),
            required: Vec::new(),
            items: None,
            enum_cases: Vec::new(),
            constraints: Constraints::default(),
        }
    }

    pub fn string() -> Self {
        Self::leaf(SchemaKind::String)
    }

    pub fn integer() -> Self {
        Self::leaf(SchemaKind::Integer)
    }

    pub fn number() -> Self {
        Self::leaf(SchemaKind::Number)
    }

    pub fn boolean() -> Self {
        Self::leaf(SchemaKind::Boolean)
    }

    pub fn array(items: Schema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::leaf(SchemaKind::Array)
        }
    }

    pub fn object() -> ObjectBuilder {
        ObjectBuilder::default()
    }

    pub fn enumeration<I, S>(values: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let enum_cases = values
            .into_iter()
            .map(|value| EnumCase {
                value: value.into(),
                description: None,
            })
            .collect::<Vec<_>>();

        if enum_cases.is_empty() {
            return Err(SchemaError::EmptyEnum);
        }

        Ok(Self {
            enum_cases,
            ..Self::leaf(SchemaKind::Enum)
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attaches documentation to one enumeration case. Unknown values are
    /// ignored.
    pub fn case_description(mut self, value: &str, description: impl Into<String>) -> Self {
        if let Some(case) = self.enum_cases.iter_mut().find(|case| case.value == value) {
            case.description = Some(description.into());
        }
        self
    }

    pub fn minimum(mut self, value: f64) -> Self {
        self.constraints.minimum = Some(value);
        self
    }

    pub fn maximum(mut self, value: f64) -> Self {
        self.constraints.maximum = Some(value);
        self
    }

    pub fn exclusive_minimum(mut self, value: f64) -> Self {
        self.constraints.exclusive_minimum = Some(value);
        self
    }

    pub fn exclusive_maximum(mut self, value: f64) -> Self {
        self.constraints.exclusive_maximum = Some(value);
        self
    }

    pub fn min_length(mut self, value: u64) -> Self {
        self.constraints.min_length = Some(value);
        self
    }

    pub fn max_length(mut self, value: u64) -> Self {
        self.constraints.max_length = Some(value);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.constraints.pattern = Some(pattern.into());
        self
    }

    pub fn min_items(mut self, value: u64) -> Self {
        self.constraints.min_items = Some(value);
        self
    }

    pub fn max_items(mut self, value: u64) -> Self {
        self.constraints.max_items = Some(value);
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.constraints.format = Some(format.into());
        self
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// True for the schema of an optional object field.
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|required| required == name)
    }

    pub fn items(&self) -> Option<&Schema> {
        self.items.as_deref()
    }

    pub fn enum_cases(&self) -> &[EnumCase] {
        &self.enum_cases
    }

    pub fn enum_values(&self) -> Vec<&str> {
        self.enum_cases
            .iter()
            .map(|case| case.value.as_str())
            .collect()
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Plain JSON Schema rendering: optional fields are omitted from
    /// `required`, no provider-specific rewriting.
    pub fn to_json(&self) -> Value {
        dialect::canonical(self)
    }
}

/// Builds an object schema, recording property insertion order.
#[derive(Debug, Default)]
pub struct ObjectBuilder {
    description: Option<String>,
    properties: Vec<Property>,
    required: Vec<String>,
    error: Option<SchemaError>,
}

impl ObjectBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn property(self, name: impl Into<String>, schema: Schema) -> Self {
        self.push(name.into(), None, schema, false)
    }

    pub fn property_with_description(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Schema,
    ) -> Self {
        self.push(name.into(), Some(description.into()), schema, false)
    }

    pub fn optional_property(self, name: impl Into<String>, schema: Schema) -> Self {
        self.push(name.into(), None, schema, true)
    }

    pub fn optional_property_with_description(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Schema,
    ) -> Self {
        self.push(name.into(), Some(description.into()), schema, true)
    }

    fn push(
        mut self,
        name: String,
        description: Option<String>,
        mut schema: Schema,
        optional: bool,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        if name.is_empty() {
            self.error = Some(SchemaError::EmptyPropertyName);
            return self;
        }
        if self.properties.iter().any(|property| property.name == name) {
            self.error = Some(SchemaError::DuplicateProperty(name));
            return self;
        }

        schema.nullable = optional;
        if !optional {
            self.required.push(name.clone());
        }
        self.properties.push(Property {
            name,
            description,
            schema,
        });
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        Ok(Schema {
            description: self.description,
            properties: self.properties,
            required: self.required,
            ..Schema::leaf(SchemaKind::Object)
        })
    }
}

/// A type with a canonical schema. Implemented by hand or by an external
/// code-generation step.
pub trait SchemaType {
    fn schema() -> Schema;
}

impl SchemaType for String {
    fn schema() -> Schema {
        Schema::string()
    }
}

impl SchemaType for bool {
    fn schema() -> Schema {
        Schema::boolean()
    }
}

macro_rules! integer_schema_type {
    ($($ty:ty),*) => {
        $(impl SchemaType for $ty {
            fn schema() -> Schema {
                Schema::integer()
            }
        })*
    };
}

integer_schema_type!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl SchemaType for f32 {
    fn schema() -> Schema {
        Schema::number()
    }
}

impl SchemaType for f64 {
    fn schema() -> Schema {
        Schema::number()
    }
}

impl<T: SchemaType> SchemaType for Vec<T> {
    fn schema() -> Schema {
        Schema::array(T::schema())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn object_builder_tracks_required_and_order() {
        let schema = Schema::object()
            .property("name", Schema::string())
            .optional_property("nickname", Schema::string())
            .property("age", Schema::integer().minimum(0.0))
            .build()
            .expect("schema builds");

        let names = schema
            .properties()
            .iter()
            .map(|property| property.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["name", "nickname", "age"]);
        assert_eq!(schema.required(), ["name".to_string(), "age".to_string()]);
        assert!(schema.properties()[1].schema.is_nullable());
        assert!(!schema.properties()[0].schema.is_nullable());
    }

    #[test]
    fn object_builder_rejects_duplicates() {
        let err = Schema::object()
            .property("a", Schema::string())
            .property("a", Schema::integer())
            .build()
            .expect_err("duplicate must fail");
        assert_eq!(err, SchemaError::DuplicateProperty("a".to_string()));
    }

    #[test]
    fn enumeration_requires_cases() {
        let err = Schema::enumeration(Vec::<String>::new()).expect_err("empty enum");
        assert_eq!(err, SchemaError::EmptyEnum);

        let schema = Schema::enumeration(["low", "high"])
            .expect("enum builds")
            .case_description("low", "below threshold");
        assert_eq!(schema.kind(), SchemaKind::Enum);
        assert_eq!(schema.enum_values(), vec!["low", "high"]);
        assert!(schema.properties().is_empty());
        assert_eq!(
            schema.enum_cases()[0].description.as_deref(),
            Some("below threshold")
        );
    }

    #[test]
    fn to_json_renders_plain_json_schema() {
        let schema = Schema::object()
            .description("A person")
            .property("tags", Vec::<String>::schema().max_items(3))
            .optional_property("score", f64::schema())
            .build()
            .expect("schema builds");

        assert_eq!(
            schema.to_json(),
            json!({
                "type": "object",
                "description": "A person",
                "properties": {
                    "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 3},
                    "score": {"type": "number"}
                },
                "required": ["tags"]
            })
        );
    }
}
