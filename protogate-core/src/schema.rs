//! # Transcoding Schema
//!
//! The human-authored half of a route binding. A schema file maps the JSON field names that
//! HTTP callers use onto Protobuf field numbers and types, for the request and the response
//! message of one method:
//!
//! ```json
//! {
//!   "request": {
//!     "type": "hello.HelloRequest",
//!     "fields": {
//!       "firstName": { "number": 1, "type": "string" },
//!       "lastName": { "number": 2, "type": "string" }
//!     }
//!   },
//!   "response": {
//!     "fields": { "greeting": { "number": 1, "type": "string" } }
//!   }
//! }
//! ```
//!
//! The schema on its own says nothing about the wire; it is only meaningful once it has been
//! validated against a descriptor by [`crate::binding`].
use prost_reflect::{FieldDescriptor, Kind};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// JSON field name to field mapping.
///
/// A `BTreeMap` keeps iteration (and therefore error reporting) deterministic.
pub type FieldMap = BTreeMap<String, FieldSchema>;

/// A parsed schema file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TranscodingSchema {
    /// Mapping applied to the JSON request body before it is encoded.
    pub request: MessageSchema,
    /// Mapping applied to the decoded upstream response.
    pub response: MessageSchema,
}

impl TranscodingSchema {
    /// Parses a schema document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The mapping for one message type.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MessageSchema {
    /// Fully qualified message name (e.g. `hello.HelloRequest`).
    ///
    /// Optional when the descriptor set declares the bound method, in which case the method's
    /// input/output types are used.
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,
    pub fields: FieldMap,
}

/// The mapping for one field.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FieldSchema {
    /// Protobuf field number.
    pub number: u32,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub repeated: bool,
    /// Mapping for the fields of a nested message. When absent, the nested message is
    /// transcoded with the descriptor's own JSON names.
    #[serde(default)]
    pub fields: Option<FieldMap>,
}

/// The type of a field as written in a schema file.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
    Enum,
    Message,
    Map,
}

impl FieldType {
    /// The schema type that describes a descriptor field.
    ///
    /// Map fields are reported as [`FieldType::Map`] even though they are encoded as repeated
    /// entry messages on the wire.
    pub fn of(field: &FieldDescriptor) -> Self {
        if field.is_map() {
            return FieldType::Map;
        }

        match field.kind() {
            Kind::Double => FieldType::Double,
            Kind::Float => FieldType::Float,
            Kind::Int32 => FieldType::Int32,
            Kind::Int64 => FieldType::Int64,
            Kind::Uint32 => FieldType::Uint32,
            Kind::Uint64 => FieldType::Uint64,
            Kind::Sint32 => FieldType::Sint32,
            Kind::Sint64 => FieldType::Sint64,
            Kind::Fixed32 => FieldType::Fixed32,
            Kind::Fixed64 => FieldType::Fixed64,
            Kind::Sfixed32 => FieldType::Sfixed32,
            Kind::Sfixed64 => FieldType::Sfixed64,
            Kind::Bool => FieldType::Bool,
            Kind::String => FieldType::String,
            Kind::Bytes => FieldType::Bytes,
            Kind::Enum(_) => FieldType::Enum,
            Kind::Message(_) => FieldType::Message,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Double => "double",
            FieldType::Float => "float",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Uint32 => "uint32",
            FieldType::Uint64 => "uint64",
            FieldType::Sint32 => "sint32",
            FieldType::Sint64 => "sint64",
            FieldType::Fixed32 => "fixed32",
            FieldType::Fixed64 => "fixed64",
            FieldType::Sfixed32 => "sfixed32",
            FieldType::Sfixed64 => "sfixed64",
            FieldType::Bool => "bool",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Enum => "enum",
            FieldType::Message => "message",
            FieldType::Map => "map",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_schema_with_defaults() {
        let schema = TranscodingSchema::from_slice(
            br#"{
                "request": {
                    "type": "hello.Introduction",
                    "fields": {
                        "who": { "number": 1, "type": "message", "fields": {
                            "given": { "number": 1, "type": "string" }
                        } },
                        "tags": { "number": 2, "type": "string", "repeated": true }
                    }
                },
                "response": { "fields": {} }
            }"#,
        )
        .unwrap();

        assert_eq!(
            schema.request.type_name.as_deref(),
            Some("hello.Introduction")
        );
        assert!(schema.response.type_name.is_none());

        let who = &schema.request.fields["who"];
        assert_eq!(who.kind, FieldType::Message);
        assert!(!who.repeated);
        assert_eq!(who.fields.as_ref().unwrap()["given"].number, 1);
        assert!(schema.request.fields["tags"].repeated);
    }

    #[test]
    fn rejects_unknown_keys_and_types() {
        let unknown_key = TranscodingSchema::from_slice(
            br#"{ "request": { "fields": {}, "extra": 1 }, "response": { "fields": {} } }"#,
        );
        assert!(unknown_key.is_err());

        let unknown_type = TranscodingSchema::from_slice(
            br#"{ "request": { "fields": { "a": { "number": 1, "type": "text" } } },
                  "response": { "fields": {} } }"#,
        );
        assert!(unknown_type.is_err());
    }
}
