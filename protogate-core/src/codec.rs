//! # JSON <-> Protobuf Codec
//!
//! A [`MessageCodec`] is built once per message type when a route is bound. It pairs a
//! `MessageDescriptor` with the validated schema mapping and converts in both directions
//! without any generated Rust structs.
//!
//! ## How it works
//!
//! 1. **Encode (JSON -> Proto)**:
//!    - Projects the JSON object onto the schema: mapped keys are renamed to the descriptor's
//!      JSON names, everything else is dropped.
//!    - Uses `prost_reflect::DynamicMessage` to validate the projected value against the
//!      `MessageDescriptor` and serializes it to canonical Protobuf bytes.
//!
//! 2. **Decode (Proto -> JSON)**:
//!    - Decodes raw bytes into a `DynamicMessage` and converts it to a `serde_json::Value`
//!      using the canonical Protobuf JSON mapping.
//!    - Projects the value back onto the schema's JSON names, dropping unmapped fields.
use crate::binding::DescriptorError;
use crate::schema::{FieldMap, FieldType};
use bytes::Bytes;
use prost::Message;
use prost_reflect::{DeserializeOptions, DynamicMessage, FieldDescriptor, Kind, MessageDescriptor};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Expected a JSON object for message '{message}', got {found}")]
    NotAnObject {
        message: String,
        found: &'static str,
    },
    #[error("Field '{field}' expects {expected}, got {found}")]
    UnexpectedShape {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("JSON structure does not match Protobuf schema: {0}")]
    Incompatible(#[source] serde_json::Error),
    #[error("Failed to decode Protobuf bytes: {0}")]
    Malformed(#[source] prost::DecodeError),
    #[error("Failed to map Protobuf message to JSON: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Descriptor-bound converter between JSON values and the binary encoding of one message type.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    descriptor: MessageDescriptor,
    fields: Vec<FieldBinding>,
}

/// One schema entry resolved against its descriptor field.
#[derive(Debug, Clone)]
struct FieldBinding {
    json_name: String,
    field: FieldDescriptor,
    /// Explicit mapping for the fields of a nested message.
    nested: Option<Vec<FieldBinding>>,
}

impl MessageCodec {
    /// Validates `fields` against `descriptor` and builds the codec.
    ///
    /// Every mapped field must exist in the descriptor with the declared type and cardinality;
    /// any disagreement is reported as [`DescriptorError::SchemaMismatch`].
    pub fn resolve(descriptor: MessageDescriptor, fields: &FieldMap) -> Result<Self, DescriptorError> {
        let fields = resolve_fields(&descriptor, fields)?;
        Ok(Self { descriptor, fields })
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    /// Encodes a JSON object into the binary form of the bound message.
    ///
    /// Keys absent from the schema are dropped. `null` values are treated as absent.
    pub fn encode(&self, json: Value) -> Result<Bytes, CodecError> {
        let object = match json {
            Value::Object(object) => object,
            other => {
                return Err(CodecError::NotAnObject {
                    message: self.descriptor.full_name().to_string(),
                    found: json_kind(&other),
                });
            }
        };

        let projected = project_request(&self.fields, object)?;

        // Nested messages without an explicit mapping are handed over as-is, so tolerate
        // keys the descriptor doesn't know about.
        let options = DeserializeOptions::new().deny_unknown_fields(false);
        let message =
            DynamicMessage::deserialize_with_options(self.descriptor.clone(), Value::Object(projected), &options)
                .map_err(CodecError::Incompatible)?;

        Ok(Bytes::from(message.encode_to_vec()))
    }

    /// Decodes the binary form of the bound message into a JSON object keyed by schema names.
    ///
    /// Fields absent from the schema, and fields holding their default value, are omitted.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let message =
            DynamicMessage::decode(self.descriptor.clone(), bytes).map_err(CodecError::Malformed)?;

        match serde_json::to_value(&message).map_err(CodecError::Serialize)? {
            Value::Object(object) => Ok(Value::Object(project_response(&self.fields, object))),
            other => Err(CodecError::NotAnObject {
                message: self.descriptor.full_name().to_string(),
                found: json_kind(&other),
            }),
        }
    }
}

fn resolve_fields(
    message: &MessageDescriptor,
    fields: &FieldMap,
) -> Result<Vec<FieldBinding>, DescriptorError> {
    let mut claimed: HashMap<u32, &str> = HashMap::new();
    let mut bindings = Vec::with_capacity(fields.len());

    for (json_name, schema) in fields {
        let mismatch = |reason: String| DescriptorError::SchemaMismatch {
            message: message.full_name().to_string(),
            field: json_name.clone(),
            reason,
        };

        let field = message
            .get_field(schema.number)
            .ok_or_else(|| mismatch(format!("field number {} does not exist", schema.number)))?;

        if let Some(previous) = claimed.insert(schema.number, json_name) {
            return Err(mismatch(format!(
                "field number {} is already mapped by '{previous}'",
                schema.number
            )));
        }

        let actual = FieldType::of(&field);
        if actual != schema.kind {
            return Err(mismatch(format!(
                "declared as {} but '{}' is {actual}",
                schema.kind,
                field.name()
            )));
        }

        if schema.kind == FieldType::Map {
            if schema.repeated {
                return Err(mismatch("map fields cannot be declared repeated".to_string()));
            }
        } else if schema.repeated != field.is_list() {
            let expected = if field.is_list() { "repeated" } else { "singular" };
            return Err(mismatch(format!("'{}' is {expected}", field.name())));
        }

        let nested = match (&schema.fields, field.kind()) {
            (None, _) => None,
            (Some(nested), Kind::Message(descriptor)) if schema.kind == FieldType::Message => {
                Some(resolve_fields(&descriptor, nested)?)
            }
            (Some(_), _) => {
                return Err(mismatch(
                    "nested field mappings are only allowed on message fields".to_string(),
                ));
            }
        };

        bindings.push(FieldBinding {
            json_name: json_name.clone(),
            field,
            nested,
        });
    }

    Ok(bindings)
}

/// Renames schema keys to descriptor JSON names, dropping unknown keys.
fn project_request(
    bindings: &[FieldBinding],
    mut object: Map<String, Value>,
) -> Result<Map<String, Value>, CodecError> {
    let mut projected = Map::with_capacity(bindings.len());

    for binding in bindings {
        let value = match object.remove(&binding.json_name) {
            None | Some(Value::Null) => continue,
            Some(value) => value,
        };

        let value = match &binding.nested {
            None => value,
            Some(nested) => map_nested(binding, value, |object| {
                project_request(nested, object).map(Value::Object)
            })?,
        };

        projected.insert(binding.field.json_name().to_string(), value);
    }

    Ok(projected)
}

/// Renames descriptor JSON names back to schema keys, dropping unmapped fields.
fn project_response(bindings: &[FieldBinding], mut object: Map<String, Value>) -> Map<String, Value> {
    let mut projected = Map::with_capacity(bindings.len());

    for binding in bindings {
        let Some(value) = object.remove(binding.field.json_name()) else {
            continue;
        };

        let value = match &binding.nested {
            None => value,
            Some(nested) => match value {
                Value::Object(object) => Value::Object(project_response(nested, object)),
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| match item {
                            Value::Object(object) => Value::Object(project_response(nested, object)),
                            other => other,
                        })
                        .collect(),
                ),
                other => other,
            },
        };

        projected.insert(binding.json_name.clone(), value);
    }

    projected
}

/// Applies `project` to a nested message value, or to each element of a repeated one.
fn map_nested(
    binding: &FieldBinding,
    value: Value,
    project: impl Fn(Map<String, Value>) -> Result<Value, CodecError>,
) -> Result<Value, CodecError> {
    let shape_error = |expected: &'static str, found: &Value| CodecError::UnexpectedShape {
        field: binding.json_name.clone(),
        expected,
        found: json_kind(found),
    };

    if binding.field.is_list() {
        let Value::Array(items) = value else {
            return Err(shape_error("an array of objects", &value));
        };
        let items = items
            .into_iter()
            .map(|item| match item {
                Value::Object(object) => project(object),
                other => Err(shape_error("an array of objects", &other)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(items))
    } else {
        match value {
            Value::Object(object) => project(object),
            other => Err(shape_error("an object", &other)),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hello_service::FILE_DESCRIPTOR_SET;
    use prost_reflect::DescriptorPool;
    use serde_json::json;

    fn codec(message: &str, fields: Value) -> MessageCodec {
        let pool = DescriptorPool::decode(FILE_DESCRIPTOR_SET).unwrap();
        let descriptor = pool.get_message_by_name(message).unwrap();
        let fields: FieldMap = serde_json::from_value(fields).unwrap();
        MessageCodec::resolve(descriptor, &fields).unwrap()
    }

    fn hello_request_codec() -> MessageCodec {
        codec(
            "hello.HelloRequest",
            json!({
                "firstName": { "number": 1, "type": "string" },
                "lastName": { "number": 2, "type": "string" }
            }),
        )
    }

    fn introduction_codec() -> MessageCodec {
        codec(
            "hello.Introduction",
            json!({
                "who": { "number": 1, "type": "message", "fields": {
                    "given": { "number": 1, "type": "string" },
                    "family": { "number": 2, "type": "string" },
                    "age": { "number": 3, "type": "uint32" }
                } },
                "tags": { "number": 2, "type": "string", "repeated": true },
                "visits": { "number": 3, "type": "int64" },
                "mood": { "number": 4, "type": "enum" },
                "friends": { "number": 5, "type": "message", "repeated": true, "fields": {
                    "given": { "number": 1, "type": "string" }
                } },
                "labels": { "number": 6, "type": "map" },
                "avatar": { "number": 7, "type": "bytes" },
                "verified": { "number": 8, "type": "bool" },
                "score": { "number": 9, "type": "double" }
            }),
        )
    }

    #[test]
    fn encodes_using_field_numbers() {
        let bytes = hello_request_codec()
            .encode(json!({ "firstName": "Saul", "lastName": "Hudson" }))
            .unwrap();

        // field 1 (len-delimited) "Saul", field 2 (len-delimited) "Hudson"
        let mut expected = vec![0x0a, 4];
        expected.extend_from_slice(b"Saul");
        expected.extend_from_slice(&[0x12, 6]);
        expected.extend_from_slice(b"Hudson");
        assert_eq!(bytes.as_ref(), expected.as_slice());
    }

    #[test]
    fn round_trips_a_conforming_document() {
        let codec = introduction_codec();
        let document = json!({
            "who": { "given": "Saul", "family": "Hudson", "age": 59 },
            "tags": ["guitar", "hat"],
            "visits": "42",
            "mood": "MOOD_HAPPY",
            "friends": [{ "given": "Duff" }, { "given": "Izzy" }],
            "labels": { "band": "gnr" },
            "avatar": "aGk=",
            "verified": true,
            "score": 1.5
        });

        let bytes = codec.encode(document.clone()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), document);
    }

    #[test]
    fn decodes_to_canonical_proto3_json() {
        let codec = introduction_codec();
        let bytes = codec
            .encode(json!({ "visits": 12, "score": 2, "mood": 2 }))
            .unwrap();

        // 64-bit integers come back as strings, doubles as floats and enums by name.
        assert_eq!(
            codec.decode(&bytes).unwrap(),
            json!({ "visits": "12", "score": 2.0, "mood": "MOOD_GRUMPY" })
        );
    }

    #[test]
    fn drops_unknown_json_fields_on_encode() {
        let codec = hello_request_codec();
        let bytes = codec
            .encode(json!({ "firstName": "Saul", "guitar": "Les Paul", "lastName": null }))
            .unwrap();

        assert_eq!(codec.decode(&bytes).unwrap(), json!({ "firstName": "Saul" }));
    }

    #[test]
    fn drops_fields_missing_from_the_schema_on_decode() {
        let bytes = hello_request_codec()
            .encode(json!({ "firstName": "Saul", "lastName": "Hudson" }))
            .unwrap();

        let partial = codec(
            "hello.HelloRequest",
            json!({ "surname": { "number": 2, "type": "string" } }),
        );

        assert_eq!(partial.decode(&bytes).unwrap(), json!({ "surname": "Hudson" }));
    }

    #[test]
    fn rejects_type_incompatible_values() {
        let err = hello_request_codec()
            .encode(json!({ "firstName": 5 }))
            .unwrap_err();
        assert!(matches!(err, CodecError::Incompatible(_)));
    }

    #[test]
    fn rejects_non_object_documents() {
        let err = hello_request_codec().encode(json!(["Saul"])).unwrap_err();
        assert!(matches!(err, CodecError::NotAnObject { found: "an array", .. }));
    }

    #[test]
    fn rejects_scalars_where_nested_messages_are_mapped() {
        let err = introduction_codec()
            .encode(json!({ "who": "Saul" }))
            .unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedShape { ref field, .. } if field == "who"));
    }

    #[test]
    fn rejects_truncated_bytes() {
        // field 1, declared length 5, one byte of payload
        let err = hello_request_codec().decode(&[0x0a, 5, b'S']).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }
}
