//! # Schema Resolver
//!
//! Binds a route to one unary method. [`bind`] loads the compiled `FileDescriptorSet` and the
//! schema file from disk, checks them against each other and produces a [`MethodBinding`]:
//! the gRPC path plus one [`MessageCodec`] per direction.
//!
//! Binding happens once, before the route accepts traffic. Every inconsistency between the
//! schema and the descriptor is reported here so that it can never surface at request time.
//!
//! ## Message type resolution
//!
//! * If the descriptor set declares the service, the method must exist and be unary, and its
//!   input/output types are authoritative. A `type` declared in the schema must agree with them.
//! * Otherwise the descriptor set only carries messages (for example a single compiled `.proto`
//!   without services) and the schema must name both message types explicitly.
use crate::codec::MessageCodec;
use crate::schema::{MessageSchema, TranscodingSchema};
use http::uri::PathAndQuery;
use prost_reflect::{DescriptorPool, MessageDescriptor};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Failed to read descriptor file '{}': {source}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode descriptor set '{}': {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: prost_reflect::DescriptorError,
    },
    #[error("Failed to read schema file '{}': {source}", path.display())]
    SchemaUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid schema file '{}': {source}", path.display())]
    SchemaInvalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid method path '/{service}/{method}'")]
    InvalidMethodPath { service: String, method: String },
    #[error("Method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },
    #[error("Method '{0}' is streaming, only unary methods can be transcoded")]
    StreamingMethod(String),
    #[error(
        "Service '{service}' is not declared in the descriptor set, so the {direction} schema must declare its message type"
    )]
    UntypedSchema {
        service: String,
        direction: &'static str,
    },
    #[error("Message '{0}' not found in the descriptor set")]
    MessageNotFound(String),
    #[error("The {direction} schema declares type '{declared}' but the method uses '{expected}'")]
    MessageTypeMismatch {
        direction: &'static str,
        declared: String,
        expected: String,
    },
    #[error("Schema field '{field}' does not match message '{message}': {reason}")]
    SchemaMismatch {
        message: String,
        field: String,
        reason: String,
    },
}

/// Everything needed to perform and transcode one unary call.
///
/// Immutable once built; share it across requests behind an `Arc`.
#[derive(Debug, Clone)]
pub struct MethodBinding {
    service: String,
    method: String,
    path: PathAndQuery,
    request: MessageCodec,
    response: MessageCodec,
}

impl MethodBinding {
    /// Binds `service`/`method` using an already decoded descriptor pool and schema.
    pub fn from_pool(
        pool: &DescriptorPool,
        schema: &TranscodingSchema,
        service: &str,
        method: &str,
    ) -> Result<Self, DescriptorError> {
        let path = PathAndQuery::from_str(&format!("/{service}/{method}"))
            .ok()
            .filter(|_| is_name(service) && is_name(method))
            .ok_or_else(|| DescriptorError::InvalidMethodPath {
                service: service.to_string(),
                method: method.to_string(),
            })?;

        let (request, response) = match pool.get_service_by_name(service) {
            Some(descriptor) => {
                let method_descriptor = descriptor
                    .methods()
                    .find(|m| m.name() == method)
                    .ok_or_else(|| DescriptorError::MethodNotFound {
                        service: service.to_string(),
                        method: method.to_string(),
                    })?;

                if method_descriptor.is_client_streaming() || method_descriptor.is_server_streaming()
                {
                    return Err(DescriptorError::StreamingMethod(
                        method_descriptor.full_name().to_string(),
                    ));
                }

                (
                    check_declared_type("request", &schema.request, method_descriptor.input())?,
                    check_declared_type("response", &schema.response, method_descriptor.output())?,
                )
            }
            None => (
                declared_type(pool, service, "request", &schema.request)?,
                declared_type(pool, service, "response", &schema.response)?,
            ),
        };

        Ok(Self {
            service: service.to_string(),
            method: method.to_string(),
            path,
            request: MessageCodec::resolve(request, &schema.request.fields)?,
            response: MessageCodec::resolve(response, &schema.response.fields)?,
        })
    }

    /// Fully qualified service name (e.g. `hello.HelloService`).
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The HTTP/2 path of the call (e.g. `/hello.HelloService/Hello`).
    pub fn path(&self) -> &PathAndQuery {
        &self.path
    }

    pub fn request_codec(&self) -> &MessageCodec {
        &self.request
    }

    pub fn response_codec(&self) -> &MessageCodec {
        &self.response
    }
}

/// Loads the descriptor set and schema from disk and binds `service`/`method`.
///
/// # Returns
///
/// * `Ok(MethodBinding)` - The validated binding.
/// * `Err(DescriptorError)` - If either file is unreadable or invalid, or if they disagree.
pub fn bind(
    descriptor_path: impl AsRef<Path>,
    schema_path: impl AsRef<Path>,
    service: &str,
    method: &str,
) -> Result<MethodBinding, DescriptorError> {
    let descriptor_path = descriptor_path.as_ref();
    let schema_path = schema_path.as_ref();

    let bytes = std::fs::read(descriptor_path).map_err(|source| DescriptorError::NotFound {
        path: descriptor_path.to_path_buf(),
        source,
    })?;
    let pool =
        DescriptorPool::decode(bytes.as_slice()).map_err(|source| DescriptorError::Malformed {
            path: descriptor_path.to_path_buf(),
            source,
        })?;

    let bytes = std::fs::read(schema_path).map_err(|source| DescriptorError::SchemaUnreadable {
        path: schema_path.to_path_buf(),
        source,
    })?;
    let schema =
        TranscodingSchema::from_slice(&bytes).map_err(|source| DescriptorError::SchemaInvalid {
            path: schema_path.to_path_buf(),
            source,
        })?;

    let binding = MethodBinding::from_pool(&pool, &schema, service, method)?;

    tracing::info!(
        path = %binding.path(),
        request = binding.request_codec().descriptor().full_name(),
        response = binding.response_codec().descriptor().full_name(),
        "bound method"
    );

    Ok(binding)
}

fn check_declared_type(
    direction: &'static str,
    schema: &MessageSchema,
    actual: MessageDescriptor,
) -> Result<MessageDescriptor, DescriptorError> {
    match &schema.type_name {
        Some(declared) if declared != actual.full_name() => {
            Err(DescriptorError::MessageTypeMismatch {
                direction,
                declared: declared.clone(),
                expected: actual.full_name().to_string(),
            })
        }
        _ => Ok(actual),
    }
}

fn declared_type(
    pool: &DescriptorPool,
    service: &str,
    direction: &'static str,
    schema: &MessageSchema,
) -> Result<MessageDescriptor, DescriptorError> {
    let name = schema
        .type_name
        .as_deref()
        .ok_or_else(|| DescriptorError::UntypedSchema {
            service: service.to_string(),
            direction,
        })?;

    pool.get_message_by_name(name)
        .ok_or_else(|| DescriptorError::MessageNotFound(name.to_string()))
}

fn is_name(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('/')
}
