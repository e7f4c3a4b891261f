//! # Protogate Core
//!
//! `protogate-core` is the transcoding engine behind the Protogate gateway. It turns a JSON
//! document into a binary Protobuf message described by a descriptor loaded at runtime, performs
//! a single unary gRPC call over a shared, secured channel and turns the binary reply back into JSON.
//!
//! No message type is known at compile time: wire layout, field numbers and JSON names are all
//! resolved from a `FileDescriptorSet` and a human-authored schema file when a route is bound.
//!
//! ## Key Components
//!
//! * **[`binding::bind`]:** The schema resolver. Loads the descriptor set and schema file, validates
//!   one against the other and produces an immutable [`binding::MethodBinding`].
//! * **[`codec::MessageCodec`]:** Descriptor-bound JSON <-> Protobuf conversion.
//! * **[`transport::RouteChannel`]:** The route-scoped upstream channel, opened once over TLS
//!   (or plaintext for local development) and shared by every request of the route.
//! * **[`grpc::client::GrpcClient`]:** Performs the unary call carrying opaque Protobuf bytes.
//! * **[`pipeline::Transcoder`]:** Orchestrates body accumulation, encoding, invocation and decoding
//!   for one request.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost-reflect` and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod binding;
pub mod codec;
pub mod grpc;
pub mod pipeline;
pub mod schema;
pub mod transport;

// Re-exports
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
