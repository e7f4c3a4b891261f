//! # Dynamic Method Invoker
//!
//! This module contains the low-level building blocks for performing a unary gRPC call
//! whose messages are only known at runtime.
//!
//! Unlike standard `tonic` clients which are strongly typed (e.g., `HelloRequest`), the client
//! here carries opaque Protobuf bytes produced by [`crate::codec::MessageCodec`]; it knows
//! nothing about JSON.
pub mod client;
pub mod codec;
