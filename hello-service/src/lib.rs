//! # Hello Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide a gRPC server definition
//! and descriptor set for integration testing the `protogate` transcoding engine.
//! It is not intended for production use.

pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/hello.rs"));
}

pub use pb::hello_service_server::{HelloService, HelloServiceServer};
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptors");
