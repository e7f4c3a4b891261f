//! # Generic gRPC Client
//!
//! Wraps `tonic::client::Grpc` to perform unary calls whose messages are only known as
//! encoded bytes.
//!
//! ## How it works
//!
//! The [`GrpcClient`] utilizes the [`super::codec::BytesCodec`] to hand the already encoded
//! request to tonic and to get the raw response back. The HTTP/2 path comes from the
//! [`MethodBinding`], where it was computed once when the route was bound.
//!
//! Every call is bounded by a deadline: it is propagated to the upstream as `grpc-timeout`
//! and enforced locally, so a call never outlives it even when the upstream can't be reached.
use super::codec::BytesCodec;
use crate::BoxError;
use crate::binding::MethodBinding;
use bytes::Bytes;
use http_body::Body as HttpBody;
use std::time::Duration;
use tonic::{Code, client::GrpcService, transport::Channel};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Internal error, the client was not ready: '{0}'")]
    NotReady(#[source] BoxError),
    #[error("Upstream returned {:?}: '{}'", .0.code(), .0.message())]
    Status(#[source] tonic::Status),
    #[error("Upstream did not reply within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("The call was cancelled before the upstream replied")]
    Cancelled,
}

impl RpcError {
    /// The gRPC status code this error corresponds to.
    pub fn code(&self) -> Code {
        match self {
            RpcError::NotReady(_) => Code::Unavailable,
            RpcError::Status(status) => status.code(),
            RpcError::DeadlineExceeded(_) => Code::DeadlineExceeded,
            RpcError::Cancelled => Code::Cancelled,
        }
    }
}

/// A generic client performing unary calls with opaque message bytes.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// Performs a Unary gRPC call (Single Request -> Single Response).
    ///
    /// Exactly one request is sent; failures are never retried.
    ///
    /// # Returns
    ///
    /// * `Ok(Bytes)` - The encoded response message.
    /// * `Err(RpcError)` - The upstream returned an error status, the transport could not carry
    ///   the call, or `deadline` elapsed.
    pub async fn unary(
        &mut self,
        binding: &MethodBinding,
        payload: Bytes,
        deadline: Duration,
    ) -> Result<Bytes, RpcError> {
        let call = async {
            self.client
                .ready()
                .await
                .map_err(|e| RpcError::NotReady(e.into()))?;

            let mut request = tonic::Request::new(payload);
            request.set_timeout(deadline);

            self.client
                .unary(request, binding.path().clone(), BytesCodec)
                .await
                .map(tonic::Response::into_inner)
                .map_err(RpcError::Status)
        };

        tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| RpcError::DeadlineExceeded(deadline))?
    }
}
