//! # Transcoding Pipeline
//!
//! A [`Transcoder`] serves the requests of one route. Each request walks a strict sequence of
//! [`Stage`]s and ends either with the JSON response body or with a [`TranscodeError`]:
//!
//! 1. **ReceivingBody**: the streamed JSON body is accumulated, up to a size limit.
//! 2. **Decoding**: the bytes are parsed as JSON and encoded into the request message.
//! 3. **Invoking**: one unary call is made on the route's shared upstream.
//! 4. **EncodingResponse**: the response message is decoded and serialized to JSON.
//!
//! Nothing is forwarded incrementally: the call is unary, so the whole request has to be
//! known before it can be encoded, and the response is produced as a single buffer.
//!
//! A transcoder holds no per-request state. Clone it freely; every clone shares the same
//! [`MethodBinding`] and upstream.
use crate::BoxError;
use crate::binding::MethodBinding;
use crate::codec::CodecError;
use crate::grpc::client::{GrpcClient, RpcError};
use crate::transport::{TransportError, Upstream};
use bytes::Bytes;
use http::StatusCode;
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::{Value, json};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::{Code, client::GrpcService};

/// Content type of every successful response body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// The steps of a request, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReceivingBody,
    Decoding,
    Invoking,
    EncodingResponse,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ReceivingBody => "receiving_body",
            Stage::Decoding => "decoding",
            Stage::Invoking => "invoking",
            Stage::EncodingResponse => "encoding_response",
        };
        f.write_str(name)
    }
}

/// Why the request body could not be turned into a request message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Failed to read the request body: {0}")]
    Body(#[source] BoxError),
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("Invalid request body: {0}")]
    Decode(#[source] DecodeError),
    #[error("Upstream unavailable: {0}")]
    Transport(#[source] TransportError),
    #[error("Upstream call failed: {0}")]
    Upstream(#[source] RpcError),
    #[error("Failed to transcode the upstream response: {0}")]
    Encode(#[source] CodecError),
}

impl TranscodeError {
    /// The stage the request was in when it failed.
    pub fn stage(&self) -> Stage {
        match self {
            TranscodeError::Body(_) | TranscodeError::BodyTooLarge { .. } => Stage::ReceivingBody,
            TranscodeError::Decode(_) => Stage::Decoding,
            TranscodeError::Transport(_) | TranscodeError::Upstream(_) => Stage::Invoking,
            TranscodeError::Encode(_) => Stage::EncodingResponse,
        }
    }

    /// The gRPC status behind an upstream failure.
    pub fn grpc_code(&self) -> Option<Code> {
        match self {
            TranscodeError::Transport(_) => Some(Code::Unavailable),
            TranscodeError::Upstream(err) => Some(err.code()),
            _ => None,
        }
    }

    /// The HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            TranscodeError::Body(_) | TranscodeError::Decode(_) => StatusCode::BAD_REQUEST,
            TranscodeError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TranscodeError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            TranscodeError::Upstream(err) => http_status(err.code()),
            TranscodeError::Encode(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Machine readable error kind used in the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            TranscodeError::Body(_) => "body",
            TranscodeError::BodyTooLarge { .. } => "body_too_large",
            TranscodeError::Decode(_) => "decode",
            TranscodeError::Transport(_) | TranscodeError::Upstream(_) => "upstream",
            TranscodeError::Encode(_) => "encode",
        }
    }

    /// The JSON error body: `{"error": kind, "message": text}`, plus `"code"` for upstream errors.
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let Some(code) = self.grpc_code() {
            body["code"] = Value::from(code_name(code));
        }
        body
    }
}

/// Per-route limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscoderOptions {
    /// Upper bound on acquiring the upstream and completing the call.
    pub deadline: Duration,
    pub max_body_bytes: usize,
}

impl Default for TranscoderOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Runs the JSON -> gRPC -> JSON pipeline for the requests of one route.
#[derive(Debug, Clone)]
pub struct Transcoder<U> {
    binding: Arc<MethodBinding>,
    upstream: U,
    options: TranscoderOptions,
}

impl<U> Transcoder<U> {
    pub fn new(binding: Arc<MethodBinding>, upstream: U, options: TranscoderOptions) -> Self {
        Self {
            binding,
            upstream,
            options,
        }
    }

    pub fn binding(&self) -> &MethodBinding {
        &self.binding
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn options(&self) -> &TranscoderOptions {
        &self.options
    }
}

impl<U> Transcoder<U>
where
    U: Upstream,
    U::Service: GrpcService<tonic::body::Body>,
    <U::Service as GrpcService<tonic::body::Body>>::Error: Into<BoxError>,
    <U::Service as GrpcService<tonic::body::Body>>::ResponseBody:
        HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <<U::Service as GrpcService<tonic::body::Body>>::ResponseBody as HttpBody>::Error:
        Into<BoxError> + Send,
{
    /// Transcodes one request body into the JSON response body.
    ///
    /// Dropping the returned future at any point releases everything the request holds,
    /// including the in-flight call; the shared upstream stays usable.
    #[tracing::instrument(name = "transcode", skip_all, fields(method = %self.binding.path()))]
    pub async fn transcode<B>(&self, body: B) -> Result<Bytes, TranscodeError>
    where
        B: HttpBody,
        B::Error: Into<BoxError>,
    {
        let result = self.run(body).await;

        if let Err(err) = &result {
            if err.status().is_server_error() {
                tracing::warn!(stage = %err.stage(), error = %err, "transcoding failed");
            } else {
                tracing::debug!(stage = %err.stage(), error = %err, "rejected request");
            }
        }

        result
    }

    /// Like [`Transcoder::transcode`], but gives up as soon as `cancelled` completes, failing
    /// with a cancelled upstream error.
    pub async fn transcode_until<B, C>(&self, body: B, cancelled: C) -> Result<Bytes, TranscodeError>
    where
        B: HttpBody,
        B::Error: Into<BoxError>,
        C: Future<Output = ()>,
    {
        tokio::select! {
            result = self.transcode(body) => result,
            () = cancelled => {
                tracing::debug!(method = %self.binding.path(), "request cancelled");
                Err(TranscodeError::Upstream(RpcError::Cancelled))
            }
        }
    }

    async fn run<B>(&self, body: B) -> Result<Bytes, TranscodeError>
    where
        B: HttpBody,
        B::Error: Into<BoxError>,
    {
        tracing::debug!(stage = %Stage::ReceivingBody);
        let body = self.receive(body).await?;

        tracing::debug!(stage = %Stage::Decoding, bytes = body.len());
        let request = self.decode_request(&body)?;

        tracing::debug!(stage = %Stage::Invoking, bytes = request.len());
        let response = self.invoke(request).await?;

        tracing::debug!(stage = %Stage::EncodingResponse, bytes = response.len());
        self.encode_response(&response)
    }

    async fn receive<B>(&self, body: B) -> Result<Bytes, TranscodeError>
    where
        B: HttpBody,
        B::Error: Into<BoxError>,
    {
        let limit = self.options.max_body_bytes;
        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                Err(TranscodeError::BodyTooLarge { limit })
            }
            Err(err) => Err(TranscodeError::Body(err)),
        }
    }

    fn decode_request(&self, body: &[u8]) -> Result<Bytes, TranscodeError> {
        let json: Value = serde_json::from_slice(body)
            .map_err(|e| TranscodeError::Decode(DecodeError::Json(e)))?;

        self.binding
            .request_codec()
            .encode(json)
            .map_err(|e| TranscodeError::Decode(e.into()))
    }

    async fn invoke(&self, payload: Bytes) -> Result<Bytes, TranscodeError> {
        let deadline = self.options.deadline;
        let started = Instant::now();

        let service = tokio::time::timeout(deadline, self.upstream.acquire())
            .await
            .map_err(|_| TranscodeError::Upstream(RpcError::DeadlineExceeded(deadline)))?
            .map_err(TranscodeError::Transport)?;

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(TranscodeError::Upstream(RpcError::DeadlineExceeded(deadline)));
        }

        GrpcClient::new(service)
            .unary(&self.binding, payload, remaining)
            .await
            .map_err(TranscodeError::Upstream)
    }

    fn encode_response(&self, response: &[u8]) -> Result<Bytes, TranscodeError> {
        let json = self
            .binding
            .response_codec()
            .decode(response)
            .map_err(TranscodeError::Encode)?;

        serde_json::to_vec(&json)
            .map(Bytes::from)
            .map_err(|e| TranscodeError::Encode(CodecError::Serialize(e)))
    }
}

/// HTTP status for a gRPC code, following the usual gRPC/HTTP gateway mapping.
fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        // 499 Client Closed Request
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Canonical upper-case name of a gRPC code (e.g. `UNAVAILABLE`).
fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_upstream_codes_to_http_statuses() {
        let upstream = |code| TranscodeError::Upstream(RpcError::Status(tonic::Status::new(code, "")));

        assert_eq!(upstream(Code::InvalidArgument).status(), StatusCode::BAD_REQUEST);
        assert_eq!(upstream(Code::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(upstream(Code::Unavailable).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream(Code::Cancelled).status().as_u16(), 499);
        assert_eq!(
            TranscodeError::Upstream(RpcError::DeadlineExceeded(DEFAULT_DEADLINE)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn renders_upstream_errors_with_their_code() {
        let err = TranscodeError::Upstream(RpcError::Status(tonic::Status::permission_denied(
            "nope",
        )));
        let body = err.to_json();

        assert_eq!(body["error"], "upstream");
        assert_eq!(body["code"], "PERMISSION_DENIED");
        assert_eq!(err.stage(), Stage::Invoking);
    }

    #[test]
    fn renders_client_errors_without_a_code() {
        let json_err = serde_json::from_slice::<Value>(b"{\"firstName\": }").unwrap_err();
        let err = TranscodeError::Decode(DecodeError::Json(json_err));
        let body = err.to_json();

        assert_eq!(body["error"], "decode");
        assert!(body.get("code").is_none());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.stage(), Stage::Decoding);
    }
}
