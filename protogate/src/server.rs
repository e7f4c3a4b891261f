//! # HTTP Surface
//!
//! Mounts one `POST` handler per configured route on an `axum` router. The handler hands the
//! request body to the route's [`Transcoder`] and turns the outcome into an HTTP response:
//!
//! * On success: `200 OK` with the transcoded JSON and `Content-Type: application/json`.
//! * On failure: the status derived from [`TranscodeError::status`] and its JSON error body.
//!
//! A request is cancelled by dropping its future, which is what happens when the client goes
//! away before the response is written.
use crate::config::{GatewayConfig, RouteConfig};
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use protogate_core::binding::{DescriptorError, bind};
use protogate_core::pipeline::{CONTENT_TYPE_JSON, TranscodeError, Transcoder};
use protogate_core::transport::RouteChannel;
use std::sync::Arc;

pub type RouteTranscoder = Transcoder<RouteChannel>;

/// A bound route, ready to be mounted.
#[derive(Debug, Clone)]
pub struct Route {
    pub path: String,
    pub transcoder: RouteTranscoder,
}

#[derive(Debug, thiserror::Error)]
#[error("{failed} of {total} routes failed to bind")]
pub struct BindError {
    pub failed: usize,
    pub total: usize,
}

/// Binds one route. The upstream channel is not opened until the first request needs it.
pub fn bind_route(config: &RouteConfig) -> Result<Route, DescriptorError> {
    let binding = bind(
        &config.descriptor,
        &config.schema,
        &config.service,
        &config.method,
    )?;

    Ok(Route {
        path: config.path.clone(),
        transcoder: Transcoder::new(
            Arc::new(binding),
            RouteChannel::new(config.target()),
            config.options(),
        ),
    })
}

/// Binds every configured route, logging each failure.
///
/// Fails if any route can't be bound, after all of them have been tried.
pub fn bind_routes(config: &GatewayConfig) -> Result<Vec<Route>, BindError> {
    let mut routes = Vec::with_capacity(config.routes.len());
    let mut failed = 0;

    for route in &config.routes {
        match bind_route(route) {
            Ok(bound) => routes.push(bound),
            Err(err) => {
                tracing::error!(route = %route.path, error = %err, "failed to bind route");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(BindError {
            failed,
            total: config.routes.len(),
        });
    }

    Ok(routes)
}

pub fn router(routes: Vec<Route>) -> Router {
    routes.into_iter().fold(Router::new(), |router, route| {
        router.route(&route.path, post(transcode).with_state(route.transcoder))
    })
}

async fn transcode(State(transcoder): State<RouteTranscoder>, body: Body) -> Response {
    match transcoder.transcode(body).await {
        Ok(json) => ([(header::CONTENT_TYPE, CONTENT_TYPE_JSON)], json).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &TranscodeError) -> Response {
    (err.status(), Json(err.to_json())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request, StatusCode};
    use hello_service::pb::{HelloRequest, HelloResponse, Introduction};
    use hello_service::{FILE_DESCRIPTOR_SET, HelloService, HelloServiceServer};
    use protogate_core::tonic::{self, Status};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_stream::wrappers::TcpListenerStream;
    use tower::ServiceExt;

    /// Counts the calls that reached the upstream and the ones whose handler was dropped.
    #[derive(Clone, Default)]
    struct Greeter {
        started: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tonic::async_trait]
    impl HelloService for Greeter {
        type HelloStreamStream = tokio_stream::Empty<Result<HelloResponse, Status>>;

        async fn hello(
            &self,
            request: tonic::Request<HelloRequest>,
        ) -> Result<tonic::Response<HelloResponse>, Status> {
            let request = request.into_inner();
            if request.first_name.is_empty() {
                return Err(Status::invalid_argument("first_name is required"));
            }
            if request.first_name == "slow" {
                self.started.fetch_add(1, Ordering::SeqCst);
                let _guard = DropCounter(self.dropped.clone());
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(tonic::Response::new(HelloResponse {
                greeting: format!("Hello, {} {}", request.first_name, request.last_name),
            }))
        }

        async fn introduce(
            &self,
            request: tonic::Request<Introduction>,
        ) -> Result<tonic::Response<Introduction>, Status> {
            Ok(tonic::Response::new(request.into_inner()))
        }

        async fn hello_stream(
            &self,
            _request: tonic::Request<HelloRequest>,
        ) -> Result<tonic::Response<Self::HelloStreamStream>, Status> {
            Err(Status::unimplemented("not served"))
        }
    }

    async fn spawn_upstream(greeter: Greeter) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(HelloServiceServer::new(greeter))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        port
    }

    /// Serves `app` on a local port.
    async fn spawn_gateway(app: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        port
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("counter never reached {expected}"));
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Writes the descriptor set, schema and configuration into `dir` and loads it.
    fn gateway_config(dir: &TempDir, port: u16) -> GatewayConfig {
        std::fs::write(dir.path().join("hello.desc"), FILE_DESCRIPTOR_SET).unwrap();
        let schema = json!({
            "request": { "fields": {
                "firstName": { "number": 1, "type": "string" },
                "lastName": { "number": 2, "type": "string" }
            } },
            "response": { "fields": {
                "greeting": { "number": 1, "type": "string" }
            } }
        });
        std::fs::write(dir.path().join("hello.schema.json"), schema.to_string()).unwrap();

        let config = json!({
            "listen": "127.0.0.1:0",
            "routes": [{
                "path": "/hello",
                "descriptor": "hello.desc",
                "schema": "hello.schema.json",
                "service": "hello.HelloService",
                "method": "Hello",
                "upstream": { "host": "127.0.0.1", "port": port },
                "trust": "plaintext",
                "connect_timeout_ms": 1000
            }]
        });
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, config.to_string()).unwrap();

        GatewayConfig::load(path).unwrap()
    }

    fn post_json(path: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, content_type, body)
    }

    #[tokio::test]
    async fn transcodes_a_post_end_to_end() {
        let dir = TempDir::new().unwrap();
        let app = router(bind_routes(&gateway_config(&dir, spawn_upstream(Greeter::default()).await)).unwrap());

        let (status, content_type, body) = send(
            app,
            post_json("/hello", json!({ "firstName": "Saul", "lastName": "Hudson" }).to_string()),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(body, json!({ "greeting": "Hello, Saul Hudson" }));
    }

    #[tokio::test]
    async fn reports_errors_as_json() {
        let dir = TempDir::new().unwrap();
        let app = router(bind_routes(&gateway_config(&dir, spawn_upstream(Greeter::default()).await)).unwrap());

        let (status, _, body) = send(app.clone(), post_json("/hello", "{ not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "decode");

        let (status, _, body) =
            send(app, post_json("/hello", json!({ "lastName": "Rose" }).to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "upstream");
        assert_eq!(body["code"], "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_service_unavailable() {
        let dir = TempDir::new().unwrap();
        let app = router(bind_routes(&gateway_config(&dir, closed_port().await)).unwrap());

        let (status, _, body) =
            send(app, post_json("/hello", json!({ "firstName": "Axl" }).to_string())).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn only_configured_posts_are_routed() {
        let dir = TempDir::new().unwrap();
        let app = router(bind_routes(&gateway_config(&dir, closed_port().await)).unwrap());

        let get = Request::builder()
            .method(Method::GET)
            .uri("/hello")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(app.clone(), get).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, _, _) = send(app, post_json("/goodbye", "{}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn client_disconnect_cancels_the_upstream_call() {
        let greeter = Greeter::default();
        let dir = TempDir::new().unwrap();
        let config = gateway_config(&dir, spawn_upstream(greeter.clone()).await);
        let port = spawn_gateway(router(bind_routes(&config).unwrap())).await;

        let body = json!({ "firstName": "slow", "lastName": "Rose" }).to_string();
        let request = format!(
            "POST /hello HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();

        wait_for(&greeter.started, 1).await;
        assert_eq!(greeter.dropped.load(Ordering::SeqCst), 0);

        drop(client);

        wait_for(&greeter.dropped, 1).await;
        assert_eq!(greeter.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_route_is_tried_before_failing() {
        let dir = TempDir::new().unwrap();
        let mut config = gateway_config(&dir, 6565);

        let mut broken = config.routes[0].clone();
        broken.path = "/broken".to_string();
        broken.method = "Goodbye".to_string();
        let mut missing = config.routes[0].clone();
        missing.path = "/missing".to_string();
        missing.descriptor = dir.path().join("missing.desc");
        config.routes.extend([broken, missing]);

        let err = bind_routes(&config).unwrap_err();
        assert_eq!(err.failed, 2);
        assert_eq!(err.total, 3);
    }
}
