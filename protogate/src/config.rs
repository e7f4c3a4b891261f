//! # Gateway Configuration
//!
//! The gateway is configured through a single JSON document listing the address to listen on
//! and one entry per route. Each route names the descriptor set and schema file it is bound
//! with, the unary method it calls and the upstream that serves it.
//!
//! Relative descriptor and schema paths are resolved against the directory holding the
//! configuration file, so a configuration and its assets can be moved around together.
use protogate_core::pipeline::{DEFAULT_DEADLINE, DEFAULT_MAX_BODY_BYTES, TranscoderOptions};
use protogate_core::transport::{DEFAULT_CONNECT_TIMEOUT, TrustMode, UpstreamTarget};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{}': {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration file '{}': {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid route '{path}': {reason}")]
    InvalidRoute { path: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// HTTP path the route is mounted on (e.g. `/hello`).
    pub path: String,
    /// Encoded `FileDescriptorSet`.
    pub descriptor: PathBuf,
    pub schema: PathBuf,
    pub service: String,
    pub method: String,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub trust: TrustMode,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
}

impl GatewayConfig {
    /// Reads, validates and resolves the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let bytes = std::fs::read(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: GatewayConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Invalid {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        for route in &mut config.routes {
            route.descriptor = resolve(base, &route.descriptor);
            route.schema = resolve(base, &route.schema);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for route in &self.routes {
            let invalid = |reason: &str| ConfigError::InvalidRoute {
                path: route.path.clone(),
                reason: reason.to_string(),
            };

            if !route.path.starts_with('/') {
                return Err(invalid("the path must start with '/'"));
            }
            if route.path.contains([':', '*', '{', '}']) {
                return Err(invalid("the path must be literal, without captures or wildcards"));
            }
            if !seen.insert(route.path.as_str()) {
                return Err(invalid("the path is configured more than once"));
            }
            if route.timeout_ms == 0 {
                return Err(invalid("timeout_ms must be greater than zero"));
            }
            if route.connect_timeout_ms == 0 {
                return Err(invalid("connect_timeout_ms must be greater than zero"));
            }
        }

        Ok(())
    }
}

impl RouteConfig {
    pub fn target(&self) -> UpstreamTarget {
        UpstreamTarget::new(self.upstream.host.clone(), self.upstream.port, self.trust)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn options(&self) -> TranscoderOptions {
        TranscoderOptions {
            deadline: Duration::from_millis(self.timeout_ms),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_timeout_ms() -> u64 {
    DEFAULT_DEADLINE.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}
