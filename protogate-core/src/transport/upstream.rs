//! # Upstream Handles
//!
//! An [`Upstream`] hands out the service a request uses to reach the route's gRPC server.
//!
//! * [`RouteChannel`] is the production implementation: a route-scoped lifecycle object that
//!   opens its channel on first use and shares it with every subsequent request.
//! * [`Fixed`] wraps a service that is already available, such as an in-process tonic server.
use super::{TransportError, UpstreamTarget, open};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tonic::transport::Channel;

/// Source of the gRPC service used to perform calls for one route.
pub trait Upstream: Clone + Send + Sync + 'static {
    type Service;

    /// Returns a handle to the upstream service, connecting first if needed.
    fn acquire(&self) -> impl Future<Output = Result<Self::Service, TransportError>> + Send;
}

/// A lazily opened channel shared by all the requests of a route.
///
/// The first [`Upstream::acquire`] opens the channel; concurrent callers wait for that same
/// attempt instead of opening their own connections. A failed attempt leaves the handle
/// unopened, so a later request may try again. Once open, the channel handles reconnection
/// by itself.
#[derive(Debug, Clone)]
pub struct RouteChannel {
    target: Arc<UpstreamTarget>,
    channel: Arc<OnceCell<Channel>>,
}

impl RouteChannel {
    /// Creates the handle without connecting.
    pub fn new(target: UpstreamTarget) -> Self {
        Self {
            target: Arc::new(target),
            channel: Arc::new(OnceCell::new()),
        }
    }

    /// Creates the handle and opens the channel right away.
    pub async fn connect(target: UpstreamTarget) -> Result<Self, TransportError> {
        let route_channel = Self::new(target);
        route_channel.acquire().await?;
        Ok(route_channel)
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Whether the channel has been opened.
    pub fn is_open(&self) -> bool {
        self.channel.initialized()
    }
}

impl Upstream for RouteChannel {
    type Service = Channel;

    async fn acquire(&self) -> Result<Channel, TransportError> {
        let channel = self
            .channel
            .get_or_try_init(|| open(&self.target))
            .await
            .inspect_err(|err| {
                tracing::warn!(upstream = %self.target.authority(), error = %err, "failed to open upstream channel")
            })?;

        Ok(channel.clone())
    }
}

/// An upstream service that needs no connection management.
#[derive(Debug, Clone)]
pub struct Fixed<S>(pub S);

impl<S> Upstream for Fixed<S>
where
    S: Clone + Send + Sync + 'static,
{
    type Service = S;

    fn acquire(&self) -> impl Future<Output = Result<S, TransportError>> + Send {
        std::future::ready(Ok(self.0.clone()))
    }
}
