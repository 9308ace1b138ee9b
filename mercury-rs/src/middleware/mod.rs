//! Provides the middleware chain which processes each request.
//!
//! Each route specifies a list of middlewares by name. Upon a request, the first middleware of
//! the chain is invoked with the [Exchange] and a [Next] handle. It can either produce a response
//! on its own (e.g. a cache hit or a rejected authentication) or invoke the remainder of the chain
//! via [Next::run] and inspect or modify its response.
//!
//! The following middlewares are known:
//! * **stats**: records the number of requests, errors, cache hits and the latency per route
//!   (see [stats]).
//! * **auth**: checks the bearer token if the route requires one (see [auth]).
//! * **hydrate**: expands the references of template responses (see [hydrate]).
//! * **cache**: serves and stores responses in the [Cache](crate::cache::Cache) (see [cache]).
//! * **upstream**: forwards the request to the upstream of the route (see [upstream]).
use crate::cache::response::CachedResponse;
use crate::cache::Cache;
use crate::platform::Platform;
use crate::routes::Route;
use crate::stats::Statistics;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri};
use std::sync::Arc;

pub mod auth;
pub mod cache;
pub mod hydrate;
pub mod stats;
pub mod upstream;

/// Contains the name of the header which reports how the cache handled a request.
///
/// The value is one of [CACHE_HIT], [CACHE_STALE], [CACHE_SAINT] or [CACHE_MISS].
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

/// Marks a response which was served fresh from the cache.
pub const CACHE_HIT: &str = "HIT";

/// Marks a stale response which was served from the cache while being refreshed.
pub const CACHE_STALE: &str = "STALE";

/// Marks a stale response which was served as the upstream failed.
pub const CACHE_SAINT: &str = "SAINT";

/// Marks a response which was fetched from the upstream.
pub const CACHE_MISS: &str = "MISS";

/// Represents a request being processed along with the route it was assigned to.
///
/// An exchange is cheap to clone (the body is reference counted). A clone is used to refresh
/// cache entries in the background after the response has been delivered.
#[derive(Clone, Debug)]
pub struct Exchange {
    /// The HTTP method of the request.
    pub method: Method,
    /// The requested URI (path and query).
    pub uri: Uri,
    /// The request headers.
    pub headers: HeaderMap,
    /// The request body.
    pub body: Bytes,
    /// The route which handles this request.
    pub route: Arc<Route>,
    /// The nesting level of hydration requests (0 for requests received by the server).
    pub depth: usize,
}

impl Exchange {
    /// Creates an exchange without headers or body.
    pub fn new(method: Method, uri: Uri, route: Arc<Route>) -> Self {
        Exchange {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            route,
            depth: 0,
        }
    }

    /// Determines if this is a request to purge cache entries.
    pub fn is_purge(&self) -> bool {
        self.method.as_str().eq_ignore_ascii_case("PURGE")
    }

    /// Returns the value of the given header if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }
}

/// Represents a chain of middlewares as executed for a route.
pub type Chain = Arc<[Arc<dyn Middleware>]>;

/// Describes a step in the processing of a request.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Returns the name used to refer to this middleware in the config.
    fn name(&self) -> &'static str;

    /// Handles the given exchange, most probably by invoking the remainder of the chain.
    async fn handle(&self, exchange: Exchange, next: Next) -> anyhow::Result<CachedResponse>;
}

/// Represents the remainder of a chain.
#[derive(Clone)]
pub struct Next {
    chain: Chain,
    position: usize,
}

impl Next {
    /// Creates a handle which starts at the first middleware of the given chain.
    pub fn new(chain: Chain) -> Self {
        Next { chain, position: 0 }
    }

    /// Invokes the next middleware in the chain.
    ///
    /// # Errors
    /// Fails if the end of the chain is reached without a response being produced.
    pub async fn run(self, exchange: Exchange) -> anyhow::Result<CachedResponse> {
        let middleware = match self.chain.get(self.position) {
            Some(middleware) => middleware.clone(),
            None => {
                return Err(anyhow::anyhow!(
                    "No middleware of route '{}' produced a response.",
                    exchange.route.name
                ))
            }
        };

        let next = Next {
            chain: self.chain,
            position: self.position + 1,
        };
        middleware.handle(exchange, next).await
    }
}

/// Provides the shared components required to create middlewares.
#[derive(Clone)]
pub struct Services {
    /// The platform, used to look up the gateway when expanding templates.
    pub platform: Arc<Platform>,
    /// The cache shared by all routes.
    pub cache: Arc<Cache>,
    /// The statistics of all routes.
    pub statistics: Arc<Statistics>,
    /// The HTTP client used to contact upstreams.
    pub client: upstream::HttpClient,
}

/// Creates the middleware with the given name.
pub fn create(name: &str, services: &Services) -> anyhow::Result<Arc<dyn Middleware>> {
    match name {
        "stats" => Ok(Arc::new(stats::StatsMiddleware::new(
            services.statistics.clone(),
        ))),
        "auth" => Ok(Arc::new(auth::AuthMiddleware)),
        "hydrate" => Ok(Arc::new(hydrate::HydrateMiddleware::new(
            services.platform.clone(),
        ))),
        "cache" => Ok(Arc::new(cache::CacheMiddleware::new(services.cache.clone()))),
        "upstream" => Ok(Arc::new(upstream::UpstreamMiddleware::new(
            services.client.clone(),
        ))),
        _ => Err(anyhow::anyhow!("Unknown middleware: '{}'", name)),
    }
}

/// Creates the chain of the given route.
pub fn build_chain(route: &Route, services: &Services) -> anyhow::Result<Chain> {
    route
        .middlewares
        .iter()
        .map(|name| {
            create(name, services)
                .map_err(|error| anyhow::anyhow!("Route '{}': {:#}", route.name, error))
        })
        .collect::<anyhow::Result<Vec<_>>>()
        .map(Chain::from)
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::cache::response::CachedResponse;
    use crate::middleware::{Exchange, Middleware, Next};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Replaces the upstream in tests: answers with the next scripted response and counts calls.
    pub struct ScriptedUpstream {
        responses: Mutex<Vec<anyhow::Result<CachedResponse>>>,
        fallback: CachedResponse,
        pub calls: AtomicUsize,
        pub delay: Duration,
    }

    impl ScriptedUpstream {
        pub fn new(fallback: CachedResponse) -> Self {
            ScriptedUpstream {
                responses: Mutex::new(Vec::new()),
                fallback,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn push(&self, response: anyhow::Result<CachedResponse>) {
            self.responses.lock().unwrap().insert(0, response);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Middleware for ScriptedUpstream {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, _exchange: Exchange, _next: Next) -> anyhow::Result<CachedResponse> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let scripted = self.responses.lock().unwrap().pop();
            scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    pub fn chain(middlewares: Vec<Arc<dyn Middleware>>) -> Next {
        Next::new(middlewares.into())
    }
}
