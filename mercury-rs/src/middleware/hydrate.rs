//! Expands template responses.
//!
//! An upstream can deliver a template (marked via `X-Hydrate: true`) which references other
//! resources using `<hydrate src="/path"/>`. The [upstream](crate::middleware::upstream)
//! middleware turns such a response into a [CachedResponse::Hydrate] so that the cache keeps the
//! template. This middleware runs in front of the cache and replaces each reference by the body
//! obtained by an internal **GET** request through the [Gateway]. Therefore each referenced
//! resource is served and cached according to its own route.
//!
//! References are resolved concurrently. Templates nested deeper than [MAX_DEPTH] are delivered
//! without expanding their references. A reference which cannot be resolved (no route, an error
//! status or a failed upstream) is replaced by nothing.
use crate::cache::response::{CachedResponse, Fragment};
use crate::middleware::upstream::HYDRATE_HEADER;
use crate::middleware::{Exchange, Middleware, Next};
use crate::platform::Platform;
use crate::runtime::Gateway;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::{HeaderMap, Method, Request};
use std::sync::Arc;

/// Determines how deep templates are expanded which themselves reference templates.
pub const MAX_DEPTH: usize = 3;

/// Expands the references of [CachedResponse::Hydrate] responses.
pub struct HydrateMiddleware {
    platform: Arc<Platform>,
}

impl HydrateMiddleware {
    /// Creates the middleware which uses the [Gateway] of the given platform to resolve
    /// references.
    pub fn new(platform: Arc<Platform>) -> Self {
        HydrateMiddleware { platform }
    }

    async fn resolve(
        gateway: Option<&Gateway>,
        fragment: &Fragment,
        headers: &HeaderMap,
        depth: usize,
    ) -> Bytes {
        let path = match fragment {
            Fragment::Literal(data) => return data.clone(),
            Fragment::Reference(path) => path,
        };

        if depth >= MAX_DEPTH {
            log::warn!("Not expanding {} as templates are nested too deep.", path);
            return Bytes::new();
        }
        let gateway = match gateway {
            Some(gateway) => gateway,
            None => return Bytes::new(),
        };

        let mut request = match Request::builder()
            .method(Method::GET)
            .uri(path.as_str())
            .body(Bytes::new())
        {
            Ok(request) => request,
            Err(error) => {
                log::warn!("Cannot expand the invalid reference '{}': {}", path, error);
                return Bytes::new();
            }
        };
        *request.headers_mut() = headers.clone();

        match gateway.dispatch(request, depth + 1).await {
            Ok(response) if response.status() < 400 => response.body(),
            Ok(response) => {
                log::warn!(
                    "Cannot expand {} as it yielded status {}.",
                    path,
                    response.status()
                );
                Bytes::new()
            }
            Err(error) => {
                log::warn!("Cannot expand {}: {:#}", path, error);
                Bytes::new()
            }
        }
    }
}

#[async_trait]
impl Middleware for HydrateMiddleware {
    fn name(&self) -> &'static str {
        "hydrate"
    }

    async fn handle(&self, exchange: Exchange, next: Next) -> anyhow::Result<CachedResponse> {
        let depth = exchange.depth;
        let request_headers = exchange.headers.clone();

        let (status, mut headers, fragments) = match next.run(exchange).await? {
            CachedResponse::Hydrate {
                status,
                headers,
                fragments,
            } => (status, headers, fragments),
            plain => return Ok(plain),
        };

        let gateway = self.platform.find::<Gateway>();
        let parts = futures::future::join_all(fragments.iter().map(|fragment| {
            Self::resolve(gateway.as_deref(), fragment, &request_headers, depth)
        }))
        .await;

        let mut body = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in parts {
            body.extend_from_slice(&part);
        }

        headers.remove(HYDRATE_HEADER);
        headers.remove(hyper::header::CONTENT_LENGTH.as_str());

        Ok(CachedResponse::plain(status, headers, body.freeze()))
    }
}
