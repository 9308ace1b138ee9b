//! Serves responses from the [Cache] and stores successful responses.
//!
//! Only **GET** requests are cached, everything else passes through. For a cached entry, the
//! freshness decides what happens:
//! * **fresh**: the entry is served (`X-Cache: HIT`).
//! * **stale** but within the grace period of the route: the entry is served (`X-Cache: STALE`)
//!   and a single background task (coordinated via the
//!   [DownloadCoordinator](crate::cache::downloads::DownloadCoordinator)) runs the remainder of
//!   the chain to refresh it.
//! * **expired** beyond the grace period: the request is handled like a miss.
//!
//! A miss runs the remainder of the chain (`X-Cache: MISS`). If this fails or yields a server
//! error and the route has a saint period, a stale entry is served instead and kept for the
//! saint period (`X-Cache: SAINT`). Responses with a status of 500 or above are never stored.
//!
//! # Purging
//! A **PURGE** request removes the entry for the request's keys, or all variants of its primary
//! key if the **X-Purge-All** header is present. The purge hook of the route has to accept the
//! request, otherwise **403** is returned. The response is **200** if something was removed and
//! **404** otherwise.
use crate::cache::entry::{CacheEntry, Freshness};
use crate::cache::response::CachedResponse;
use crate::cache::ttl::derive_ttl;
use crate::cache::Cache;
use crate::middleware::{
    Exchange, Middleware, Next, CACHE_HIT, CACHE_MISS, CACHE_SAINT, CACHE_STALE,
    CACHE_STATUS_HEADER,
};
use crate::routes::Route;
use async_trait::async_trait;
use hyper::Method;
use std::sync::Arc;
use std::time::Instant;

/// Contains the name of the header which makes a purge request drop all variants of a resource.
pub const PURGE_ALL_HEADER: &str = "X-Purge-All";

/// Provides the caching middleware.
pub struct CacheMiddleware {
    cache: Arc<Cache>,
}

impl CacheMiddleware {
    /// Creates a middleware which uses the given cache.
    pub fn new(cache: Arc<Cache>) -> Self {
        CacheMiddleware { cache }
    }

    async fn purge(&self, exchange: &Exchange) -> CachedResponse {
        let permitted = exchange
            .route
            .purge
            .as_ref()
            .map(|hook| hook(exchange))
            .unwrap_or(false);
        if !permitted {
            return CachedResponse::text(403, "Forbidden");
        }

        let (primary, secondary) = exchange.route.key.keys(exchange);
        let removed = if exchange.header(PURGE_ALL_HEADER).is_some() {
            self.cache.delete_all(&primary).await
        } else {
            self.cache.delete(&primary, &secondary).await
        };

        log::debug!("Purged {} ({}): {}", primary, secondary, removed);
        if removed {
            CachedResponse::text(200, "Purged")
        } else {
            CachedResponse::text(404, "Not found")
        }
    }

    /// Starts a background refresh unless one is already running for the given keys.
    fn refresh(&self, entry: &Arc<CacheEntry>, exchange: &Exchange, next: &Next) {
        let lease = match self
            .cache
            .downloads()
            .lease(&lease_key(entry))
        {
            Some(lease) => lease,
            None => return,
        };

        let cache = self.cache.clone();
        let entry = entry.clone();
        let exchange = exchange.clone();
        let next = next.clone();
        crate::spawn!(async move {
            let _lease = lease;
            let route = exchange.route.clone();
            match next.run(exchange).await {
                Ok(response) if !response.is_server_error() => {
                    store(&cache, &route, entry.primary(), entry.secondary(), response).await;
                }
                Ok(response) => {
                    log::warn!(
                        "Refreshing {} ({}) yielded status {}.",
                        entry.primary(),
                        entry.secondary(),
                        response.status()
                    );
                    let _ = extend(&entry, &route);
                }
                Err(error) => log::warn!(
                    "Failed to refresh {} ({}): {:#}",
                    entry.primary(),
                    entry.secondary(),
                    error
                ),
            }
        });
    }
}

/// Joins both keys of an entry by a character which never occurs in a request path.
fn lease_key(entry: &CacheEntry) -> String {
    format!("{}\u{0}{}", entry.primary(), entry.secondary())
}

/// Stores the response if its status and headers permit it.
async fn store(cache: &Cache, route: &Route, primary: &str, secondary: &str, response: CachedResponse) {
    if response.is_server_error() {
        return;
    }
    if let Some(ttl) = derive_ttl(response.status(), route.ttl, response.headers()) {
        let _ = cache.set(primary, secondary, response, ttl).await;
    }
}

/// Keeps the given entry for the saint period of the route.
///
/// Returns **false** if the route has no (usable) saint period.
fn extend(entry: &CacheEntry, route: &Route) -> bool {
    if route.saint.is_zero() {
        return false;
    }

    match Instant::now().checked_add(route.saint) {
        Some(expires) => {
            entry.expire(expires);
            true
        }
        None => false,
    }
}

fn serve(entry: &CacheEntry, status: &str) -> CachedResponse {
    entry
        .response()
        .as_ref()
        .clone()
        .with_header(CACHE_STATUS_HEADER, status)
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn handle(&self, exchange: Exchange, next: Next) -> anyhow::Result<CachedResponse> {
        if exchange.is_purge() {
            return Ok(self.purge(&exchange).await);
        }
        if exchange.method != Method::GET {
            return next.run(exchange).await;
        }

        let route = exchange.route.clone();
        let (primary, secondary) = route.key.keys(&exchange);
        let entry = self.cache.get(&primary, &secondary);
        if let Some(entry) = &entry {
            match entry.freshness(Instant::now(), route.grace) {
                Freshness::Fresh => return Ok(serve(entry, CACHE_HIT)),
                Freshness::Stale => {
                    self.refresh(entry, &exchange, &next);
                    return Ok(serve(entry, CACHE_STALE));
                }
                Freshness::Expired => (),
            }
        }

        let result = next.run(exchange).await;
        let failed = match &result {
            Ok(response) => response.is_server_error(),
            Err(_) => true,
        };
        if failed {
            if let Some(entry) = entry.filter(|entry| extend(entry, &route)) {
                log::debug!(
                    "Serving {} ({}) in saint mode as the upstream failed.",
                    primary,
                    secondary
                );
                return Ok(serve(&entry, CACHE_SAINT));
            }
        }

        let response = result?;
        store(&self.cache, &route, &primary, &secondary, response.clone()).await;
        Ok(response.with_header(CACHE_STATUS_HEADER, CACHE_MISS))
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::response::CachedResponse;
    use crate::cache::ttl::MAX_AGE_LIMIT;
    use crate::cache::Cache;
    use crate::middleware::cache::{CacheMiddleware, PURGE_ALL_HEADER};
    use crate::middleware::testing::{chain, ScriptedUpstream};
    use crate::middleware::{Exchange, Middleware, CACHE_STATUS_HEADER};
    use crate::routes::{Route, PURGE_TOKEN_HEADER};
    use hyper::header::{HeaderName, HeaderValue};
    use hyper::Method;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct Setup {
        cache: Arc<Cache>,
        upstream: Arc<ScriptedUpstream>,
        route: Arc<Route>,
    }

    impl Setup {
        fn new(route: Route, upstream: ScriptedUpstream) -> Self {
            Setup {
                cache: Arc::new(Cache::new(1024 * 1024)),
                upstream: Arc::new(upstream),
                route: Arc::new(route),
            }
        }

        fn exchange(&self, method: Method, uri: &str) -> Exchange {
            Exchange::new(method, uri.parse().unwrap(), self.route.clone())
        }

        async fn get(&self, uri: &str) -> anyhow::Result<CachedResponse> {
            self.run(self.exchange(Method::GET, uri)).await
        }

        async fn run(&self, exchange: Exchange) -> anyhow::Result<CachedResponse> {
            let middleware: Arc<dyn Middleware> = Arc::new(CacheMiddleware::new(self.cache.clone()));
            chain(vec![middleware, self.upstream.clone()])
                .run(exchange)
                .await
        }
    }

    fn route(ttl: Duration, grace: Duration, saint: Duration) -> Route {
        let mut route = Route::new("test", "/", "http://localhost");
        route.ttl = ttl;
        route.grace = grace;
        route.saint = saint;
        route
    }

    fn cache_status(response: &CachedResponse) -> &str {
        response.headers().get(CACHE_STATUS_HEADER).unwrap_or("")
    }

    #[test]
    fn responses_are_cached_per_key() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::from_secs(60), Duration::ZERO, Duration::ZERO),
                ScriptedUpstream::new(CachedResponse::text(200, "content")),
            );

            let response = setup.get("/page?a=1").await.unwrap();
            assert_eq!(cache_status(&response), "MISS");
            let response = setup.get("/page?a=1").await.unwrap();
            assert_eq!(cache_status(&response), "HIT");
            assert_eq!(response.body(), "content");
            assert_eq!(setup.upstream.calls(), 1);

            // Another query is another variant...
            let response = setup.get("/page?a=2").await.unwrap();
            assert_eq!(cache_status(&response), "MISS");
            assert_eq!(setup.upstream.calls(), 2);

            // Only GET requests are cached...
            let response = setup.run(setup.exchange(Method::POST, "/page?a=1")).await.unwrap();
            assert_eq!(cache_status(&response), "");
            assert_eq!(setup.upstream.calls(), 3);

            setup.cache.stop().await;
        });
    }

    #[test]
    fn server_errors_and_private_responses_are_not_cached() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::ZERO, Duration::ZERO, Duration::ZERO),
                ScriptedUpstream::new(CachedResponse::text(200, "uncacheable")),
            );
            setup.upstream.push(Ok(CachedResponse::text(500, "boom")
                .with_header("Cache-Control", "max-age=60")));
            setup.upstream.push(Ok(CachedResponse::text(200, "private")
                .with_header("Cache-Control", "private, max-age=60")));
            setup.upstream.push(Ok(CachedResponse::text(200, "public")
                .with_header("Cache-Control", "public, max-age=60")));

            assert_eq!(setup.get("/a").await.unwrap().status(), 500);
            assert_eq!(setup.get("/a").await.unwrap().body(), "private");
            assert_eq!(setup.get("/a").await.unwrap().body(), "public");
            let response = setup.get("/a").await.unwrap();
            assert_eq!(response.body(), "public");
            assert_eq!(cache_status(&response), "HIT");
            assert_eq!(setup.upstream.calls(), 3);

            setup.cache.stop().await;
        });
    }

    #[test]
    fn stale_entries_are_refreshed_once() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::from_secs(60), Duration::from_secs(60), Duration::ZERO),
                ScriptedUpstream::new(CachedResponse::text(200, "new"))
                    .with_delay(Duration::from_millis(100)),
            );
            let entry = setup
                .cache
                .set("/news", "", CachedResponse::text(200, "old"), Duration::from_secs(60))
                .await
                .unwrap();
            entry.expire(Instant::now());

            let responses = futures::future::join_all((0..10).map(|_| setup.get("/news"))).await;
            for response in responses {
                let response = response.unwrap();
                assert_eq!(cache_status(&response), "STALE");
                assert_eq!(response.body(), "old");
            }

            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(setup.upstream.calls(), 1);
            assert_eq!(setup.cache.downloads().active_leases(), 0);

            let response = setup.get("/news").await.unwrap();
            assert_eq!(cache_status(&response), "HIT");
            assert_eq!(response.body(), "new");

            setup.cache.stop().await;
        });
    }

    #[test]
    fn failing_refresh_keeps_stale_entry() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::from_secs(60), Duration::from_secs(60), Duration::from_secs(30)),
                ScriptedUpstream::new(CachedResponse::text(500, "down")),
            );
            let entry = setup
                .cache
                .set("/news", "", CachedResponse::text(200, "old"), Duration::from_secs(60))
                .await
                .unwrap();
            entry.expire(Instant::now());

            let response = setup.get("/news").await.unwrap();
            assert_eq!(cache_status(&response), "STALE");
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(setup.upstream.calls(), 1);

            // The refresh failed, therefore the entry was kept for the saint period...
            assert!(entry.expires() > Instant::now() + Duration::from_secs(20));
            let response = setup.get("/news").await.unwrap();
            assert_eq!(cache_status(&response), "HIT");
            assert_eq!(response.body(), "old");

            setup.cache.stop().await;
        });
    }

    #[test]
    fn saint_mode_serves_expired_entries() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::from_secs(60), Duration::ZERO, Duration::from_secs(5)),
                ScriptedUpstream::new(CachedResponse::text(502, "unavailable")),
            );
            setup.upstream.push(Err(anyhow::anyhow!("connection refused")));
            let entry = setup
                .cache
                .set("/news", "", CachedResponse::text(200, "old"), Duration::from_secs(60))
                .await
                .unwrap();

            entry.expire(Instant::now());
            let response = setup.get("/news").await.unwrap();
            assert_eq!(cache_status(&response), "SAINT");
            assert_eq!(response.body(), "old");

            entry.expire(Instant::now());
            let response = setup.get("/news").await.unwrap();
            assert_eq!(cache_status(&response), "SAINT");
            assert!(entry.expires() > Instant::now());
            assert_eq!(setup.upstream.calls(), 2);

            // Without an entry, the failure is passed on...
            assert_eq!(setup.get("/other").await.unwrap().status(), 502);

            setup.cache.stop().await;
        });
    }

    #[test]
    fn without_saint_period_failures_are_passed_on() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::from_secs(60), Duration::ZERO, Duration::ZERO),
                ScriptedUpstream::new(CachedResponse::text(503, "unavailable")),
            );
            setup.upstream.push(Err(anyhow::anyhow!("connection refused")));
            let entry = setup
                .cache
                .set("/news", "", CachedResponse::text(200, "old"), Duration::from_secs(60))
                .await
                .unwrap();
            entry.expire(Instant::now());

            assert!(setup.get("/news").await.is_err());
            assert_eq!(setup.get("/news").await.unwrap().status(), 503);

            setup.cache.stop().await;
        });
    }

    #[test]
    fn huge_max_age_is_cached_for_a_limited_period() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::ZERO, Duration::ZERO, Duration::ZERO),
                ScriptedUpstream::new(
                    CachedResponse::text(200, "forever")
                        .with_header("Cache-Control", "max-age=18446744073709551615"),
                ),
            );

            let response = setup.get("/forever").await.unwrap();
            assert_eq!(cache_status(&response), "MISS");
            let response = setup.get("/forever").await.unwrap();
            assert_eq!(cache_status(&response), "HIT");
            assert_eq!(setup.upstream.calls(), 1);

            let entry = setup.cache.get("/forever", "").unwrap();
            assert!(entry.expires() <= Instant::now() + MAX_AGE_LIMIT);

            // A TTL which cannot be represented at all is simply not cached...
            assert!(setup
                .cache
                .set("/never", "", CachedResponse::text(200, "never"), Duration::MAX)
                .await
                .is_none());
            assert!(setup.cache.get("/never", "").is_none());

            setup.cache.stop().await;
        });
    }

    #[test]
    fn refreshes_of_distinct_keys_do_not_share_a_lease() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::from_secs(60), Duration::from_secs(60), Duration::ZERO),
                ScriptedUpstream::new(CachedResponse::text(200, "new"))
                    .with_delay(Duration::from_millis(100)),
            );
            // "/ab" and "/a?b" yield the keys ("/ab", "") and ("/a", "b")...
            for (primary, secondary) in [("/ab", ""), ("/a", "b")] {
                setup
                    .cache
                    .set(primary, secondary, CachedResponse::text(200, "old"), Duration::from_secs(60))
                    .await
                    .unwrap()
                    .expire(Instant::now());
            }

            assert_eq!(cache_status(&setup.get("/ab").await.unwrap()), "STALE");
            assert_eq!(cache_status(&setup.get("/a?b").await.unwrap()), "STALE");
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(setup.upstream.calls(), 2);
            assert_eq!(setup.cache.get("/a", "b").unwrap().response().body(), "new");
            assert_eq!(setup.cache.get("/ab", "").unwrap().response().body(), "new");

            setup.cache.stop().await;
        });
    }

    #[test]
    fn purging_requires_the_token() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::from_secs(60), Duration::ZERO, Duration::ZERO)
                    .with_purge_token("secret"),
                ScriptedUpstream::new(CachedResponse::text(200, "content")),
            );
            let purge = Method::from_bytes(b"PURGE").unwrap();
            let purge_request = |uri: &str, all: bool| {
                let mut exchange = setup.exchange(purge.clone(), uri);
                let _ = exchange.headers.insert(
                    HeaderName::from_bytes(PURGE_TOKEN_HEADER.as_bytes()).unwrap(),
                    HeaderValue::from_static("secret"),
                );
                if all {
                    let _ = exchange.headers.insert(
                        HeaderName::from_bytes(PURGE_ALL_HEADER.as_bytes()).unwrap(),
                        HeaderValue::from_static("true"),
                    );
                }
                exchange
            };

            for uri in ["/page?a=1", "/page?a=2", "/page?a=3"] {
                let _ = setup.get(uri).await.unwrap();
            }
            assert_eq!(setup.cache.len(), 3);

            let response = setup
                .run(setup.exchange(purge.clone(), "/page?a=1"))
                .await
                .unwrap();
            assert_eq!(response.status(), 403);
            assert_eq!(setup.cache.len(), 3);

            let response = setup.run(purge_request("/page?a=1", false)).await.unwrap();
            assert_eq!(response.status(), 200);
            assert!(setup.cache.get("/page", "a=1").is_none());
            assert!(setup.cache.get("/page", "a=2").is_some());

            let response = setup.run(purge_request("/page?a=1", false)).await.unwrap();
            assert_eq!(response.status(), 404);

            let response = setup.run(purge_request("/page", true)).await.unwrap();
            assert_eq!(response.status(), 200);
            assert!(setup.cache.is_empty());

            setup.cache.stop().await;
        });
    }

    #[test]
    fn routes_without_purge_hook_reject_purging() {
        crate::testing::test_async(async {
            let setup = Setup::new(
                route(Duration::from_secs(60), Duration::ZERO, Duration::ZERO),
                ScriptedUpstream::new(CachedResponse::text(200, "content")),
            );
            let exchange = setup.exchange(Method::from_bytes(b"PURGE").unwrap(), "/page");
            assert_eq!(setup.run(exchange).await.unwrap().status(), 403);

            setup.cache.stop().await;
        });
    }
}
