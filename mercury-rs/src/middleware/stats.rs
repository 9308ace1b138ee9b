//! Records the number of requests, errors, cache hits and the latency of each route.
//!
//! A request counts as cache hit if the cache middleware answered it with `X-Cache: HIT` or
//! `X-Cache: STALE`. A failed chain is recorded as **502** and the error is passed on.
use crate::cache::response::CachedResponse;
use crate::middleware::{Exchange, Middleware, Next, CACHE_HIT, CACHE_STALE, CACHE_STATUS_HEADER};
use crate::stats::Statistics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Updates the [Statistics] for each request passing through.
pub struct StatsMiddleware {
    statistics: Arc<Statistics>,
}

impl StatsMiddleware {
    /// Creates a middleware which records into the given statistics.
    pub fn new(statistics: Arc<Statistics>) -> Self {
        StatsMiddleware { statistics }
    }
}

#[async_trait]
impl Middleware for StatsMiddleware {
    fn name(&self) -> &'static str {
        "stats"
    }

    async fn handle(&self, exchange: Exchange, next: Next) -> anyhow::Result<CachedResponse> {
        let stats = self.statistics.route(&exchange.route.name);
        let watch = Instant::now();
        let result = next.run(exchange).await;

        match &result {
            Ok(response) => {
                let hit = matches!(
                    response.headers().get(CACHE_STATUS_HEADER),
                    Some(CACHE_HIT) | Some(CACHE_STALE)
                );
                stats.record(response.status(), hit, watch.elapsed());
            }
            Err(_) => stats.record(502, false, watch.elapsed()),
        }

        result
    }
}
