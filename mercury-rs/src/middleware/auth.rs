//! Rejects requests which don't carry one of the bearer tokens of their route.
//!
//! Routes without tokens are public and pass through untouched.
use crate::cache::response::CachedResponse;
use crate::middleware::{Exchange, Middleware, Next};
use async_trait::async_trait;

/// Checks the **Authorization** header against the tokens of the route.
pub struct AuthMiddleware;

impl AuthMiddleware {
    fn is_authorized(exchange: &Exchange) -> bool {
        let tokens = &exchange.route.tokens;
        if tokens.is_empty() {
            return true;
        }

        exchange
            .header(hyper::header::AUTHORIZATION.as_str())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .map(|token| tokens.iter().any(|candidate| candidate == token))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn handle(&self, exchange: Exchange, next: Next) -> anyhow::Result<CachedResponse> {
        if Self::is_authorized(&exchange) {
            next.run(exchange).await
        } else {
            log::debug!(
                "Rejecting unauthorized request for {} (route '{}').",
                exchange.uri,
                exchange.route.name
            );
            Ok(CachedResponse::text(401, "Unauthorized")
                .with_header("WWW-Authenticate", "Bearer"))
        }
    }
}
