//! Forwards requests to the upstream of their route.
//!
//! This is the last middleware of a chain as it always produces a response. Method, path, query,
//! headers and body are forwarded, except for hop-by-hop headers which only concern a single
//! connection. The whole exchange (including reading the response body) has to complete within
//! the timeout of the route, otherwise an error is reported.
//!
//! An upstream marks a template by sending `X-Hydrate: true`. Such a body is split into literal
//! fragments and references (written as `<hydrate src="/path"/>`) which are later expanded by
//! the [hydrate](crate::middleware::hydrate) middleware.
use crate::cache::response::{CachedResponse, Fragment, Headers};
use crate::middleware::{Exchange, Middleware, Next};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::HeaderName;
use hyper::{Body, Client, HeaderMap, Request};
use hyper_tls::HttpsConnector;

/// Contains the name of the header which marks a template response.
pub const HYDRATE_HEADER: &str = "X-Hydrate";

/// Lists the headers which are never forwarded in either direction.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Represents the HTTP client shared by all upstream middlewares.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Creates a client which supports **http** and **https** upstreams.
pub fn new_client() -> HttpClient {
    Client::builder().build::<_, Body>(HttpsConnector::new())
}

fn is_forwarded(name: &HeaderName) -> bool {
    !HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Splits a template into its literal fragments and references.
///
/// # Examples
///
/// ```
/// # use mercury::middleware::upstream::parse_template;
/// # use mercury::cache::response::Fragment;
/// let fragments = parse_template("<p><hydrate src=\"/a\"/></p>".into());
/// assert_eq!(fragments, vec![
///     Fragment::Literal("<p>".into()),
///     Fragment::Reference("/a".to_owned()),
///     Fragment::Literal("</p>".into()),
/// ]);
/// ```
pub fn parse_template(body: Bytes) -> Vec<Fragment> {
    lazy_static::lazy_static! {
        static ref REFERENCE: regex::bytes::Regex =
            regex::bytes::Regex::new(r#"<hydrate\s+src\s*=\s*"([^"]*)"\s*/>"#).unwrap();
    }

    let mut fragments = Vec::new();
    let mut position = 0;
    for captures in REFERENCE.captures_iter(&body) {
        let (whole, path) = match (captures.get(0), captures.get(1)) {
            (Some(whole), Some(path)) => (whole, path),
            _ => continue,
        };
        if whole.start() > position {
            fragments.push(Fragment::Literal(body.slice(position..whole.start())));
        }
        fragments.push(Fragment::Reference(
            String::from_utf8_lossy(path.as_bytes()).into_owned(),
        ));
        position = whole.end();
    }
    if position < body.len() {
        fragments.push(Fragment::Literal(body.slice(position..)));
    }

    fragments
}

fn forwarded_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| is_forwarded(name))
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Sends each request to the upstream of its route.
pub struct UpstreamMiddleware {
    client: HttpClient,
}

impl UpstreamMiddleware {
    /// Creates a middleware which uses the given client.
    pub fn new(client: HttpClient) -> Self {
        UpstreamMiddleware { client }
    }

    async fn forward(&self, exchange: &Exchange) -> anyhow::Result<CachedResponse> {
        let url = format!(
            "{}{}",
            exchange.route.upstream,
            exchange
                .uri
                .path_and_query()
                .map(|path_and_query| path_and_query.as_str())
                .unwrap_or("/")
        );

        let mut request = Request::builder()
            .method(exchange.method.clone())
            .uri(url.as_str())
            .body(Body::from(exchange.body.clone()))
            .with_context(|| format!("Failed to build a request for {}", url))?;
        for (name, value) in exchange.headers.iter().filter(|(name, _)| is_forwarded(name)) {
            let _ = request.headers_mut().append(name.clone(), value.clone());
        }

        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("Failed to contact {}", url))?;
        let (parts, body) = response.into_parts();
        let body = hyper::body::to_bytes(body)
            .await
            .with_context(|| format!("Failed to read the response of {}", url))?;

        let status = parts.status.as_u16();
        let headers = forwarded_headers(&parts.headers);
        let is_template = parts
            .headers
            .get(HYDRATE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if is_template {
            Ok(CachedResponse::hydrate(status, headers, parse_template(body)))
        } else {
            Ok(CachedResponse::plain(status, headers, body))
        }
    }
}

#[async_trait]
impl Middleware for UpstreamMiddleware {
    fn name(&self) -> &'static str {
        "upstream"
    }

    async fn handle(&self, exchange: Exchange, _next: Next) -> anyhow::Result<CachedResponse> {
        log::debug!(
            "Forwarding {} {} to {}...",
            exchange.method,
            exchange.uri,
            exchange.route.upstream
        );

        match tokio::time::timeout(exchange.route.timeout, self.forward(&exchange)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "The upstream {} didn't respond within {}.",
                exchange.route.upstream,
                crate::fmt::format_duration(exchange.route.timeout)
            )),
        }
    }
}
