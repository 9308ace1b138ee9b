//! Describes the routes served by the gateway.
//!
//! A route is selected by the longest path prefix which matches the request path. It determines
//! the upstream to forward requests to, the middlewares to run and how responses are cached.
//! Routes are read from the **routes** list of the config:
//!
//! ```yaml
//! routes:
//!     - name: products
//!       path: /api/products
//!       upstream: http://127.0.0.1:9000
//!       timeout: 10s
//!       ttl: 60s
//!       grace: 30s
//!       saint: 5s
//!       key: path_and_query
//!       tokens: [secret-a]
//!       purge_token: purge-secret
//!       middlewares: [stats, auth, hydrate, cache, upstream]
//! ```
use crate::config::{as_duration, query};
use crate::middleware::Exchange;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use yaml_rust::Yaml;

/// Contains the name of the header which carries the token required to purge cache entries.
pub const PURGE_TOKEN_HEADER: &str = "X-Purge-Token";

/// Contains the middlewares used by a route which doesn't specify any.
pub const DEFAULT_MIDDLEWARES: [&str; 5] = ["stats", "auth", "hydrate", "cache", "upstream"];

/// Contains the timeout used for upstream requests unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Computes the primary and secondary cache key of an exchange.
pub type KeyFunction = dyn Fn(&Exchange) -> (String, String) + Send + Sync;

/// Decides whether an exchange may purge cache entries.
pub type PurgeHook = dyn Fn(&Exchange) -> bool + Send + Sync;

/// Determines how the cache key of a request is computed.
#[derive(Clone)]
pub enum KeyLookup {
    /// Uses the path as primary key and an empty secondary key.
    Path,
    /// Uses the path as primary key and the query string as secondary key.
    PathAndQuery,
    /// Uses the path as primary key and the query string along with the value of the given header
    /// as secondary key.
    Header(String),
    /// Uses a custom function to compute both keys.
    Custom(Arc<KeyFunction>),
}

impl KeyLookup {
    /// Parses the textual representation used in the config.
    ///
    /// Accepts **path**, **path_and_query** and **header:NAME**.
    pub fn parse(value: &str) -> anyhow::Result<KeyLookup> {
        match value {
            "path" => Ok(KeyLookup::Path),
            "path_and_query" => Ok(KeyLookup::PathAndQuery),
            _ => match value.strip_prefix("header:").map(str::trim) {
                Some(name) if !name.is_empty() => Ok(KeyLookup::Header(name.to_owned())),
                _ => Err(anyhow::anyhow!(
                    "Unknown key lookup '{}'. Use 'path', 'path_and_query' or 'header:<name>'.",
                    value
                )),
            },
        }
    }

    /// Computes the primary and secondary key of the given exchange.
    pub fn keys(&self, exchange: &Exchange) -> (String, String) {
        let path = exchange.uri.path().to_owned();
        let query = exchange.uri.query().unwrap_or("");
        match self {
            KeyLookup::Path => (path, String::new()),
            KeyLookup::PathAndQuery => (path, query.to_owned()),
            KeyLookup::Header(name) => {
                let value = exchange
                    .headers
                    .get(name.as_str())
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("");
                (path, format!("{}|{}", query, value))
            }
            KeyLookup::Custom(function) => function(exchange),
        }
    }
}

impl fmt::Debug for KeyLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyLookup::Path => write!(f, "path"),
            KeyLookup::PathAndQuery => write!(f, "path_and_query"),
            KeyLookup::Header(name) => write!(f, "header:{}", name),
            KeyLookup::Custom(_) => write!(f, "custom"),
        }
    }
}

/// Describes a single route.
#[derive(Clone)]
pub struct Route {
    /// The unique name of the route.
    pub name: String,
    /// The path prefix handled by this route.
    pub prefix: String,
    /// The base URL of the upstream (e.g. **http://127.0.0.1:9000**).
    pub upstream: String,
    /// The maximal duration of an upstream request.
    pub timeout: Duration,
    /// The TTL of successful responses. If zero, the **Cache-Control** header of the response
    /// decides.
    pub ttl: Duration,
    /// The period after expiry in which a stale response is still served while it is refreshed.
    pub grace: Duration,
    /// The period by which the expiry of a stale response is extended once the upstream fails.
    /// Zero disables this behaviour.
    pub saint: Duration,
    /// Determines the cache key of a request.
    pub key: KeyLookup,
    /// The bearer tokens accepted by the **auth** middleware. If empty, no authentication is
    /// required.
    pub tokens: Vec<String>,
    /// Decides if a **PURGE** request is permitted. If absent, purging is not possible.
    pub purge: Option<Arc<PurgeHook>>,
    /// The names of the middlewares to run (in order).
    pub middlewares: Vec<String>,
}

impl Route {
    /// Creates a route with default settings which forwards the given prefix to the given
    /// upstream.
    pub fn new(name: &str, prefix: &str, upstream: &str) -> Self {
        Route {
            name: name.to_owned(),
            prefix: prefix.to_owned(),
            upstream: upstream.trim_end_matches('/').to_owned(),
            timeout: DEFAULT_TIMEOUT,
            ttl: Duration::ZERO,
            grace: Duration::ZERO,
            saint: Duration::ZERO,
            key: KeyLookup::PathAndQuery,
            tokens: Vec::new(),
            purge: None,
            middlewares: DEFAULT_MIDDLEWARES.iter().map(|name| name.to_string()).collect(),
        }
    }

    /// Permits purging if the request carries the given token in the **X-Purge-Token** header.
    pub fn with_purge_token(mut self, token: &str) -> Self {
        let token = token.to_owned();
        self.purge = Some(Arc::new(move |exchange: &Exchange| {
            exchange
                .headers
                .get(PURGE_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value == token)
                .unwrap_or(false)
        }));

        self
    }

    /// Determines if this route handles the given path.
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.trim_end_matches('/')) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Reads a route from its config element.
    pub fn from_yaml(element: &Yaml) -> anyhow::Result<Route> {
        let name = query(element, "name")
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("A route requires a 'name'."))?;
        let context = |error: anyhow::Error| anyhow::anyhow!("Route '{}': {:#}", name, error);

        let prefix = query(element, "path").as_str().unwrap_or("/");
        if !prefix.starts_with('/') {
            return Err(context(anyhow::anyhow!(
                "The path '{}' has to start with '/'.",
                prefix
            )));
        }

        let upstream = query(element, "upstream")
            .as_str()
            .ok_or_else(|| context(anyhow::anyhow!("An 'upstream' is required.")))?;
        if !upstream.starts_with("http://") && !upstream.starts_with("https://") {
            return Err(context(anyhow::anyhow!(
                "The upstream '{}' has to be an http or https URL.",
                upstream
            )));
        }

        let mut route = Route::new(name, prefix, upstream);
        route.timeout = as_duration(query(element, "timeout"), DEFAULT_TIMEOUT).map_err(context)?;
        route.ttl = as_duration(query(element, "ttl"), Duration::ZERO).map_err(context)?;
        route.grace = as_duration(query(element, "grace"), Duration::ZERO).map_err(context)?;
        route.saint = as_duration(query(element, "saint"), Duration::ZERO).map_err(context)?;

        if let Some(key) = query(element, "key").as_str() {
            route.key = KeyLookup::parse(key).map_err(context)?;
        }

        route.tokens = string_list(query(element, "tokens")).map_err(context)?;
        if let Some(token) = query(element, "purge_token").as_str() {
            route = route.with_purge_token(token);
        }

        let middlewares = string_list(query(element, "middlewares")).map_err(context)?;
        if !middlewares.is_empty() {
            route.middlewares = middlewares;
        }

        Ok(route)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("upstream", &self.upstream)
            .field("key", &self.key)
            .field("middlewares", &self.middlewares)
            .finish()
    }
}

fn string_list(element: &Yaml) -> anyhow::Result<Vec<String>> {
    match element {
        Yaml::BadValue | Yaml::Null => Ok(Vec::new()),
        Yaml::String(value) => Ok(vec![value.clone()]),
        Yaml::Array(values) => values
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow::anyhow!("Expected a list of strings."))
            })
            .collect(),
        _ => Err(anyhow::anyhow!("Expected a list of strings.")),
    }
}

/// Reads all routes from the given config element.
///
/// Fails if any route is invalid or if a route name is used twice.
pub fn parse_routes(element: &Yaml) -> anyhow::Result<Vec<Route>> {
    let elements = match element {
        Yaml::BadValue | Yaml::Null => return Ok(Vec::new()),
        Yaml::Array(elements) => elements,
        _ => return Err(anyhow::anyhow!("'routes' has to be a list.")),
    };

    let mut routes: Vec<Route> = Vec::with_capacity(elements.len());
    for element in elements {
        let route = Route::from_yaml(element)?;
        if routes.iter().any(|other| other.name == route.name) {
            return Err(anyhow::anyhow!(
                "The route name '{}' is used more than once.",
                route.name
            ));
        }
        routes.push(route);
    }

    Ok(routes)
}

/// Selects the route with the longest prefix matching the given path.
pub fn select<'a, R: AsRef<Route>>(routes: &'a [R], path: &str) -> Option<&'a R> {
    routes
        .iter()
        .filter(|route| route.as_ref().matches(path))
        .max_by_key(|route| route.as_ref().prefix.len())
}

impl AsRef<Route> for Route {
    fn as_ref(&self) -> &Route {
        self
    }
}
