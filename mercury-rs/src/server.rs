//! Contains the HTTP server of the gateway.
//!
//! Opens a server socket on the specified port (**server.port** in the config or 8080 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). Each request is handed to the [Gateway] which selects the route and runs its
//! middleware chain. If the chain fails, **502 Bad Gateway** is returned.
//!
//! `GET /_mercury/stats` is answered by the server itself and reports the figures of the cache
//! along with the statistics of each route as JSON.
//!
//! The server periodically tries to bind its socket, therefore a new instance can be started
//! while an old one is still running and the port is handed over once the old instance exits.
//! Also, the server listens to config changes and moves to another address if necessary. Once
//! the platform is terminated, the server stops accepting connections and completes all running
//! requests.
//!
//! # Example
//!
//! ```no_run
//! use mercury::builder::Builder;
//! use mercury::config::Config;
//! use mercury::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Specify a minimal config so that we run on a different port than a
//!     // production instance.
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1503
//!     ", None).unwrap();
//!
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use crate::cache::response::CachedResponse;
use crate::config::{ChangeNotifier, Config};
use crate::platform::Platform;
use crate::runtime::Gateway;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

/// Contains the path of the statistics endpoint.
pub const STATS_PATH: &str = "/_mercury/stats";

/// Contains the port used if none is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// Specifies the interval in which binding the server socket is retried.
const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Limits how often a failed bind attempt is logged.
const BIND_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Lists the response headers which are determined by the server itself.
const SERVER_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Represents the HTTP server of the gateway.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done manually
    /// via [event_loop](Server::event_loop) as it is most probably done in the main thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Determines if the server should keep its current socket.
    ///
    /// This is toggled to false once the address changed, so that the event loop re-creates the
    /// socket.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the address the server socket is currently bound to.
    pub fn current_address(&self) -> Option<String> {
        self.current_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current_address(&self, address: Option<String>) {
        *self
            .current_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = address;
    }

    /// Determines the server address based on the current configuration.
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.query("server.host").as_str().unwrap_or("0.0.0.0"),
                    handle
                        .query("server.port")
                        .as_i64()
                        .and_then(|port| u16::try_from(port).ok())
                        .filter(|port| *port > 0)
                        .unwrap_or(DEFAULT_PORT)
                )
            })
            .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_PORT))
    }

    /// Starts the event loop in a separate task.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main
    /// thread.
    pub fn fork(server: &Arc<Server>) {
        let server = server.clone();
        crate::spawn!(async move {
            server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate task and waits until the socket is bound.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.current_address().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tries to open the server socket and serves requests until the platform is terminated.
    ///
    /// If the socket cannot be bound, this is retried every 500ms. If the configured address
    /// changes, the socket is closed and re-opened for the new address.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported: Option<Instant> = None;

        while self.platform.is_running() {
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            match Server::bind(&address).await {
                Ok(builder) => {
                    log::info!("Opened server socket on {}...", &address);
                    self.set_current_address(Some(address.clone()));
                    self.serve(builder, &address).await;
                    self.set_current_address(None);
                    log::info!("Closed server socket on {}.", &address);
                }
                Err(error) => {
                    if last_bind_error_reported
                        .map(|reported| reported.elapsed() > BIND_ERROR_LOG_INTERVAL)
                        .unwrap_or(true)
                    {
                        log::error!(
                            "Cannot open server address {}: {:#}. Retrying every 500ms...",
                            &address,
                            error
                        );
                        last_bind_error_reported = Some(Instant::now());
                    }
                    tokio::time::sleep(BIND_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn bind(
        address: &str,
    ) -> anyhow::Result<hyper::server::Builder<hyper::server::conn::AddrIncoming>> {
        let socket_address: SocketAddr = tokio::net::lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Cannot resolve {}", address))?;

        Ok(hyper::Server::try_bind(&socket_address)?)
    }

    /// Serves requests until either the platform is terminated or the address changed.
    async fn serve(
        &self,
        builder: hyper::server::Builder<hyper::server::conn::AddrIncoming>,
        address: &str,
    ) {
        let platform = self.platform.clone();
        let make_service = make_service_fn(move |_connection| {
            let platform = platform.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    handle_request(platform.clone(), request)
                }))
            }
        });

        let notifier = self.platform.find::<Config>().map(|config| config.notifier());
        let server = builder
            .serve(make_service)
            .with_graceful_shutdown(self.await_shutdown(notifier, address));

        if let Err(error) = server.await {
            log::error!("The server on {} failed: {}", address, error);
        }
    }

    /// Completes once the platform is terminated or the configured address changed.
    async fn await_shutdown(&self, mut notifier: Option<ChangeNotifier>, address: &str) {
        loop {
            tokio::select! {
                _ = self.platform.terminated() => return,
                changed = next_change(&mut notifier) => {
                    if matches!(changed, Err(RecvError::Closed)) {
                        notifier = None;
                    } else if self.address() != address {
                        log::info!("Server address has changed. Restarting server socket...");
                        self.running.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }
}

async fn next_change(notifier: &mut Option<ChangeNotifier>) -> Result<(), RecvError> {
    match notifier {
        Some(notifier) => notifier.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_request(
    platform: Arc<Platform>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let gateway = match platform.find::<Gateway>() {
        Some(gateway) => gateway,
        None => {
            return Ok(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "The gateway is not available.",
            ))
        }
    };

    if request.method() == Method::GET && request.uri().path() == STATS_PATH {
        return Ok(stats_response(&gateway).await);
    }

    let (parts, body) = request.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(error) => {
            log::debug!("Failed to read a request body: {}", error);
            return Ok(error_response(StatusCode::BAD_REQUEST, "Cannot read the request body."));
        }
    };

    let uri = parts.uri.clone();
    match gateway.dispatch(Request::from_parts(parts, body), 0).await {
        Ok(response) => Ok(into_http_response(response)),
        Err(error) => {
            log::warn!("Failed to handle {}: {:#}", uri, error);
            Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
        }
    }
}

async fn stats_response(gateway: &Gateway) -> Response<Body> {
    let cache = gateway.cache();
    let (size, max_size, entries) = match cache.stats().await {
        Ok(stats) => (stats.size, stats.max_size, stats.entries),
        Err(_) => (cache.size(), cache.get_size(), cache.len()),
    };

    let stats = serde_json::json!({
        "cache": {
            "size": size,
            "max_size": max_size,
            "entries": entries,
            "refreshes": cache.downloads().active_leases(),
        },
        "routes": gateway.statistics().to_json(),
    });

    let mut response = Response::new(Body::from(stats.to_string()));
    let _ = response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );

    response
}

fn into_http_response(response: CachedResponse) -> Response<Body> {
    let mut builder = Response::builder().status(response.status());
    for (name, value) in response.headers().iter() {
        if !SERVER_HEADERS
            .iter()
            .any(|header| header.eq_ignore_ascii_case(name))
        {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from(response.body()))
        .unwrap_or_else(|error| {
            log::warn!("Cannot deliver a response: {}", error);
            error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        })
}

fn error_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;

    response
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::config::Config;
    use crate::server::{Server, STATS_PATH};
    use hyper::{Body, Client, Request};
    use std::time::Duration;

    async fn query(path: &str) -> (u16, String) {
        let client = Client::new();
        let response = client
            .request(
                Request::get(format!("http://127.0.0.1:7982{}", path))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();

        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[test]
    fn requests_are_served() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        crate::testing::test_async(async {
            let platform = Builder::new()
                .enable_config()
                .enable_gateway()
                .enable_server()
                .build()
                .await;
            platform
                .require::<Config>()
                .load_from_string(
                    "
server:
    port: 7982
routes:
    - name: dead
      path: /dead
      upstream: http://127.0.0.1:1
      timeout: 1s
",
                    None,
                )
                .unwrap();

            // Give the gateway a moment to pick up the routes...
            tokio::time::sleep(Duration::from_millis(100)).await;
            Server::fork_and_await(&platform.require::<Server>()).await;

            let (status, _) = query("/unknown").await;
            assert_eq!(status, 404);

            let (status, _) = query("/dead/resource").await;
            assert_eq!(status, 502);

            let (status, body) = query(STATS_PATH).await;
            assert_eq!(status, 200);
            let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert_eq!(stats["routes"]["dead"]["requests"], 1);
            assert_eq!(stats["routes"]["dead"]["errors"], 1);
            assert_eq!(stats["cache"]["entries"], 0);

            platform.terminate();
        });
    }
}
