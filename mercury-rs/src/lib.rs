//! Mercury is an HTTP gateway which shields its upstreams by a size constrained response cache.
//!
//! # Introduction
//! **Mercury** accepts HTTP requests, selects a route by the longest matching path prefix and
//! runs the middleware chain of that route. The chain authenticates requests, serves and stores
//! responses in the cache, expands template responses and finally forwards requests to the
//! upstream of the route.
//!
//! The cache is the heart of the gateway. It is bounded by the memory it may occupy and evicts
//! the least recently used entries once full. Stale entries are still served for a grace period
//! while a single background task refreshes them, so that a popular resource never causes a
//! thundering herd on its upstream. If an upstream fails, stale entries can be kept alive for a
//! "saint" period. The cache can be written to disk and re-loaded on startup so that a restarted
//! gateway doesn't start cold.
//!
//! # Features
//! * **100% Async/Await** - the gateway builds upon [tokio](https://tokio.rs/) and
//!   [hyper](https://hyper.rs/). The eviction order of the cache is maintained by a single actor,
//!   so that lookups never wait for anything but a shard lock.
//! * **Reload-aware config facility** which permits to update routes, the cache size and even
//!   the server address during operation. An invalid config never replaces a working one.
//! * **Statistics** per route are reported via `GET /_mercury/stats`.
//!
//! # Modules
//! * **Cache**: the size constrained response cache, see [cache].
//! * **Routes** and **Middlewares**: see [routes] and [middleware].
//! * **Runtime**: binds routes to their chains and handles config reloads, see [runtime].
//! * **Server**: the HTTP server, see [server].
//!
//! # Examples
//! A short example on how to initialize the library can be found here [Builder](builder::Builder).
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod cache;
pub mod config;
pub mod fmt;
pub mod middleware;
pub mod platform;
pub mod routes;
pub mod runtime;
pub mod server;
pub mod signals;
pub mod stats;

/// Contains the version of the Mercury library.
pub const MERCURY_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Mercury build being used.
pub const MERCURY_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// gateway, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Integration tests might initialize the logging system several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate mercury;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
