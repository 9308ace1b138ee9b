//! Contains the runtime of the gateway: the routes and their middleware chains.
//!
//! A [Runtime] is built from the config and is immutable. Once the config changes, the
//! [Gateway] builds a new runtime and swaps it in via [Runtime::replace_with]. If the new config
//! is invalid, the current runtime keeps serving. The [Cache] and the [Statistics] are owned by
//! the gateway and handed from one runtime to the next, so that a reload neither loses cached
//! responses nor counters.
//!
//! The runtime also owns the snapshot timer which periodically writes the most recently used
//! cache entries into the configured snapshot file. On startup, this file is loaded (if present)
//! and on shutdown a final snapshot is written.
//!
//! The config is read from:
//! ```yaml
//! cache:
//!     max_memory: 512m
//!     snapshot:
//!         file: data/cache.bin
//!         count: 100000
//!         cutoff: 30s
//!         interval: 5m
//! routes:
//!     - name: products
//!       path: /api/products
//!       upstream: http://127.0.0.1:9000
//! ```
use crate::cache::response::CachedResponse;
use crate::cache::Cache;
use crate::config::{as_duration, as_size, Config, Handle};
use crate::middleware::{build_chain, Chain, Exchange, Next, Services};
use crate::platform::Platform;
use crate::routes::{parse_routes, select, Route};
use crate::stats::Statistics;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hyper::Request;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

/// Contains the cache size used if no **cache.max_memory** is configured.
pub const DEFAULT_MAX_MEMORY: usize = 256 * 1024 * 1024;

/// Contains the number of entries written into a snapshot unless configured otherwise.
pub const DEFAULT_SNAPSHOT_COUNT: usize = 100_000;

/// Contains the default period before their expiry in which entries are skipped by a snapshot.
pub const DEFAULT_SNAPSHOT_CUTOFF: Duration = Duration::from_secs(30);

/// Contains the default interval in which snapshots are written.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Describes where and how often snapshots of the cache are written.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotSettings {
    /// The snapshot file. If absent, no snapshots are written nor loaded.
    pub file: Option<PathBuf>,
    /// The maximal number of entries to write.
    pub count: usize,
    /// Entries which expire within this period are skipped.
    pub cutoff: Duration,
    /// The interval of the snapshot timer. Zero disables the timer (the final snapshot on
    /// shutdown is still written).
    pub interval: Duration,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        SnapshotSettings {
            file: None,
            count: DEFAULT_SNAPSHOT_COUNT,
            cutoff: DEFAULT_SNAPSHOT_CUTOFF,
            interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

impl SnapshotSettings {
    fn from_config(handle: &Handle) -> anyhow::Result<Self> {
        let count = match handle.query("cache.snapshot.count").as_i64() {
            Some(count) => usize::try_from(count)
                .map_err(|_| anyhow::anyhow!("Invalid cache.snapshot.count: {}", count))?,
            None => DEFAULT_SNAPSHOT_COUNT,
        };

        Ok(SnapshotSettings {
            file: handle
                .query("cache.snapshot.file")
                .as_str()
                .map(PathBuf::from),
            count,
            cutoff: as_duration(handle.query("cache.snapshot.cutoff"), DEFAULT_SNAPSHOT_CUTOFF)?,
            interval: as_duration(
                handle.query("cache.snapshot.interval"),
                DEFAULT_SNAPSHOT_INTERVAL,
            )?,
        })
    }
}

/// Binds a route to its middleware chain.
pub struct Endpoint {
    route: Arc<Route>,
    chain: Chain,
}

impl Endpoint {
    /// Creates an endpoint for the given route and chain.
    pub fn new(route: Route, chain: Chain) -> Self {
        Endpoint {
            route: Arc::new(route),
            chain,
        }
    }

    /// Returns the route of this endpoint.
    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }
}

impl AsRef<Route> for Endpoint {
    fn as_ref(&self) -> &Route {
        &self.route
    }
}

/// Represents the routes and settings derived from a config.
pub struct Runtime {
    endpoints: Vec<Endpoint>,
    cache: Arc<Cache>,
    max_memory: usize,
    snapshot: SnapshotSettings,
    timer: Mutex<Option<oneshot::Sender<()>>>,
}

impl Runtime {
    /// Creates a runtime for the given endpoints.
    pub fn new(
        endpoints: Vec<Endpoint>,
        cache: Arc<Cache>,
        max_memory: usize,
        snapshot: SnapshotSettings,
    ) -> Self {
        Runtime {
            endpoints,
            cache,
            max_memory,
            snapshot,
            timer: Mutex::new(None),
        }
    }

    /// Builds a runtime based on the given config.
    ///
    /// Fails if any part of the config is invalid.
    pub fn from_config(handle: &Handle, services: &Services) -> anyhow::Result<Self> {
        let max_memory = as_size(handle.query("cache.max_memory"), DEFAULT_MAX_MEMORY)?;
        let snapshot = SnapshotSettings::from_config(handle)?;
        let endpoints = parse_routes(handle.query("routes"))?
            .into_iter()
            .map(|route| {
                let chain = build_chain(&route, services)?;
                Ok(Endpoint::new(route, chain))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Runtime::new(
            endpoints,
            services.cache.clone(),
            max_memory,
            snapshot,
        ))
    }

    /// Returns all endpoints.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Returns the cache used by this runtime.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Returns the configured cache size.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Returns the snapshot settings.
    pub fn snapshot(&self) -> &SnapshotSettings {
        &self.snapshot
    }

    /// Processes the given request by the chain of the matching route.
    ///
    /// Responds with **404** if no route matches.
    pub async fn dispatch(
        &self,
        request: Request<Bytes>,
        depth: usize,
    ) -> anyhow::Result<CachedResponse> {
        let endpoint = match select(&self.endpoints, request.uri().path()) {
            Some(endpoint) => endpoint,
            None => return Ok(CachedResponse::text(404, "Not found")),
        };

        let (parts, body) = request.into_parts();
        let exchange = Exchange {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            route: endpoint.route.clone(),
            depth,
        };

        Next::new(endpoint.chain.clone()).run(exchange).await
    }

    /// Writes a snapshot of the cache if a snapshot file is configured.
    ///
    /// Returns the number of written entries.
    pub async fn save_snapshot(&self) -> anyhow::Result<usize> {
        match &self.snapshot.file {
            Some(file) => {
                self.cache
                    .save(file, self.snapshot.count, self.snapshot.cutoff)
                    .await
            }
            None => Ok(0),
        }
    }

    /// Loads the configured snapshot file into the cache if it exists.
    ///
    /// Returns the number of loaded entries.
    pub async fn load_snapshot(&self) -> anyhow::Result<usize> {
        match &self.snapshot.file {
            Some(file) if tokio::fs::metadata(file).await.is_ok() => self.cache.load(file).await,
            _ => Ok(0),
        }
    }

    /// Starts the timer which periodically writes snapshots.
    ///
    /// Does nothing if no snapshot file or no interval is configured.
    pub fn start(self: &Arc<Self>) {
        if self.snapshot.file.is_none() || self.snapshot.interval.is_zero() {
            return;
        }

        let (stop, mut stopped) = oneshot::channel();
        if let Some(previous) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(stop)
        {
            let _ = previous.send(());
        }

        let runtime = Arc::downgrade(self);
        let interval = self.snapshot.interval;
        crate::spawn!(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let runtime = match runtime.upgrade() {
                            Some(runtime) => runtime,
                            None => return,
                        };
                        match runtime.save_snapshot().await {
                            Ok(count) => log::info!("Wrote a cache snapshot with {} entries.", count),
                            Err(error) => log::error!("Failed to write a cache snapshot: {:#}", error),
                        }
                    }
                    _ = &mut stopped => return,
                }
            }
        });
    }

    /// Stops the snapshot timer of this runtime.
    pub fn stop(&self) {
        if let Some(stop) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = stop.send(());
        }
    }

    /// Replaces the given runtime by the new one.
    ///
    /// The new runtime takes over the live cache of the old one and applies its cache size. The
    /// timer of the old runtime is stopped and the one of the new runtime is started.
    pub async fn replace_with(old: &Runtime, new: Runtime) -> Arc<Runtime> {
        let new = Arc::new(Runtime {
            cache: old.cache.clone(),
            ..new
        });
        old.stop();

        if new.cache.get_size() != new.max_memory {
            log::info!(
                "Resizing the cache from {} to {}.",
                crate::fmt::format_size(new.cache.get_size()),
                crate::fmt::format_size(new.max_memory)
            );
            new.cache.set_size(new.max_memory).await;
        }
        new.start();

        new
    }
}

/// Provides the gateway which dispatches requests to the current [Runtime].
///
/// The gateway is registered in the [Platform] by [install](Gateway::install) and used by the
/// [Server](crate::server::Server) as well as for expanding templates.
pub struct Gateway {
    services: Services,
    runtime: ArcSwap<Runtime>,
}

impl Gateway {
    /// Creates a gateway which starts with the given runtime.
    pub fn new(services: Services, runtime: Runtime) -> Self {
        let runtime = Arc::new(runtime);
        runtime.start();

        Gateway {
            services,
            runtime: ArcSwap::new(runtime),
        }
    }

    /// Creates and installs a gateway into the given platform.
    ///
    /// The runtime is built from the current config. If the config is invalid, the gateway starts
    /// without any routes until a valid config is provided. The configured snapshot is loaded and
    /// the gateway starts to listen for config changes.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    pub async fn install(platform: &Arc<Platform>) -> Arc<Gateway> {
        let config = platform.find::<Config>();
        let handle = config.as_ref().map(|config| config.current());
        let max_memory = handle
            .as_ref()
            .map(|handle| as_size(handle.query("cache.max_memory"), DEFAULT_MAX_MEMORY))
            .unwrap_or(Ok(DEFAULT_MAX_MEMORY))
            .unwrap_or(DEFAULT_MAX_MEMORY);

        let services = Services {
            platform: platform.clone(),
            cache: Arc::new(Cache::new(max_memory)),
            statistics: Arc::new(Statistics::default()),
            client: crate::middleware::upstream::new_client(),
        };

        let runtime = match handle
            .as_ref()
            .map(|handle| Runtime::from_config(handle, &services))
        {
            Some(Ok(runtime)) => runtime,
            Some(Err(error)) => {
                log::error!("Cannot set up the gateway: {:#}", error);
                Runtime::new(
                    Vec::new(),
                    services.cache.clone(),
                    max_memory,
                    SnapshotSettings::default(),
                )
            }
            None => Runtime::new(
                Vec::new(),
                services.cache.clone(),
                max_memory,
                SnapshotSettings::default(),
            ),
        };

        match runtime.load_snapshot().await {
            Ok(0) => (),
            Ok(count) => log::info!("Loaded {} entries from the cache snapshot.", count),
            Err(error) => log::error!("Failed to load the cache snapshot: {:#}", error),
        }

        let gateway = Arc::new(Gateway::new(services, runtime));
        platform.register::<Gateway>(gateway.clone());
        log::info!(
            "Gateway is ready with {} route(s) and a cache of {}.",
            gateway.runtime().endpoints().len(),
            crate::fmt::format_size(max_memory)
        );

        if let Some(config) = config {
            Gateway::listen_for_changes(gateway.clone(), platform.clone(), config);
        }

        gateway
    }

    fn listen_for_changes(gateway: Arc<Gateway>, platform: Arc<Platform>, config: Arc<Config>) {
        let mut notifier = config.notifier();
        drop(config);

        crate::spawn!(async move {
            while platform.is_running() {
                match notifier.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if let Some(config) = platform.find::<Config>() {
                            if let Err(error) = gateway.reload(&config.current()).await {
                                log::error!(
                                    "Ignoring the changed config as it is invalid: {:#}",
                                    error
                                );
                            }
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }

    /// Rebuilds the runtime based on the given config.
    ///
    /// If the config is invalid, an error is returned and the current runtime is kept.
    pub async fn reload(&self, handle: &Handle) -> anyhow::Result<()> {
        let runtime = Runtime::from_config(handle, &self.services)?;
        let current = self.runtime.load_full();
        let runtime = Runtime::replace_with(&current, runtime).await;
        self.runtime.store(runtime);
        log::info!(
            "Gateway was reloaded with {} route(s).",
            self.runtime().endpoints().len()
        );

        Ok(())
    }

    /// Returns the current runtime.
    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.load_full()
    }

    /// Returns the cache shared by all runtimes.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.services.cache
    }

    /// Returns the statistics shared by all runtimes.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.services.statistics
    }

    /// Processes the given request using the current runtime.
    ///
    /// The depth counts the nested requests issued while expanding templates and is 0 for
    /// requests received by the server.
    pub async fn dispatch(
        &self,
        request: Request<Bytes>,
        depth: usize,
    ) -> anyhow::Result<CachedResponse> {
        let runtime = self.runtime();
        runtime.dispatch(request, depth).await
    }

    /// Writes the final snapshot and stops the cache.
    pub async fn shutdown(&self) {
        let runtime = self.runtime();
        runtime.stop();
        match runtime.save_snapshot().await {
            Ok(0) => (),
            Ok(count) => log::info!("Wrote a final cache snapshot with {} entries.", count),
            Err(error) => log::error!("Failed to write the final cache snapshot: {:#}", error),
        }

        self.services.cache.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::cache::response::{CachedResponse, Fragment, Headers};
    use crate::config::Config;
    use crate::middleware::hydrate::HydrateMiddleware;
    use crate::middleware::testing::ScriptedUpstream;
    use crate::middleware::Middleware;
    use crate::runtime::{Endpoint, Gateway, Runtime, SnapshotSettings};
    use crate::routes::Route;
    use bytes::Bytes;
    use hyper::Request;
    use std::sync::Arc;
    use std::time::Duration;

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    const CONFIG: &str = "
cache:
    max_memory: 4m
routes:
    - name: api
      path: /api
      upstream: http://127.0.0.1:7980
      ttl: 60s
    - name: products
      path: /api/products
      upstream: http://127.0.0.1:7981
      key: path
      middlewares: [stats, cache, upstream]
";

    #[test]
    fn runtime_is_built_from_config() {
        crate::testing::test_async(async {
            let platform = Builder::new().enable_config().build().await;
            platform
                .require::<Config>()
                .load_from_string(CONFIG, None)
                .unwrap();
            let gateway = Gateway::install(&platform).await;

            let runtime = gateway.runtime();
            assert_eq!(runtime.endpoints().len(), 2);
            assert_eq!(runtime.max_memory(), 4 * 1024 * 1024);
            assert_eq!(gateway.cache().get_size(), 4 * 1024 * 1024);
            assert_eq!(runtime.snapshot(), &SnapshotSettings::default());

            // Unknown paths are answered by the gateway itself...
            let response = gateway.dispatch(get("/unknown"), 0).await.unwrap();
            assert_eq!(response.status(), 404);

            // An invalid config is rejected and the current runtime is kept...
            let config = platform.require::<Config>();
            config
                .load_from_string(
                    "routes:\n    - name: broken\n      upstream: ftp://somewhere\n",
                    None,
                )
                .unwrap();
            assert!(gateway.reload(&config.current()).await.is_err());
            assert_eq!(gateway.runtime().endpoints().len(), 2);

            // A valid config replaces the runtime and resizes the cache...
            config
                .load_from_string(
                    "cache:\n    max_memory: 1m\nroutes:\n    - name: all\n      upstream: http://localhost\n",
                    None,
                )
                .unwrap();
            gateway.reload(&config.current()).await.unwrap();
            assert_eq!(gateway.runtime().endpoints().len(), 1);
            assert_eq!(gateway.runtime().endpoints()[0].route().prefix, "/");
            assert_eq!(gateway.cache().get_size(), 1024 * 1024);

            gateway.shutdown().await;
        });
    }

    #[test]
    fn snapshots_survive_a_restart() {
        crate::testing::test_async(async {
            let dir = tempfile::tempdir().unwrap();
            let file = dir.path().join("snapshots").join("cache.bin");
            let config = format!(
                "cache:\n    snapshot:\n        file: {}\n        cutoff: 0\n",
                file.display()
            );

            {
                let platform = Builder::new().enable_config().build().await;
                platform
                    .require::<Config>()
                    .load_from_string(&config, None)
                    .unwrap();
                let gateway = Gateway::install(&platform).await;
                let _ = gateway
                    .cache()
                    .set("/a", "", CachedResponse::text(200, "A"), Duration::from_secs(60))
                    .await;
                gateway.shutdown().await;
                platform.terminate();
            }

            let platform = Builder::new().enable_config().build().await;
            platform
                .require::<Config>()
                .load_from_string(&config, None)
                .unwrap();
            let gateway = Gateway::install(&platform).await;
            let entry = gateway.cache().get("/a", "").unwrap();
            assert_eq!(entry.response().body(), "A");
            gateway.shutdown().await;
        });
    }

    #[test]
    fn templates_are_expanded_via_the_gateway() {
        crate::testing::test_async(async {
            let platform = Builder::new().build().await;
            let services = crate::middleware::Services {
                platform: platform.clone(),
                cache: Arc::new(crate::cache::Cache::new(1024 * 1024)),
                statistics: Default::default(),
                client: crate::middleware::upstream::new_client(),
            };

            let hydrate: Arc<dyn Middleware> = Arc::new(HydrateMiddleware::new(platform.clone()));
            let page = Arc::new(ScriptedUpstream::new(CachedResponse::hydrate(
                200,
                vec![("X-Hydrate", "true"), ("Content-Length", "99")]
                    .into_iter()
                    .collect::<Headers>(),
                vec![
                    Fragment::Literal("Hello ".into()),
                    Fragment::Reference("/fragments/name".to_owned()),
                    Fragment::Literal("! ".into()),
                    Fragment::Reference("/fragments/missing".to_owned()),
                    Fragment::Reference("/loop".to_owned()),
                ],
            )));
            let name = Arc::new(ScriptedUpstream::new(CachedResponse::text(200, "World")));
            let missing: Arc<dyn Middleware> =
                Arc::new(ScriptedUpstream::new(CachedResponse::text(404, "?")));
            let looping = Arc::new(ScriptedUpstream::new(CachedResponse::hydrate(
                200,
                Headers::new(),
                vec![
                    Fragment::Literal("*".into()),
                    Fragment::Reference("/loop".to_owned()),
                ],
            )));

            let runtime = Runtime::new(
                vec![
                    Endpoint::new(
                        Route::new("page", "/page", "http://localhost"),
                        vec![hydrate.clone(), page.clone()].into(),
                    ),
                    Endpoint::new(
                        Route::new("name", "/fragments/name", "http://localhost"),
                        vec![hydrate.clone(), name.clone()].into(),
                    ),
                    Endpoint::new(
                        Route::new("missing", "/fragments/missing", "http://localhost"),
                        vec![missing].into(),
                    ),
                    Endpoint::new(
                        Route::new("loop", "/loop", "http://localhost"),
                        vec![hydrate.clone(), looping.clone()].into(),
                    ),
                ],
                services.cache.clone(),
                1024 * 1024,
                SnapshotSettings::default(),
            );
            let gateway = Arc::new(Gateway::new(services, runtime));
            platform.register::<Gateway>(gateway.clone());

            let response = gateway.dispatch(get("/page"), 0).await.unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(response.body(), "Hello World! ***");
            assert_eq!(response.headers().get("X-Hydrate"), None);
            assert_eq!(response.headers().get("Content-Length"), None);
            assert_eq!(name.calls(), 1);

            // The loop is expanded on the nested levels 1, 2 and 3 only...
            assert_eq!(looping.calls(), 3);

            gateway.shutdown().await;
            platform.terminate();
        });
    }
}
