//! Provides a builder which can be used to setup and initialize the gateway.
//!
//! The builder creates the central components and registers them in the [Platform]. Each
//! component can be enabled separately, which is mostly useful for tests.
//!
//! # Example
//! Setting up the gateway with all components enabled:
//! ```no_run
//! # use mercury::builder::Builder;
//! # use mercury::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Start the main event loop of the server...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::runtime::Gateway;
use crate::{init_logging, MERCURY_REVISION, MERCURY_VERSION};

/// Initializes the gateway by creating and registering the enabled components.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_gateway: bool,
    setup_server: bool,
}

impl Builder {
    /// Creates a new builder with all components disabled.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all components.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_gateway = true;
        self.setup_server = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// This initializes **simplelog** to log to stdout, which is all that is needed when running
    /// in a docker container.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the platform on **CTRL-C** and reloads the
    /// config on **SIGHUP**.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [Config](crate::config::Config) and loads the **settings.yml**.
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** after [enable_all()](Builder::enable_all) has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Installs the [Gateway] along with its cache.
    ///
    /// This loads the cache snapshot (if configured) and builds the routes from the config.
    pub fn enable_gateway(mut self) -> Self {
        self.setup_gateway = true;
        self
    }

    /// Disables setting up the **Gateway** after [enable_all()](Builder::enable_all) has been
    /// used.
    pub fn disable_gateway(mut self) -> Self {
        self.setup_gateway = false;
        self
    }

    /// Creates and installs a [Server](crate::server::Server).
    ///
    /// Note that the event loop still has to be started via
    /// `platform.require::<Server>().event_loop().await`.
    pub fn enable_server(mut self) -> Self {
        self.setup_server = true;
        self
    }

    /// Disables setting up the **Server** after [enable_all()](Builder::enable_all) has been
    /// used.
    pub fn disable_server(mut self) -> Self {
        self.setup_server = false;
        self
    }

    /// Builds the [Platform] with all enabled components being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. MERCURY (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            MERCURY_VERSION,
            MERCURY_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            let _ = crate::config::install(platform.clone()).await;
        }

        if self.setup_gateway {
            let _ = Gateway::install(&platform).await;
        }

        if self.setup_server {
            let _ = crate::server::Server::install(&platform);
        }

        platform
    }
}
