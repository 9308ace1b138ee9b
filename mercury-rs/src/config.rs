//! Contains the system configuration.
//!
//! The configuration is loaded from **config/settings.yml**. The file is observed for changes and
//! reloaded once its modification date changes (a **SIGHUP** forces a reload as well, see
//! [signals](crate::signals)). Each component which depends on the config should therefore
//! attach itself to the [Config::notifier](Config::notifier) and re-process the config once a
//! change message is received. The gateway uses this to swap its routes and to resize its cache
//! without a restart.
//!
//! Note that a [Handle] obtained via [Config::current](Config::current) represents the config at
//! the time it was obtained and should therefore not be kept around.
//!
//! # Examples
//!
//! ```
//! # use mercury::config::Config;
//! let config = Config::new("settings.yml");
//! config.load_from_string("
//! server:
//!     port: 8081
//! cache:
//!     max_memory: 64m
//! ", None).unwrap();
//!
//! let handle = config.current();
//! assert_eq!(handle.query("server.port").as_i64(), Some(8081));
//! assert_eq!(handle.query("server.host").as_str(), None);
//! assert_eq!(mercury::config::as_size(handle.query("cache.max_memory"), 0).unwrap(), 64 * 1024 * 1024);
//! ```
use crate::platform::Platform;
use anyhow::Context;
use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use yaml_rust::{Yaml, YamlLoader};

/// Contains the path of the config file being loaded by [install].
pub const SETTINGS_FILE: &str = "config/settings.yml";

lazy_static::lazy_static! {
    static ref BAD_VALUE: Yaml = Yaml::BadValue;
}

/// Provides access to the system configuration.
///
/// A config is installed by the [Builder](crate::builder::Builder) and can be obtained via
/// `platform.require::<Config>()`.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// The message itself carries no information. Once it is received, the config has changed and
/// needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new and empty config which reads the given file when loaded.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Hash(Default::default()), None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file.
    ///
    /// A mounted docker volume which is absent shows up as directory, therefore we only accept
    /// regular files.
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|metadata| metadata.is_file())
            .and_then(|metadata| metadata.modified().ok())
    }

    /// Reads the underlying file.
    ///
    /// A missing file is not considered an error, the current config is simply kept. A file
    /// which cannot be parsed is reported as error and the current config is kept as well.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        let last_modified = match self.last_modified().await {
            Some(last_modified) => last_modified,
            None => {
                log::info!(
                    "Config file {} doesn't exist or isn't a file - skipping config load.",
                    &self.filename
                );
                return Ok(());
            }
        };

        let data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        self.load_from_string(&data, Some(last_modified))
    }

    /// Parses the given string and installs it as current config.
    ///
    /// All listeners are notified about the change. If the data cannot be parsed, an error is
    /// returned and the current config is kept.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = YamlLoader::load_from_str(data)
            .with_context(|| format!("Cannot parse config file {}", &self.filename))?;

        let doc = match docs.into_iter().next() {
            Some(doc @ Yaml::Hash(_)) => doc,
            Some(Yaml::Null) | None => Yaml::Hash(Default::default()),
            Some(_) => {
                return Err(anyhow::anyhow!(
                    "Cannot use config file {}: Expected an object as root element.",
                    &self.filename
                ))
            }
        };

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the root of the currently loaded configuration.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a dot separated path like **cache.snapshot.file**.
    ///
    /// Returns **Yaml::BadValue** if any part of the path is missing.
    pub fn query(&self, path: &str) -> &Yaml {
        query(self.config(), path)
    }
}

/// Resolves a dot separated path within the given element.
///
/// Returns **Yaml::BadValue** if any part of the path is missing.
pub fn query<'a>(element: &'a Yaml, path: &str) -> &'a Yaml {
    path.split('.')
        .filter(|key| !key.is_empty())
        .try_fold(element, |current, key| match current {
            Yaml::Hash(map) => map.get(&Yaml::String(key.to_owned())),
            _ => None,
        })
        .unwrap_or(&*BAD_VALUE)
}

/// Reads a duration which is either given as string (**30s**) or as number of milliseconds.
///
/// Returns the given default if the value is absent.
pub fn as_duration(value: &Yaml, default: Duration) -> anyhow::Result<Duration> {
    match value {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(millis) if *millis >= 0 => Ok(Duration::from_millis(*millis as u64)),
        Yaml::String(value) => crate::fmt::parse_duration(value),
        other => Err(anyhow::anyhow!("Expected a duration but got {:?}", other)),
    }
}

/// Reads a size which is either given as string (**512m**) or as number of bytes.
///
/// Returns the given default if the value is absent.
pub fn as_size(value: &Yaml, default: usize) -> anyhow::Result<usize> {
    match value {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(bytes) => usize::try_from(*bytes)
            .map_err(|_| anyhow::anyhow!("Expected a positive size but got {}", bytes)),
        Yaml::String(value) => crate::fmt::parse_size(value),
        other => Err(anyhow::anyhow!("Expected a size but got {:?}", other)),
    }
}

/// Creates and installs a **Config** for the given platform.
///
/// This reads [SETTINGS_FILE] and starts a task which checks its modification date every two
/// seconds. Note that only the date is compared, therefore each config user has to cope with
/// partial changes.
///
/// This is called by the [Builder](crate::builder::Builder) unless the config is disabled.
pub async fn install(platform: Arc<Platform>) -> Arc<Config> {
    let path = Path::new(SETTINGS_FILE);
    if let Some(parent) = path.parent() {
        if let Err(error) = tokio::fs::create_dir_all(parent).await {
            log::warn!(
                "Failed to create config directory {}: {}",
                parent.display(),
                error
            );
        }
    }

    let config = Arc::new(Config::new(SETTINGS_FILE));
    platform.register::<Config>(config.clone());

    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(platform, config.clone());

    config
}

#[cfg(test)]
fn run_config_change_monitor(_platform: Arc<Platform>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(platform: Arc<Platform>, config: Arc<Config>) {
    crate::spawn!(async move {
        while platform.is_running() {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {:#}", error),
                }
            }
        }
    });
}
