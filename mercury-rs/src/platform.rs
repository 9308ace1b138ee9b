//! Provides a tiny registry which keeps all central components of the gateway.
//!
//! The platform is a map from types to **Arc<T>** instances. Components like the
//! [Config](crate::config::Config), the [Gateway](crate::runtime::Gateway) or the
//! [Server](crate::server::Server) register themselves here during startup, so that other
//! components can look them up without passing all of them around.
//!
//! The platform also carries the central **is_running** flag. Once
//! [Platform::terminate](Platform::terminate) is invoked, the registry is cleared and all tasks
//! which wait in [Platform::terminated](Platform::terminated) are woken up. Therefore,
//! [Platform::require](Platform::require) should only be used during startup. Everything which
//! might run during a shutdown should use [Platform::find](Platform::find) and handle **None**.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use mercury::platform::Platform;
//! struct Upstream {
//!     url: String,
//! }
//!
//! let platform = Platform::new();
//! platform.register::<Upstream>(Arc::new(Upstream { url: "http://localhost:9000".to_owned() }));
//! assert_eq!(platform.require::<Upstream>().url, "http://localhost:9000");
//!
//! platform.terminate();
//! assert_eq!(platform.find::<Upstream>().is_none(), true);
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

type Services = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Provides a container to keep all central services in a single place.
pub struct Platform {
    services: Mutex<Services>,
    is_running: AtomicBool,
    terminated: watch::Sender<bool>,
}

impl Platform {
    /// Creates a new and running platform.
    pub fn new() -> Arc<Self> {
        let (terminated, _) = watch::channel(false);
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
            terminated,
        })
    }

    fn services(&self) -> MutexGuard<'_, Services> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a component. A previously registered component of the same type is replaced.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self.services().insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered component.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.services()
            .get(&TypeId::of::<T>())
            .and_then(|service| service.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered component.
    ///
    /// # Panics
    /// Panics if the component isn't available, which is also the case once the platform has
    /// been terminated.
    ///
    /// ```should_panic
    /// # use mercury::platform::Platform;
    /// struct Unknown;
    ///
    /// let _ = Platform::new().require::<Unknown>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        match self.find::<T>() {
            Some(service) => service,
            None if self.is_running() => panic!(
                "A required component ({}) was not available in the platform registry!",
                std::any::type_name::<T>()
            ),
            None => panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Determines if [Platform::terminate](Platform::terminate) has not been called yet.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform.
    ///
    /// All components are released and all tasks waiting for the termination are woken up.
    pub fn terminate(&self) {
        // Services are dropped outside of the lock, as their drop handlers might access the
        // platform themselves...
        let services = std::mem::take(&mut *self.services());
        drop(services);

        self.is_running.store(false, Ordering::Release);
        let _ = self.terminated.send_replace(true);
    }

    /// Waits until the platform is terminated.
    ///
    /// Returns immediately if the platform has already been terminated.
    pub async fn terminated(&self) {
        let mut receiver = self.terminated.subscribe();
        // An error can only occur if the sender is gone, which means that we're shutting down...
        let _ = receiver.wait_for(|terminated| *terminated).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::platform::Platform;
    use std::sync::Arc;
    use std::time::Duration;

    struct Service(i32);

    #[test]
    fn termination_releases_services_and_wakes_up_waiters() {
        crate::testing::test_async(async {
            let platform = Platform::new();
            platform.register(Arc::new(Service(42)));
            assert_eq!(platform.require::<Service>().0, 42);

            let waiter = {
                let platform = platform.clone();
                tokio::spawn(async move { platform.terminated().await })
            };

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!waiter.is_finished());

            platform.terminate();
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(platform.find::<Service>().is_none());

            // Waiting on a terminated platform returns immediately...
            platform.terminated().await;
        });
    }
}
