use mercury::builder::Builder;
use mercury::runtime::Gateway;
use mercury::server::Server;

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() {
    // Build a platform and enable all features...
    let platform = Builder::new().enable_all().build().await;

    // The platform releases all components once terminated, but we still need the gateway
    // to write the final snapshot...
    let gateway = platform.require::<Gateway>();

    platform.require::<Server>().event_loop().await;

    log::info!("Server stopped. Shutting down the gateway...");
    gateway.shutdown().await;
}
