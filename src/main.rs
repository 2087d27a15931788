use std::sync::Arc;

use tracing::info;

use aether_kernel::config::{init_tracing, AppConfig};
use aether_kernel::kernel::Kernel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let port = config.port();

    let kernel = Arc::new(Kernel::new(config));
    kernel.start().await?;

    let app = aether_kernel::api::router(kernel.clone());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting server on {}", addr);
    info!("Server ready: http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(kernel))
        .await?;

    Ok(())
}

async fn shutdown_signal(kernel: Arc<Kernel>) {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    kernel.shutdown().await;
}
