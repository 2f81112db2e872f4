use anyhow::{Context, Result};
use bottle_backend::config::BottleConfig;
use bottle_backend::runtime::BackendRuntime;
use bottle_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bottle_backend=debug")),
        )
        .init();

    let config = BottleConfig::load();
    let runtime =
        BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting chat backend (set BOTTLE_BACKEND_TOKEN + optional BOTTLE_BACKEND_BIND; auth mode via BOTTLE_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}
