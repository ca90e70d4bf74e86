mod config;
mod error;
mod server;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use embed_common::auth::AuthGate;
use embed_common::embedding::FastEmbedLoader;
use embed_common::lazy::LazyModel;

use config::Config;
use server::EmbeddingService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting embed-server");

    // 1. Load config from environment
    let config = Config::from_env()?;
    info!(
        host = %config.host,
        port = config.port,
        model = config.model.name(),
        auth = config.api_key.is_some(),
        warmup = config.warmup,
        init_retry_backoff_ms = config.init_retry_backoff.as_millis(),
        "configuration loaded"
    );
    if config.api_key.is_none() {
        warn!("EMBED_API_KEY is not set, every authenticated request will be rejected");
    }

    // 2. Set up the lazily loaded model (first request loads it unless warmup is on)
    let loader = FastEmbedLoader::new(config.model).with_cache_dir(config.model_cache_dir.clone());
    let model = LazyModel::with_retry_backoff(loader, config.init_retry_backoff);

    // 3. Compose the service: auth gate + shared model
    let service = EmbeddingService::new(AuthGate::new(config.api_key.clone()), model);

    // 4. Optional background warmup
    if config.warmup {
        let model = service.model().clone();
        tokio::spawn(async move {
            info!("warming up embedding model in the background");
            if let Err(e) = model.get_or_init().await {
                warn!(error = %e, "warmup failed, the next request will retry");
            }
        });
    }

    // 5. Serve HTTP until shutdown
    let app = server::router(service);
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, "embed-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("embed-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
