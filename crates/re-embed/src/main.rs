mod config;
mod error;
mod pipeline;
mod store;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use embed_common::client::EmbedApiClient;

use config::Config;
use pipeline::ReEmbedPipeline;
use store::PgRecordStore;

/// Exit code when the pass completed but at least one record failed.
const EXIT_PARTIAL_FAILURE: i32 = 2;

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

    info!("starting re-embed");

    // 1. Load config from environment
    let config = Config::from_env()?;
    info!(
        db_host = %config.db.host,
        db_port = config.db.port,
        database = %config.db.database,
        table = %config.table,
        concurrency = config.concurrency,
        embed_api = %config.client.base_url,
        "configuration loaded"
    );

    // 2. Build the embedding service client
    let client = EmbedApiClient::new(config.client.clone())?;

    // 3. Preflight /health (warning only; each record decides on its own)
    if client.has_credential() {
        match client.health().await {
            Ok(health) => info!(status = %health.status, "embedding service reachable"),
            Err(e) => warn!(error = %e, "embedding service health check failed"),
        }
    }

    // 4. Connect to Postgres and re-embed every record
    let pipeline = ReEmbedPipeline::new(client, usize::try_from(config.concurrency)?);
    let report = pipeline
        .run(PgRecordStore::connect(
            &config.db,
            &config.table,
            config.concurrency,
        ))
        .await
        .inspect_err(|e| error!(error = %e, "re-embed aborted"))?;

    // 5. Report
    for failure in &report.failures {
        warn!(
            id = failure.id,
            kind = ?failure.kind,
            status = ?failure.status,
            message = %failure.message,
            "record not re-embedded"
        );
    }

    if !report.is_clean() {
        error!(
            failed = report.failed(),
            succeeded = report.succeeded,
            "re-embed finished with failures"
        );
        std::process::exit(EXIT_PARTIAL_FAILURE);
    }

    info!(
        succeeded = report.succeeded,
        skipped = report.skipped,
        "re-embed finished"
    );
    Ok(())
}
