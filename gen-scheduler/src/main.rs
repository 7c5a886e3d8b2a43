use std::sync::Arc;

use gen_scheduler::config::{AppConfig, SettingsCache, SqliteSettingsProvider};
use gen_scheduler::database::{
    self,
    repositories::{SqlxCompositeRepository, SqlxTaskRepository},
};
use gen_scheduler::generation::HttpGenerationClient;
use gen_scheduler::scheduler::{Scheduler, SchedulerConfig, SchedulerDeps};
use gen_scheduler::storage::LocalBlobStorage;
use gen_scheduler::{logging, panic_hook};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let app = AppConfig::from_env()?;

    let (log_handle, _log_guard) = logging::init_logging(&app.log_dir)?;
    panic_hook::install();

    let shutdown = CancellationToken::new();
    let retention = log_handle.start_retention_cleanup(shutdown.clone());

    let pool = database::init_pool(&app.database_url).await?;
    database::run_migrations(&pool).await?;

    let provider = Arc::new(SqliteSettingsProvider::new(pool.clone()));
    log_handle.apply_persisted_filter(provider.as_ref()).await;
    let settings = Arc::new(SettingsCache::new(provider));
    if let Err(e) = settings.refresh().await {
        warn!("Failed to load settings, starting with defaults: {}", e);
    }

    let client = HttpGenerationClient::new(
        app.provider_base_url.clone(),
        app.provider_api_key.clone(),
        app.provider_timeout,
    )?;

    let scheduler = Scheduler::new(
        SchedulerDeps {
            tasks: Arc::new(SqlxTaskRepository::new(pool.clone())),
            composites: Arc::new(SqlxCompositeRepository::new(pool.clone())),
            client: Arc::new(client),
            storage: Arc::new(LocalBlobStorage::new(
                app.blob_dir.clone(),
                app.blob_public_base_url.clone(),
            )),
            settings,
        },
        SchedulerConfig::from_app(&app),
    );
    scheduler.start().await?;

    info!(database = %app.database_url, "gen-scheduler running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }

    scheduler.stop().await;
    shutdown.cancel();
    let _ = retention.await;
    pool.close().await;

    info!("gen-scheduler stopped");
    Ok(())
}
