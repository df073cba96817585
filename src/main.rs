use dotenvy::dotenv;
use studio_ledger::{
    config::{database, studio},
    core::{ledger, package, retry::with_retry},
    errors::Result,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn run_expiry_sweep(db: &sea_orm::DatabaseConnection) -> Result<u64> {
    with_retry("expiry sweep", || ledger::mark_expired_blocks(db)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Load studio configuration
    let config = studio::load_default_config()
        .inspect_err(|e| error!("Failed to load studio configuration: {}", e))?;

    // 4. Connect and make sure the schema exists
    if std::env::var("DATABASE_URL").is_err() {
        std::fs::create_dir_all("data")?;
    }
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db).await?;

    // 5. Seed the package catalog
    package::seed_packages(&db, &config.packages).await?;

    // 6. Expire overdue blocks, once or on the configured interval
    let Some(period) = config.sweep.interval() else {
        let expired = run_expiry_sweep(&db).await?;
        info!(expired, "Expiry sweep finished");
        return Ok(());
    };

    info!(?period, "Running expiry sweep periodically");
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => match run_expiry_sweep(&db).await {
                Ok(expired) => info!(expired, "Expiry sweep finished"),
                Err(e) => error!("Expiry sweep failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
