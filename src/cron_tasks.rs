use crate::Config;
use crate::database::postgres_repository::PostgresRepository;
use crate::db::connect;
use crate::models::scan::ScanReport;
use crate::service::messenger::{Messenger, TelegramMessenger};
use crate::service::scanner::ProximityScanner;
use chrono::Utc;
use std::sync::Arc;

/// Runs a single proximity scan against the configured database.
pub async fn scan_upcoming(config: &Config) -> Result<ScanReport, String> {
    let tz = config.schedule.tz()?;
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(&config.telegram).map_err(|err| format!("Failed to set up Telegram delivery: {err:?}"))?);

    let pool = connect(&config.database)
        .await
        .map_err(|err| format!("Failed to initialize database: {err:?}"))?;

    let scanner = ProximityScanner::new(PostgresRepository::new(pool.clone()), messenger, tz, &config.scanner);
    let result = scanner.tick(Utc::now()).await.map_err(|err| format!("Proximity scan failed: {err:?}"));

    pool.close().await;

    result
}
