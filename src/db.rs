use crate::config::DatabaseConfig;
use crate::error::app_error::AppError;
use rocket::fairing::AdHoc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

async fn init_pool(db_config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(db_config.max_connections)
        .min_connections(db_config.min_connections)
        .acquire_timeout(Duration::from_secs(db_config.acquire_timeout))
        .idle_timeout(Duration::from_secs(30))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_config.url)
        .await
}

/// Opens the pool and, when configured, applies the embedded migrations.
pub(crate) async fn connect(db_config: &DatabaseConfig) -> Result<PgPool, AppError> {
    let pool = init_pool(db_config).await.map_err(|e| AppError::db("Failed to initialize database pool", e))?;

    if db_config.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Database migrations applied");
    }

    Ok(pool)
}

pub fn stage_db(db_config: DatabaseConfig) -> AdHoc {
    AdHoc::try_on_ignite("Postgres (sqlx)", |rocket| async move {
        match connect(&db_config).await {
            Ok(pool) => {
                tracing::info!("Database pool initialized successfully");
                Ok(rocket.manage(pool))
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to initialize database");
                Err(rocket)
            }
        }
    })
}
