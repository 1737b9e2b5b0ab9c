use crate::auth::CronAuth;
use crate::error::app_error::AppError;
use crate::models::scan::ScanReport;
use crate::service::SessionScanner;
use chrono::Utc;
use rocket::serde::json::Json;
use rocket::{State, post};
use rocket_okapi::openapi;
use std::sync::Arc;

/// Run one proximity scan now
#[openapi(tag = "Cron")]
#[post("/scan-upcoming")]
pub async fn scan_upcoming(scanner: &State<Arc<SessionScanner>>, _cron_auth: CronAuth) -> Result<Json<ScanReport>, AppError> {
    let report = scanner.tick(Utc::now()).await?;
    Ok(Json(report))
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![scan_upcoming]
}
