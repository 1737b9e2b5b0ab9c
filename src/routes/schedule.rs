use crate::config::Config;
use crate::database::postgres_repository::PostgresRepository;
use crate::database::session::SessionRepository;
use crate::error::app_error::AppError;
use crate::models::session::SessionResponse;
use crate::routes::schedule_tz;
use crate::util::{local_day_bounds, parse_date};
use rocket::serde::json::Json;
use rocket::{State, get};
use rocket_okapi::openapi;
use sqlx::PgPool;

/// Sessions starting on one local calendar day, or the whole schedule without a date
#[openapi(tag = "Schedule")]
#[get("/?<date>")]
pub async fn get_schedule(pool: &State<PgPool>, config: &State<Config>, date: Option<String>) -> Result<Json<Vec<SessionResponse>>, AppError> {
    let tz = schedule_tz(config)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };

    let sessions = match date.as_deref() {
        Some(raw) => {
            let day = parse_date(raw).ok_or_else(|| AppError::BadRequest(format!("Invalid date '{raw}'")))?;
            let (from, to) = local_day_bounds(day, tz).ok_or_else(|| AppError::BadRequest(format!("Date out of range '{raw}'")))?;
            repo.list_sessions_between(from, to).await?
        }
        None => repo.list_session_details().await?,
    };

    Ok(Json(sessions.iter().map(|details| SessionResponse::from_details(details, tz)).collect()))
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![get_schedule]
}
