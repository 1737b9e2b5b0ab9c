use crate::config::Config;
use crate::database::postgres_repository::PostgresRepository;
use crate::database::session::SessionRepository;
use crate::error::app_error::AppError;
use crate::models::session::{IdResponse, RegisterParticipantRequest, RegistrationResponse, SessionRequest, SessionResponse, SessionUpdateRequest};
use crate::routes::schedule_tz;
use crate::service::SessionNotifier;
use crate::service::notifier::ChangeNotice;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, patch, post};
use rocket_okapi::openapi;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

/// Create a session
#[openapi(tag = "Sessions")]
#[post("/", data = "<payload>")]
pub async fn create_session(pool: &State<PgPool>, config: &State<Config>, payload: Json<SessionRequest>) -> Result<Json<IdResponse>, AppError> {
    payload.validate()?;
    let new_session = payload.to_new_session(schedule_tz(config)?, config.schedule.default_duration_minutes)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    let session = repo.create_session(&new_session).await?;
    info!(session_id = %session.id, course_id = %session.course_id, "session created");
    Ok(Json(IdResponse { id: session.id }))
}

/// List all sessions ordered by start time
#[openapi(tag = "Sessions")]
#[get("/")]
pub async fn list_sessions(pool: &State<PgPool>, config: &State<Config>) -> Result<Json<Vec<SessionResponse>>, AppError> {
    let tz = schedule_tz(config)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    let sessions = repo.list_session_details().await?;
    Ok(Json(sessions.iter().map(|details| SessionResponse::from_details(details, tz)).collect()))
}

#[openapi(tag = "Sessions")]
#[get("/<id>")]
pub async fn get_session(pool: &State<PgPool>, config: &State<Config>, id: String) -> Result<Json<SessionResponse>, AppError> {
    let session_id = Uuid::parse_str(&id)?;
    let tz = schedule_tz(config)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    repo.get_session_details(&session_id)
        .await?
        .map(|details| Json(SessionResponse::from_details(&details, tz)))
        .ok_or_else(|| AppError::NotFound("Session not found".to_string()))
}

/// Update any subset of session fields; enrolled participants get one change notice
#[openapi(tag = "Sessions")]
#[patch("/<id>", data = "<payload>")]
pub async fn update_session(
    pool: &State<PgPool>,
    config: &State<Config>,
    notifier: &State<Arc<SessionNotifier>>,
    id: String,
    payload: Json<SessionUpdateRequest>,
) -> Result<Json<IdResponse>, AppError> {
    payload.validate()?;
    let session_id = Uuid::parse_str(&id)?;
    let patch = payload.to_patch(schedule_tz(config)?)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };

    if let Some(change) = repo.apply_session_patch(&session_id, &patch).await? {
        let summary = change.summary();
        info!(session_id = %session_id, summary = %summary, "session updated");
        notifier.dispatch(ChangeNotice::Updated { session_id, summary });
    }

    Ok(Json(IdResponse { id: session_id }))
}

/// Delete a session; enrolled participants are told from the pre-deletion snapshot
#[openapi(tag = "Sessions")]
#[delete("/<id>")]
pub async fn delete_session(
    pool: &State<PgPool>,
    config: &State<Config>,
    notifier: &State<Arc<SessionNotifier>>,
    id: String,
) -> Result<Status, AppError> {
    let session_id = Uuid::parse_str(&id)?;
    let tz = schedule_tz(config)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };

    let deleted = repo
        .delete_session(&session_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;
    info!(session_id = %session_id, participants = deleted.participants.len(), "session deleted");

    let summary = deleted.summary(tz);
    notifier.dispatch(ChangeNotice::Deleted { deleted, summary });
    Ok(Status::NoContent)
}

/// Enroll a participant; registering twice is a no-op
#[openapi(tag = "Sessions")]
#[post("/<id>/participants", data = "<payload>")]
pub async fn register_participant(pool: &State<PgPool>, id: String, payload: Json<RegisterParticipantRequest>) -> Result<Json<RegistrationResponse>, AppError> {
    let session_id = Uuid::parse_str(&id)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    let inserted = repo.register_participant(&session_id, &payload.participant_id).await?;
    Ok(Json(RegistrationResponse {
        status: if inserted { "registered" } else { "already_registered" },
    }))
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![create_session, list_sessions, get_session, update_session, delete_session, register_participant]
}
