use crate::database::participant::ParticipantRepository;
use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::participant::{ParticipantRequest, ParticipantResponse, ParticipantSettingsRequest};
use rocket::serde::json::Json;
use rocket::{State, get, patch, post};
use rocket_okapi::openapi;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

/// Create a participant
#[openapi(tag = "Participants")]
#[post("/", data = "<payload>")]
pub async fn create_participant(pool: &State<PgPool>, payload: Json<ParticipantRequest>) -> Result<Json<ParticipantResponse>, AppError> {
    payload.validate()?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    let participant = repo.create_participant(&payload).await?;
    Ok(Json(ParticipantResponse::from(&participant)))
}

#[openapi(tag = "Participants")]
#[get("/<id>")]
pub async fn get_participant(pool: &State<PgPool>, id: String) -> Result<Json<ParticipantResponse>, AppError> {
    let participant_id = Uuid::parse_str(&id)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    repo.get_participant(&participant_id)
        .await?
        .map(|participant| Json(ParticipantResponse::from(&participant)))
        .ok_or_else(|| AppError::NotFound("Participant not found".to_string()))
}

/// Toggle change notifications and the starting-soon warning
#[openapi(tag = "Participants")]
#[patch("/<id>/settings", data = "<payload>")]
pub async fn update_participant_settings(
    pool: &State<PgPool>,
    id: String,
    payload: Json<ParticipantSettingsRequest>,
) -> Result<Json<ParticipantResponse>, AppError> {
    let participant_id = Uuid::parse_str(&id)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    repo.update_participant_settings(&participant_id, &payload)
        .await?
        .map(|participant| Json(ParticipantResponse::from(&participant)))
        .ok_or_else(|| AppError::NotFound("Participant not found".to_string()))
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![create_participant, get_participant, update_participant_settings]
}
