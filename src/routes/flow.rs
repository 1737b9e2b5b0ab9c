use crate::error::app_error::AppError;
use crate::models::flow::{FlowEventRequest, FlowReply};
use crate::service::{SessionLifecycle, SessionNotifier};
use chrono::Utc;
use rocket::serde::json::Json;
use rocket::{State, post};
use rocket_okapi::openapi;
use std::sync::Arc;

/// Feed one user input into the guided session flows
#[openapi(tag = "Guided flow")]
#[post("/events", data = "<payload>")]
pub async fn post_flow_event(
    lifecycle: &State<Arc<SessionLifecycle>>,
    notifier: &State<Arc<SessionNotifier>>,
    payload: Json<FlowEventRequest>,
) -> Result<Json<FlowReply>, AppError> {
    let input = payload.to_input()?;
    let outcome = lifecycle.handle(payload.actor_id, input, Utc::now()).await;

    if let Some(notice) = outcome.notice {
        notifier.dispatch(notice);
    }

    Ok(Json(outcome.reply))
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![post_flow_event]
}
