use crate::config::{Config, OperatorsConfig};
use crate::error::app_error::AppError;
use crate::models::flow::ActorId;
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{FromRequest, Outcome as RequestOutcome, Request};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{Object, Responses, SecurityRequirement, SecurityScheme, SecuritySchemeData};
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use std::collections::HashSet;

pub const CRON_TOKEN_HEADER: &str = "x-cron-token";

/// Actors allowed to run the guided flows.
pub fn operator_set(config: &OperatorsConfig) -> HashSet<ActorId> {
    config.ids.iter().copied().collect()
}

/// Guard for scheduler-triggered endpoints; the caller must present the configured token.
pub struct CronAuth;

fn check_cron_token(configured: &str, incoming: Option<&str>) -> Result<(), (Status, AppError)> {
    if configured.is_empty() {
        return Err((Status::BadRequest, AppError::BadRequest("Cron auth token is not configured".to_string())));
    }
    match incoming {
        Some(token) if token == configured => Ok(()),
        _ => Err((Status::Forbidden, AppError::Forbidden)),
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CronAuth {
    type Error = AppError;

    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        let Some(config) = req.rocket().state::<Config>() else {
            return Outcome::Error((Status::InternalServerError, AppError::configuration("Configuration is not managed")));
        };

        match check_cron_token(&config.cron.auth_token, req.headers().get_one(CRON_TOKEN_HEADER)) {
            Ok(()) => Outcome::Success(CronAuth),
            Err(failure) => Outcome::Error(failure),
        }
    }
}

impl<'a> OpenApiFromRequest<'a> for CronAuth {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        let security_scheme = SecurityScheme {
            description: Some("Shared secret configured in cron.auth_token.".to_string()),
            data: SecuritySchemeData::ApiKey {
                name: CRON_TOKEN_HEADER.to_string(),
                location: "header".to_string(),
            },
            extensions: Object::default(),
        };

        let mut security_req = SecurityRequirement::new();
        security_req.insert("cronToken".to_string(), Vec::new());

        Ok(RequestHeaderInput::Security("cronToken".to_string(), security_scheme, security_req))
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        use rocket_okapi::okapi::openapi3::{RefOr, Response};
        let mut responses = Responses::default();
        responses.responses.insert(
            "403".to_string(),
            RefOr::Object(Response {
                description: "Forbidden - missing or wrong cron token".to_string(),
                ..Default::default()
            }),
        );
        Ok(responses)
    }
}
