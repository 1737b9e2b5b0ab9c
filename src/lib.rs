mod auth;
mod config;
mod cron_tasks;
mod database;
mod db;
mod error;
mod middleware;
mod models;
mod routes;
mod service;
mod util;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use cron_tasks::scan_upcoming;

use crate::auth::operator_set;
use crate::database::postgres_repository::PostgresRepository;
use crate::db::stage_db;
use crate::middleware::RequestLogger;
use crate::routes as app_routes;
use crate::service::field_collector::FieldCollector;
use crate::service::lifecycle::{LifecycleMachine, LifecycleSettings};
use crate::service::messenger::{Messenger, TelegramMessenger};
use crate::service::notifier::ChangeNotifier;
use crate::service::scanner::ProximityScanner;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket, catchers, http::Method};
use rocket_cors::{AllowedOrigins, Cors, CorsOptions};
use rocket_okapi::swagger_ui::{SwaggerUIConfig, make_swagger_ui};
use rocket_okapi::{get_openapi_route, okapi::merge::marge_spec_list};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(log_level: &str, json_format: bool) {
    // RUST_LOG takes precedence over the configured level, e.g.
    //   RUST_LOG=class_pulse::service=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_line_number(true);

    // A subscriber may already be installed (tests build several rockets).
    let _ = if json_format { subscriber.json().try_init() } else { subscriber.try_init() };
}

fn build_cors(cors_config: &config::CorsConfig) -> Result<Cors, String> {
    let is_wildcard = cors_config.allowed_origins.len() == 1 && cors_config.allowed_origins[0] == "*";

    if is_wildcard && cors_config.allow_credentials {
        return Err("Cannot use wildcard origins (*) with credentials enabled".to_string());
    }

    let allowed_origins = if cors_config.allowed_origins.is_empty() {
        AllowedOrigins::some_exact::<&str>(&[])
    } else if is_wildcard {
        AllowedOrigins::all()
    } else {
        AllowedOrigins::some_exact(&cors_config.allowed_origins.iter().map(String::as_str).collect::<Vec<_>>())
    };

    CorsOptions {
        allowed_origins,
        allowed_methods: vec![Method::Get, Method::Post, Method::Patch, Method::Delete, Method::Options, Method::Head]
            .into_iter()
            .map(From::from)
            .collect(),
        allowed_headers: rocket_cors::AllowedHeaders::some(&["Content-Type", "Accept", "X-Cron-Token"]),
        allow_credentials: cors_config.allow_credentials,
        ..Default::default()
    }
    .to_cors()
    .map_err(|err| err.to_string())
}

fn get_swagger_config(openapi_url: &str) -> SwaggerUIConfig {
    SwaggerUIConfig {
        url: openapi_url.to_string(),
        ..Default::default()
    }
}

fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return config::DEFAULT_API_BASE_PATH.to_string();
    }

    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };

    while normalized.ends_with('/') && normalized.len() > 1 {
        normalized.pop();
    }

    normalized
}

fn join_base_path(base_path: &str, path: &str) -> String {
    let base = base_path.trim_end_matches('/');
    let suffix = path.trim_start_matches('/');

    if base.is_empty() {
        format!("/{}", suffix)
    } else {
        format!("{}/{}", base, suffix)
    }
}

struct RouteSpec {
    path: &'static str,
    routes: Vec<rocket::Route>,
    openapi: rocket_okapi::okapi::openapi3::OpenApi,
}

fn collect_route_specs() -> Vec<RouteSpec> {
    let (course_routes, course_openapi) = app_routes::course::routes();
    let (participant_routes, participant_openapi) = app_routes::participant::routes();
    let (session_routes, session_openapi) = app_routes::session::routes();
    let (schedule_routes, schedule_openapi) = app_routes::schedule::routes();
    let (flow_routes, flow_openapi) = app_routes::flow::routes();
    let (cron_routes, cron_openapi) = app_routes::cron::routes();
    let (health_routes, health_openapi) = app_routes::health::routes();

    vec![
        RouteSpec {
            path: "/courses",
            routes: course_routes,
            openapi: course_openapi,
        },
        RouteSpec {
            path: "/participants",
            routes: participant_routes,
            openapi: participant_openapi,
        },
        RouteSpec {
            path: "/sessions",
            routes: session_routes,
            openapi: session_openapi,
        },
        RouteSpec {
            path: "/schedule",
            routes: schedule_routes,
            openapi: schedule_openapi,
        },
        RouteSpec {
            path: "/flow",
            routes: flow_routes,
            openapi: flow_openapi,
        },
        RouteSpec {
            path: "/cron",
            routes: cron_routes,
            openapi: cron_openapi,
        },
        RouteSpec {
            path: "/health",
            routes: health_routes,
            openapi: health_openapi,
        },
    ]
}

fn mount_api_routes(mut rocket: Rocket<Build>, base_path: &str, enable_swagger: bool) -> Rocket<Build> {
    let mut openapi_list = Vec::new();
    for spec in collect_route_specs() {
        rocket = rocket.mount(join_base_path(base_path, spec.path), spec.routes);
        openapi_list.push((spec.path, spec.openapi));
    }

    if !enable_swagger {
        return rocket;
    }

    match marge_spec_list(&openapi_list) {
        Ok(openapi_docs) => {
            let settings = rocket_okapi::settings::OpenApiSettings::default();
            rocket = rocket.mount(base_path, vec![get_openapi_route(openapi_docs, &settings)]);

            let docs_path = join_base_path(base_path, "docs");
            let openapi_url = join_base_path(base_path, "openapi.json");
            rocket.mount(docs_path, make_swagger_ui(&get_swagger_config(&openapi_url)))
        }
        Err(err) => {
            error!(error = %err, "could not merge OpenAPI spec, docs are not served");
            rocket
        }
    }
}

/// Builds the notifier, guided-flow machine and scanner on top of the managed pool,
/// and starts the background scanner and stale-flow sweeper.
fn stage_services(config: Config) -> AdHoc {
    AdHoc::try_on_ignite("Session services", |rocket| async move {
        let Some(pool) = rocket.state::<PgPool>().cloned() else {
            error!("Database pool is not available; session services cannot start");
            return Err(rocket);
        };

        let tz = match config.schedule.tz() {
            Ok(tz) => tz,
            Err(err) => {
                error!(error = %err, "invalid schedule timezone");
                return Err(rocket);
            }
        };

        let messenger: Arc<dyn Messenger> = match TelegramMessenger::new(&config.telegram) {
            Ok(messenger) => Arc::new(messenger),
            Err(err) => {
                error!(error = ?err, "failed to set up Telegram delivery");
                return Err(rocket);
            }
        };

        let repo = PostgresRepository::new(pool);
        let notifier = Arc::new(ChangeNotifier::new(repo.clone(), messenger.clone(), tz));

        let collector = Arc::new(FieldCollector::new());
        let lifecycle = Arc::new(LifecycleMachine::new(
            repo.clone(),
            collector.clone(),
            LifecycleSettings {
                tz,
                operators: operator_set(&config.operators),
                manage_lookback: chrono::Duration::minutes(config.schedule.manage_lookback_minutes),
                manage_horizon: chrono::Duration::days(config.schedule.manage_horizon_days),
            },
        ));

        let scanner = Arc::new(ProximityScanner::new(repo, messenger, tz, &config.scanner));
        if config.scanner.enabled {
            scanner.clone().spawn(config.scanner.interval(), config.scanner.startup_delay());
            info!(
                interval_seconds = config.scanner.interval_seconds,
                lead_seconds = config.scanner.lead_seconds,
                "proximity scanner started"
            );
        }

        if let Some(ttl) = config.flow.ttl() {
            collector.spawn_sweeper(ttl, std::time::Duration::from_secs(config.flow.sweep_interval_seconds));
        }

        Ok(rocket.manage(notifier).manage(lifecycle).manage(scanner))
    })
}

pub fn build_rocket(config: Config) -> Rocket<Build> {
    init_tracing(&config.logging.level, config.logging.json_format);

    let figment = rocket::Config::figment()
        .merge(("port", config.server.port))
        .merge(("address", config.server.address.clone()));

    let mut rocket = rocket::custom(figment)
        .attach(RequestLogger)
        .attach(stage_db(config.database.clone()))
        .attach(stage_services(config.clone()));

    rocket = match build_cors(&config.cors) {
        Ok(cors) => rocket.attach(cors),
        Err(err) => rocket.attach(AdHoc::try_on_ignite("CORS", move |rocket| async move {
            error!(error = %err, "invalid CORS configuration");
            Err(rocket)
        })),
    };

    let base_path = normalize_base_path(&config.api.base_path);
    rocket = mount_api_routes(rocket, &base_path, config.api.enable_swagger);
    rocket = rocket.register(
        base_path.as_str(),
        catchers![app_routes::error::not_found, app_routes::error::conflict, app_routes::error::unprocessable_entity],
    );

    rocket.manage(config)
}
