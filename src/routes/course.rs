use crate::database::course::CourseRepository;
use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::course::{CourseRequest, CourseResponse};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use rocket_okapi::openapi;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

/// Create a course
#[openapi(tag = "Courses")]
#[post("/", data = "<payload>")]
pub async fn create_course(pool: &State<PgPool>, payload: Json<CourseRequest>) -> Result<Json<CourseResponse>, AppError> {
    payload.validate()?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    let course = repo.create_course(&payload).await?;
    Ok(Json(CourseResponse::from(&course)))
}

/// List all courses by name
#[openapi(tag = "Courses")]
#[get("/")]
pub async fn list_courses(pool: &State<PgPool>) -> Result<Json<Vec<CourseResponse>>, AppError> {
    let repo = PostgresRepository { pool: pool.inner().clone() };
    let courses = repo.list_courses().await?;
    Ok(Json(courses.iter().map(CourseResponse::from).collect()))
}

#[openapi(tag = "Courses")]
#[get("/<id>")]
pub async fn get_course(pool: &State<PgPool>, id: String) -> Result<Json<CourseResponse>, AppError> {
    let course_id = Uuid::parse_str(&id)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    match repo.get_course(&course_id).await? {
        Some(course) => Ok(Json(CourseResponse::from(&course))),
        None => Err(AppError::NotFound("Course not found".to_string())),
    }
}

/// Delete a course together with all of its sessions
#[openapi(tag = "Courses")]
#[delete("/<id>")]
pub async fn delete_course(pool: &State<PgPool>, id: String) -> Result<Status, AppError> {
    let course_id = Uuid::parse_str(&id)?;
    let repo = PostgresRepository { pool: pool.inner().clone() };
    if repo.delete_course(&course_id).await? {
        Ok(Status::NoContent)
    } else {
        Err(AppError::NotFound("Course not found".to_string()))
    }
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![create_course, list_courses, get_course, delete_course]
}
