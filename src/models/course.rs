use chrono::{DateTime, Utc};
use rocket::serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Serialize, Debug, Clone, Default)]
pub struct Course {
    pub id: Uuid,
    pub name: String,
    pub direction: Option<String>,
    pub group: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Validate, JsonSchema)]
pub struct CourseRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(max = 64))]
    pub direction: Option<String>,
    #[validate(length(max = 64))]
    pub group: Option<String>,
}

#[derive(Serialize, Debug, Clone, JsonSchema)]
pub struct CourseResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl From<&Course> for CourseResponse {
    fn from(course: &Course) -> Self {
        Self {
            id: course.id,
            name: course.name.clone(),
            direction: course.direction.clone(),
            group: course.group.clone(),
        }
    }
}
