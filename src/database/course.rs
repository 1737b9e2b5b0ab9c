use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::course::{Course, CourseRequest};
use crate::util::normalize_text;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct CourseRow {
    id: Uuid,
    name: String,
    direction: Option<String>,
    group_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<CourseRow> for Course {
    fn from(row: CourseRow) -> Self {
        Course {
            id: row.id,
            name: row.name,
            direction: row.direction,
            group: row.group_name,
            created_at: row.created_at,
        }
    }
}

#[async_trait::async_trait]
pub trait CourseRepository: Send + Sync {
    async fn create_course(&self, request: &CourseRequest) -> Result<Course, AppError>;
    async fn list_courses(&self) -> Result<Vec<Course>, AppError>;
    async fn get_course(&self, id: &Uuid) -> Result<Option<Course>, AppError>;
    /// Removes the course together with its sessions. Returns false if it did not exist.
    async fn delete_course(&self, id: &Uuid) -> Result<bool, AppError>;
}

#[async_trait::async_trait]
impl CourseRepository for PostgresRepository {
    async fn create_course(&self, request: &CourseRequest) -> Result<Course, AppError> {
        let row = sqlx::query_as::<_, CourseRow>(
            r#"
            INSERT INTO course (name, direction, group_name)
            VALUES ($1, $2, $3)
            RETURNING id, name, direction, group_name, created_at
            "#,
        )
        .bind(request.name.trim())
        .bind(request.direction.as_deref().and_then(normalize_text))
        .bind(request.group.as_deref().and_then(normalize_text))
        .fetch_one(&self.pool)
        .await?;

        Ok(Course::from(row))
    }

    async fn list_courses(&self) -> Result<Vec<Course>, AppError> {
        let rows = sqlx::query_as::<_, CourseRow>(
            r#"
            SELECT id, name, direction, group_name, created_at
            FROM course
            ORDER BY name, created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Course::from).collect())
    }

    async fn get_course(&self, id: &Uuid) -> Result<Option<Course>, AppError> {
        let row = sqlx::query_as::<_, CourseRow>(
            r#"
            SELECT id, name, direction, group_name, created_at
            FROM course
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Course::from))
    }

    async fn delete_course(&self, id: &Uuid) -> Result<bool, AppError> {
        // Sessions and their participant links go with the course through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM course WHERE id = $1").bind(id).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }
}
