use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::participant::{ChatId, Participant, ParticipantRequest, ParticipantSettingsRequest};
use crate::util::normalize_text;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ParticipantRow {
    pub(crate) id: Uuid,
    pub(crate) telegram_id: Option<i64>,
    pub(crate) name: String,
    pub(crate) contact: Option<String>,
    pub(crate) notifications_enabled: bool,
    pub(crate) warn_5min_opt_in: bool,
}

impl From<ParticipantRow> for Participant {
    fn from(row: ParticipantRow) -> Self {
        Participant {
            id: row.id,
            telegram_id: row.telegram_id,
            name: row.name,
            contact: row.contact,
            notifications_enabled: row.notifications_enabled,
            warn_5min_opt_in: row.warn_5min_opt_in,
        }
    }
}

fn map_unique_violation(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return AppError::BadRequest("A participant with this telegram id already exists".to_string());
    }
    AppError::from(err)
}

#[async_trait::async_trait]
pub trait ParticipantRepository: Send + Sync {
    async fn create_participant(&self, request: &ParticipantRequest) -> Result<Participant, AppError>;
    async fn get_participant(&self, id: &Uuid) -> Result<Option<Participant>, AppError>;
    async fn update_participant_settings(&self, id: &Uuid, request: &ParticipantSettingsRequest) -> Result<Option<Participant>, AppError>;
    async fn get_participant_by_telegram_id(&self, telegram_id: ChatId) -> Result<Option<Participant>, AppError>;
    /// Creates the participant bound to `telegram_id`, or replaces its name and contact.
    /// Notification settings of an existing participant are kept.
    async fn upsert_participant_profile(&self, telegram_id: ChatId, name: &str, contact: Option<&str>) -> Result<Participant, AppError>;
}

#[async_trait::async_trait]
impl ParticipantRepository for PostgresRepository {
    async fn create_participant(&self, request: &ParticipantRequest) -> Result<Participant, AppError> {
        let row = sqlx::query_as::<_, ParticipantRow>(
            r#"
            INSERT INTO participant (telegram_id, name, contact, notifications_enabled, warn_5min_opt_in)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, telegram_id, name, contact, notifications_enabled, warn_5min_opt_in
            "#,
        )
        .bind(request.telegram_id)
        .bind(request.name.trim())
        .bind(request.contact.as_deref().and_then(normalize_text))
        .bind(request.notifications_enabled.unwrap_or(true))
        .bind(request.warn_5min_opt_in.unwrap_or(false))
        .fetch_one(&self.pool)
        .await
        .map_err(map_unique_violation)?;

        Ok(Participant::from(row))
    }

    async fn get_participant(&self, id: &Uuid) -> Result<Option<Participant>, AppError> {
        let row = sqlx::query_as::<_, ParticipantRow>(
            r#"
            SELECT id, telegram_id, name, contact, notifications_enabled, warn_5min_opt_in
            FROM participant
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Participant::from))
    }

    async fn update_participant_settings(&self, id: &Uuid, request: &ParticipantSettingsRequest) -> Result<Option<Participant>, AppError> {
        let row = sqlx::query_as::<_, ParticipantRow>(
            r#"
            UPDATE participant
            SET notifications_enabled = COALESCE($2, notifications_enabled),
                warn_5min_opt_in = COALESCE($3, warn_5min_opt_in)
            WHERE id = $1
            RETURNING id, telegram_id, name, contact, notifications_enabled, warn_5min_opt_in
            "#,
        )
        .bind(id)
        .bind(request.notifications_enabled)
        .bind(request.warn_5min_opt_in)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Participant::from))
    }

    async fn get_participant_by_telegram_id(&self, telegram_id: ChatId) -> Result<Option<Participant>, AppError> {
        let row = sqlx::query_as::<_, ParticipantRow>(
            r#"
            SELECT id, telegram_id, name, contact, notifications_enabled, warn_5min_opt_in
            FROM participant
            WHERE telegram_id = $1
            "#,
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Participant::from))
    }

    async fn upsert_participant_profile(&self, telegram_id: ChatId, name: &str, contact: Option<&str>) -> Result<Participant, AppError> {
        let row = sqlx::query_as::<_, ParticipantRow>(
            r#"
            INSERT INTO participant (telegram_id, name, contact)
            VALUES ($1, $2, $3)
            ON CONFLICT (telegram_id) DO UPDATE
            SET name = EXCLUDED.name,
                contact = EXCLUDED.contact
            RETURNING id, telegram_id, name, contact, notifications_enabled, warn_5min_opt_in
            "#,
        )
        .bind(telegram_id)
        .bind(name.trim())
        .bind(contact.and_then(normalize_text))
        .fetch_one(&self.pool)
        .await?;

        Ok(Participant::from(row))
    }
}
