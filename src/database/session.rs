use crate::database::participant::ParticipantRow;
use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::participant::Participant;
use crate::models::session::{DeletedSession, NewSession, Session, SessionChange, SessionDetails, SessionPatch, SessionSnapshot, SessionStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

const SESSION_DETAILS_SELECT: &str = r#"
    SELECT
        s.id,
        s.course_id,
        s.starts_at,
        s.duration_minutes,
        s.instructor,
        s.location,
        s.status,
        s.comment,
        s.warned,
        c.name AS course_name
    FROM session s
    JOIN course c ON c.id = s.course_id
"#;

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    course_id: Uuid,
    starts_at: DateTime<Utc>,
    duration_minutes: i32,
    instructor: Option<String>,
    location: Option<String>,
    status: SessionStatus,
    comment: Option<String>,
    warned: bool,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            course_id: row.course_id,
            starts_at: row.starts_at,
            duration_minutes: row.duration_minutes,
            instructor: row.instructor,
            location: row.location,
            status: row.status,
            comment: row.comment,
            warned: row.warned,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionDetailsRow {
    #[sqlx(flatten)]
    session: SessionRow,
    course_name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct EnrolledParticipantRow {
    session_id: Uuid,
    #[sqlx(flatten)]
    participant: ParticipantRow,
}

async fn load_participants<'e, E>(executor: E, session_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Participant>>, AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    if session_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, EnrolledParticipantRow>(
        r#"
        SELECT
            sp.session_id,
            p.id,
            p.telegram_id,
            p.name,
            p.contact,
            p.notifications_enabled,
            p.warn_5min_opt_in
        FROM session_participant sp
        JOIN participant p ON p.id = sp.participant_id
        WHERE sp.session_id = ANY($1)
        ORDER BY p.name, p.id
        "#,
    )
    .bind(session_ids)
    .fetch_all(executor)
    .await?;

    let mut grouped: HashMap<Uuid, Vec<Participant>> = HashMap::new();
    for row in rows {
        grouped.entry(row.session_id).or_default().push(Participant::from(row.participant));
    }
    Ok(grouped)
}

fn attach_participants(rows: Vec<SessionDetailsRow>, mut participants: HashMap<Uuid, Vec<Participant>>) -> Vec<SessionDetails> {
    rows.into_iter()
        .map(|row| {
            let session = Session::from(row.session);
            SessionDetails {
                participants: participants.remove(&session.id).unwrap_or_default(),
                course_name: row.course_name,
                session,
            }
        })
        .collect()
}

#[async_trait::async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, new_session: &NewSession) -> Result<Session, AppError>;
    async fn get_session_details(&self, id: &Uuid) -> Result<Option<SessionDetails>, AppError>;
    /// All sessions ordered by start time.
    async fn list_session_details(&self) -> Result<Vec<SessionDetails>, AppError>;
    /// Sessions starting in `[from, to)`, ordered by start time.
    async fn list_sessions_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError>;
    /// Planned or rescheduled sessions starting in `[from, to]`, ordered by start time.
    async fn list_manageable_sessions(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError>;
    /// Planned, not yet warned sessions starting in `[from, to]`.
    async fn list_warn_candidates(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError>;
    /// Applies `patch` in one transaction. `Ok(None)` means nothing differed and nothing was written.
    async fn apply_session_patch(&self, id: &Uuid, patch: &SessionPatch) -> Result<Option<SessionChange>, AppError>;
    /// Sets `warned` only while the session is still planned and unwarned at `starts_at`.
    /// Exactly one concurrent caller gets `true` and owns the starting-soon notice.
    async fn claim_warning(&self, id: &Uuid, starts_at: DateTime<Utc>) -> Result<bool, AppError>;
    /// Clears a claim whose notice reached nobody. A changed `starts_at` means the
    /// claim was already reset by the change.
    async fn release_warning(&self, id: &Uuid, starts_at: DateTime<Utc>) -> Result<bool, AppError>;
    async fn delete_session(&self, id: &Uuid) -> Result<Option<DeletedSession>, AppError>;
    /// Returns false when the participant was already registered.
    async fn register_participant(&self, session_id: &Uuid, participant_id: &Uuid) -> Result<bool, AppError>;
}

impl PostgresRepository {
    async fn fetch_details(&self, filter: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError> {
        let query = format!("{SESSION_DETAILS_SELECT} {filter} ORDER BY s.starts_at, s.id");
        let rows = sqlx::query_as::<_, SessionDetailsRow>(&query)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.session.id).collect();
        let participants = load_participants(&self.pool, &ids).await?;
        Ok(attach_participants(rows, participants))
    }
}

#[async_trait::async_trait]
impl SessionRepository for PostgresRepository {
    async fn create_session(&self, new_session: &NewSession) -> Result<Session, AppError> {
        let mut tx = self.pool.begin().await?;

        let course_exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM course WHERE id = $1")
            .bind(new_session.course_id)
            .fetch_optional(&mut *tx)
            .await?;
        if course_exists.is_none() {
            return Err(AppError::NotFound("Course not found".to_string()));
        }

        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO session (course_id, starts_at, duration_minutes, instructor, location, status, comment, warned)
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
            RETURNING id, course_id, starts_at, duration_minutes, instructor, location, status, comment, warned
            "#,
        )
        .bind(new_session.course_id)
        .bind(new_session.starts_at)
        .bind(new_session.duration_minutes)
        .bind(&new_session.instructor)
        .bind(&new_session.location)
        .bind(new_session.status)
        .bind(&new_session.comment)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Session::from(row))
    }

    async fn get_session_details(&self, id: &Uuid) -> Result<Option<SessionDetails>, AppError> {
        let query = format!("{SESSION_DETAILS_SELECT} WHERE s.id = $1");
        let Some(row) = sqlx::query_as::<_, SessionDetailsRow>(&query).bind(id).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let participants = load_participants(&self.pool, &[row.session.id]).await?;
        Ok(attach_participants(vec![row], participants).pop())
    }

    async fn list_session_details(&self) -> Result<Vec<SessionDetails>, AppError> {
        let query = format!("{SESSION_DETAILS_SELECT} ORDER BY s.starts_at, s.id");
        let rows = sqlx::query_as::<_, SessionDetailsRow>(&query).fetch_all(&self.pool).await?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.session.id).collect();
        let participants = load_participants(&self.pool, &ids).await?;
        Ok(attach_participants(rows, participants))
    }

    async fn list_sessions_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError> {
        self.fetch_details("WHERE s.starts_at >= $1 AND s.starts_at < $2", from, to).await
    }

    async fn list_manageable_sessions(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError> {
        self.fetch_details(
            "WHERE s.status IN ('planned', 'rescheduled') AND s.starts_at BETWEEN $1 AND $2",
            from,
            to,
        )
        .await
    }

    async fn list_warn_candidates(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError> {
        self.fetch_details(
            "WHERE s.status = 'planned' AND s.warned = FALSE AND s.starts_at BETWEEN $1 AND $2",
            from,
            to,
        )
        .await
    }

    async fn apply_session_patch(&self, id: &Uuid, patch: &SessionPatch) -> Result<Option<SessionChange>, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, course_id, starts_at, duration_minutes, instructor, location, status, comment, warned
            FROM session
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;

        let before = Session::from(row);
        let Some(after) = patch.apply(&before) else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE session
            SET starts_at = $2,
                duration_minutes = $3,
                instructor = $4,
                location = $5,
                status = $6,
                comment = $7,
                warned = $8,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(after.id)
        .bind(after.starts_at)
        .bind(after.duration_minutes)
        .bind(&after.instructor)
        .bind(&after.location)
        .bind(after.status)
        .bind(&after.comment)
        .bind(after.warned)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(SessionChange { before, after }))
    }

    async fn claim_warning(&self, id: &Uuid, starts_at: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE session
            SET warned = TRUE, updated_at = now()
            WHERE id = $1 AND starts_at = $2 AND status = 'planned' AND warned = FALSE
            "#,
        )
        .bind(id)
        .bind(starts_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_warning(&self, id: &Uuid, starts_at: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE session
            SET warned = FALSE, updated_at = now()
            WHERE id = $1 AND starts_at = $2 AND warned = TRUE
            "#,
        )
        .bind(id)
        .bind(starts_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&self, id: &Uuid) -> Result<Option<DeletedSession>, AppError> {
        let mut tx = self.pool.begin().await?;

        let query = format!("{SESSION_DETAILS_SELECT} WHERE s.id = $1 FOR UPDATE OF s");
        let Some(row) = sqlx::query_as::<_, SessionDetailsRow>(&query).bind(id).fetch_optional(&mut *tx).await? else {
            return Ok(None);
        };

        let mut participants = load_participants(&mut *tx, &[row.session.id]).await?;
        let details = SessionDetails {
            participants: participants.remove(&row.session.id).unwrap_or_default(),
            course_name: row.course_name,
            session: Session::from(row.session),
        };

        sqlx::query("DELETE FROM session WHERE id = $1").bind(id).execute(&mut *tx).await?;

        tx.commit().await?;

        Ok(Some(DeletedSession {
            session_id: details.session.id,
            snapshot: SessionSnapshot::from(&details),
            participants: details.participants,
        }))
    }

    async fn register_participant(&self, session_id: &Uuid, participant_id: &Uuid) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let session: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM session WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
        if session.is_none() {
            return Err(AppError::NotFound("Session not found".to_string()));
        }

        let participant: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM participant WHERE id = $1")
            .bind(participant_id)
            .fetch_optional(&mut *tx)
            .await?;
        if participant.is_none() {
            return Err(AppError::NotFound("Participant not found".to_string()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO session_participant (session_id, participant_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(participant_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }
}
