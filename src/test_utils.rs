use crate::database::course::CourseRepository;
use crate::database::participant::ParticipantRepository;
use crate::database::session::SessionRepository;
use crate::error::app_error::AppError;
use crate::models::course::{Course, CourseRequest};
use crate::models::participant::{ChatId, Participant, ParticipantRequest, ParticipantSettingsRequest};
use crate::models::session::{DeletedSession, NewSession, Session, SessionChange, SessionDetails, SessionPatch, SessionSnapshot, SessionStatus};
use crate::service::messenger::{DeliveryError, Messenger};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub fn sample_participant(telegram_id: Option<ChatId>, notifications_enabled: bool, warn_5min_opt_in: bool) -> Participant {
    Participant {
        id: Uuid::new_v4(),
        telegram_id,
        name: format!("Participant {}", telegram_id.unwrap_or_default()),
        contact: None,
        notifications_enabled,
        warn_5min_opt_in,
    }
}

pub fn sample_session() -> Session {
    Session {
        id: Uuid::new_v4(),
        course_id: Uuid::new_v4(),
        starts_at: Utc.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap(),
        duration_minutes: 90,
        instructor: Some("Dr. Lin".to_string()),
        location: Some("Room 305".to_string()),
        status: SessionStatus::Planned,
        comment: None,
        warned: false,
    }
}

#[derive(Default)]
struct Store {
    courses: Vec<Course>,
    participants: Vec<Participant>,
    sessions: Vec<Session>,
    enrollments: Vec<(Uuid, Uuid)>,
    writes: usize,
    failing_claims: HashSet<Uuid>,
}

impl Store {
    fn details(&self, session: &Session) -> SessionDetails {
        let course_name = self
            .courses
            .iter()
            .find(|course| course.id == session.course_id)
            .map(|course| course.name.clone())
            .unwrap_or_default();

        let mut participants: Vec<Participant> = self
            .enrollments
            .iter()
            .filter(|(session_id, _)| *session_id == session.id)
            .filter_map(|(_, participant_id)| self.participants.iter().find(|p| p.id == *participant_id).cloned())
            .collect();
        participants.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        SessionDetails {
            session: session.clone(),
            course_name,
            participants,
        }
    }

    fn ordered_details(&self, keep: impl Fn(&Session) -> bool) -> Vec<SessionDetails> {
        let mut sessions: Vec<&Session> = self.sessions.iter().filter(|session| keep(session)).collect();
        sessions.sort_by_key(|session| (session.starts_at, session.id));
        sessions.into_iter().map(|session| self.details(session)).collect()
    }
}

/// Repository double backed by plain vectors. Clones share the same store.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    store: Arc<Mutex<Store>>,
}

impl InMemoryRepository {
    pub async fn add_course(&self, name: &str) -> Course {
        let course = Course {
            id: Uuid::new_v4(),
            name: name.to_string(),
            direction: None,
            group: None,
            created_at: Utc::now(),
        };
        self.store.lock().await.courses.push(course.clone());
        course
    }

    pub async fn add_session(&self, course_id: Uuid, starts_at: DateTime<Utc>) -> Session {
        let session = Session {
            course_id,
            starts_at,
            ..sample_session()
        };
        self.store.lock().await.sessions.push(session.clone());
        session
    }

    pub async fn add_participant(&self, participant: Participant) -> Participant {
        self.store.lock().await.participants.push(participant.clone());
        participant
    }

    pub async fn enroll(&self, session_id: Uuid, participant_id: Uuid) {
        self.store.lock().await.enrollments.push((session_id, participant_id));
    }

    pub async fn session(&self, id: &Uuid) -> Option<Session> {
        self.store.lock().await.sessions.iter().find(|session| session.id == *id).cloned()
    }

    /// Sessions in insertion order.
    pub async fn sessions(&self) -> Vec<Session> {
        self.store.lock().await.sessions.clone()
    }

    pub async fn set_status(&self, id: &Uuid, status: SessionStatus) {
        if let Some(session) = self.store.lock().await.sessions.iter_mut().find(|session| session.id == *id) {
            session.status = status;
        }
    }

    pub async fn set_warned(&self, id: &Uuid, warned: bool) {
        if let Some(session) = self.store.lock().await.sessions.iter_mut().find(|session| session.id == *id) {
            session.warned = warned;
        }
    }

    /// Removes a session behind the repository's back, as a concurrent delete would.
    pub async fn remove_session(&self, id: &Uuid) {
        let mut store = self.store.lock().await;
        store.sessions.retain(|session| session.id != *id);
        store.enrollments.retain(|(session_id, _)| session_id != id);
    }

    /// Makes every warning claim on `id` fail as a lost connection would.
    pub async fn fail_warning_claims_for(&self, id: &Uuid) {
        self.store.lock().await.failing_claims.insert(*id);
    }

    /// Number of committed session patches.
    pub async fn write_count(&self) -> usize {
        self.store.lock().await.writes
    }
}

#[async_trait::async_trait]
impl CourseRepository for InMemoryRepository {
    async fn create_course(&self, request: &CourseRequest) -> Result<Course, AppError> {
        let course = Course {
            id: Uuid::new_v4(),
            name: request.name.trim().to_string(),
            direction: request.direction.clone(),
            group: request.group.clone(),
            created_at: Utc::now(),
        };
        self.store.lock().await.courses.push(course.clone());
        Ok(course)
    }

    async fn list_courses(&self) -> Result<Vec<Course>, AppError> {
        let mut courses = self.store.lock().await.courses.clone();
        courses.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(courses)
    }

    async fn get_course(&self, id: &Uuid) -> Result<Option<Course>, AppError> {
        Ok(self.store.lock().await.courses.iter().find(|course| course.id == *id).cloned())
    }

    async fn delete_course(&self, id: &Uuid) -> Result<bool, AppError> {
        let mut store = self.store.lock().await;
        let before = store.courses.len();
        store.courses.retain(|course| course.id != *id);
        if store.courses.len() == before {
            return Ok(false);
        }

        let removed: HashSet<Uuid> = store.sessions.iter().filter(|s| s.course_id == *id).map(|s| s.id).collect();
        store.sessions.retain(|session| session.course_id != *id);
        store.enrollments.retain(|(session_id, _)| !removed.contains(session_id));
        Ok(true)
    }
}

#[async_trait::async_trait]
impl ParticipantRepository for InMemoryRepository {
    async fn create_participant(&self, request: &ParticipantRequest) -> Result<Participant, AppError> {
        let mut store = self.store.lock().await;
        if request.telegram_id.is_some() && store.participants.iter().any(|p| p.telegram_id == request.telegram_id) {
            return Err(AppError::BadRequest("A participant with this telegram id already exists".to_string()));
        }

        let participant = Participant {
            id: Uuid::new_v4(),
            telegram_id: request.telegram_id,
            name: request.name.trim().to_string(),
            contact: request.contact.clone(),
            notifications_enabled: request.notifications_enabled.unwrap_or(true),
            warn_5min_opt_in: request.warn_5min_opt_in.unwrap_or(false),
        };
        store.participants.push(participant.clone());
        Ok(participant)
    }

    async fn get_participant(&self, id: &Uuid) -> Result<Option<Participant>, AppError> {
        Ok(self.store.lock().await.participants.iter().find(|p| p.id == *id).cloned())
    }

    async fn update_participant_settings(&self, id: &Uuid, request: &ParticipantSettingsRequest) -> Result<Option<Participant>, AppError> {
        let mut store = self.store.lock().await;
        let Some(participant) = store.participants.iter_mut().find(|p| p.id == *id) else {
            return Ok(None);
        };
        if let Some(enabled) = request.notifications_enabled {
            participant.notifications_enabled = enabled;
        }
        if let Some(opt_in) = request.warn_5min_opt_in {
            participant.warn_5min_opt_in = opt_in;
        }
        Ok(Some(participant.clone()))
    }

    async fn get_participant_by_telegram_id(&self, telegram_id: ChatId) -> Result<Option<Participant>, AppError> {
        Ok(self.store.lock().await.participants.iter().find(|p| p.telegram_id == Some(telegram_id)).cloned())
    }

    async fn upsert_participant_profile(&self, telegram_id: ChatId, name: &str, contact: Option<&str>) -> Result<Participant, AppError> {
        let mut store = self.store.lock().await;
        if let Some(existing) = store.participants.iter_mut().find(|p| p.telegram_id == Some(telegram_id)) {
            existing.name = name.trim().to_string();
            existing.contact = contact.map(str::to_string);
            return Ok(existing.clone());
        }

        let participant = Participant {
            id: Uuid::new_v4(),
            telegram_id: Some(telegram_id),
            name: name.trim().to_string(),
            contact: contact.map(str::to_string),
            notifications_enabled: true,
            warn_5min_opt_in: false,
        };
        store.participants.push(participant.clone());
        Ok(participant)
    }
}

#[async_trait::async_trait]
impl SessionRepository for InMemoryRepository {
    async fn create_session(&self, new_session: &NewSession) -> Result<Session, AppError> {
        let mut store = self.store.lock().await;
        if !store.courses.iter().any(|course| course.id == new_session.course_id) {
            return Err(AppError::NotFound("Course not found".to_string()));
        }

        let session = Session {
            id: Uuid::new_v4(),
            course_id: new_session.course_id,
            starts_at: new_session.starts_at,
            duration_minutes: new_session.duration_minutes,
            instructor: new_session.instructor.clone(),
            location: new_session.location.clone(),
            status: new_session.status,
            comment: new_session.comment.clone(),
            warned: false,
        };
        store.sessions.push(session.clone());
        Ok(session)
    }

    async fn get_session_details(&self, id: &Uuid) -> Result<Option<SessionDetails>, AppError> {
        let store = self.store.lock().await;
        Ok(store.sessions.iter().find(|session| session.id == *id).map(|session| store.details(session)))
    }

    async fn list_session_details(&self) -> Result<Vec<SessionDetails>, AppError> {
        Ok(self.store.lock().await.ordered_details(|_| true))
    }

    async fn list_sessions_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError> {
        Ok(self.store.lock().await.ordered_details(|s| s.starts_at >= from && s.starts_at < to))
    }

    async fn list_manageable_sessions(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError> {
        Ok(self
            .store
            .lock()
            .await
            .ordered_details(|s| s.status.is_manageable() && s.starts_at >= from && s.starts_at <= to))
    }

    async fn list_warn_candidates(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SessionDetails>, AppError> {
        Ok(self
            .store
            .lock()
            .await
            .ordered_details(|s| s.status == SessionStatus::Planned && !s.warned && s.starts_at >= from && s.starts_at <= to))
    }

    async fn apply_session_patch(&self, id: &Uuid, patch: &SessionPatch) -> Result<Option<SessionChange>, AppError> {
        let mut store = self.store.lock().await;
        let Some(stored) = store.sessions.iter_mut().find(|session| session.id == *id) else {
            return Err(AppError::NotFound("Session not found".to_string()));
        };

        let before = stored.clone();
        let Some(after) = patch.apply(&before) else {
            return Ok(None);
        };
        *stored = after.clone();
        store.writes += 1;
        Ok(Some(SessionChange { before, after }))
    }

    async fn claim_warning(&self, id: &Uuid, starts_at: DateTime<Utc>) -> Result<bool, AppError> {
        let mut store = self.store.lock().await;
        if store.failing_claims.contains(id) {
            return Err(AppError::from(sqlx::Error::PoolTimedOut));
        }
        match store.sessions.iter_mut().find(|session| session.id == *id) {
            Some(session) if session.starts_at == starts_at && session.status == SessionStatus::Planned && !session.warned => {
                session.warned = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_warning(&self, id: &Uuid, starts_at: DateTime<Utc>) -> Result<bool, AppError> {
        let mut store = self.store.lock().await;
        match store.sessions.iter_mut().find(|session| session.id == *id) {
            Some(session) if session.starts_at == starts_at && session.warned => {
                session.warned = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_session(&self, id: &Uuid) -> Result<Option<DeletedSession>, AppError> {
        let mut store = self.store.lock().await;
        let Some(details) = store.sessions.iter().find(|session| session.id == *id).map(|session| store.details(session)) else {
            return Ok(None);
        };

        store.sessions.retain(|session| session.id != *id);
        store.enrollments.retain(|(session_id, _)| session_id != id);

        Ok(Some(DeletedSession {
            session_id: details.session.id,
            snapshot: SessionSnapshot::from(&details),
            participants: details.participants,
        }))
    }

    async fn register_participant(&self, session_id: &Uuid, participant_id: &Uuid) -> Result<bool, AppError> {
        let mut store = self.store.lock().await;
        if !store.sessions.iter().any(|session| session.id == *session_id) {
            return Err(AppError::NotFound("Session not found".to_string()));
        }
        if !store.participants.iter().any(|p| p.id == *participant_id) {
            return Err(AppError::NotFound("Participant not found".to_string()));
        }
        if store.enrollments.contains(&(*session_id, *participant_id)) {
            return Ok(false);
        }
        store.enrollments.push((*session_id, *participant_id));
        Ok(true)
    }
}

/// Messenger double that records every successful send.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(ChatId, String)>>,
    attempts: Mutex<usize>,
    failing: HashSet<ChatId>,
    fail_all: bool,
}

impl RecordingMessenger {
    pub fn failing_for(chat_ids: &[ChatId]) -> Self {
        Self {
            failing: chat_ids.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    pub async fn sent(&self) -> Vec<(ChatId, String)> {
        self.sent.lock().await.clone()
    }

    pub async fn attempts(&self) -> usize {
        *self.attempts.lock().await
    }
}

#[async_trait::async_trait]
impl Messenger for RecordingMessenger {
    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<(), DeliveryError> {
        *self.attempts.lock().await += 1;
        // Give other tasks a chance to run mid-delivery, like a real network call.
        tokio::task::yield_now().await;
        if self.fail_all || self.failing.contains(&chat_id) {
            return Err(DeliveryError::Rejected {
                status: 403,
                description: "Forbidden: bot was blocked by the user".to_string(),
            });
        }
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }
}
