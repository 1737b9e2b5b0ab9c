use crate::error::app_error::AppError;
use crate::models::participant::Participant;
use crate::util::{format_local, normalize_text, parse_api_datetime};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rocket::serde::{Deserialize, Deserializer, Serialize};
use schemars::JsonSchema;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Planned,
    Completed,
    Canceled,
    Rescheduled,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 4] = [
        SessionStatus::Planned,
        SessionStatus::Completed,
        SessionStatus::Canceled,
        SessionStatus::Rescheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Planned => "planned",
            SessionStatus::Completed => "completed",
            SessionStatus::Canceled => "canceled",
            SessionStatus::Rescheduled => "rescheduled",
        }
    }

    /// Human-facing label used in messages.
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Planned => "Planned",
            SessionStatus::Completed => "Completed",
            SessionStatus::Canceled => "Canceled",
            SessionStatus::Rescheduled => "Rescheduled",
        }
    }

    /// Statuses that can still be managed through the editing flow.
    pub fn is_manageable(&self) -> bool {
        matches!(self, SessionStatus::Planned | SessionStatus::Rescheduled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown session status: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub course_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub instructor: Option<String>,
    pub location: Option<String>,
    pub status: SessionStatus,
    pub comment: Option<String>,
    /// A "starting soon" notice went out for the current `starts_at`.
    pub warned: bool,
}

/// A session joined with its course name and enrolled participants.
#[derive(Debug, Clone)]
pub struct SessionDetails {
    pub session: Session,
    pub course_name: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub course_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub instructor: Option<String>,
    pub location: Option<String>,
    pub status: SessionStatus,
    pub comment: Option<String>,
}

/// Field-level changes to apply to one session. `None` leaves a field alone; for
/// nullable fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub starts_at: Option<DateTime<Utc>>,
    pub status: Option<SessionStatus>,
    pub comment: Option<Option<String>>,
    pub duration_minutes: Option<i32>,
    pub instructor: Option<Option<String>>,
    pub location: Option<Option<String>>,
}

impl SessionPatch {
    /// Applies the patch to `before`. Returns the resulting session when at least one
    /// field actually changes. A new start time or status always clears `warned`.
    pub fn apply(&self, before: &Session) -> Option<Session> {
        let mut after = before.clone();

        if let Some(starts_at) = self.starts_at {
            after.starts_at = starts_at;
        }
        if let Some(status) = self.status {
            after.status = status;
        }
        if let Some(comment) = &self.comment {
            after.comment = comment.clone();
        }
        if let Some(duration) = self.duration_minutes {
            after.duration_minutes = duration;
        }
        if let Some(instructor) = &self.instructor {
            after.instructor = instructor.clone();
        }
        if let Some(location) = &self.location {
            after.location = location.clone();
        }

        if after == *before {
            return None;
        }

        if after.starts_at != before.starts_at || after.status != before.status {
            after.warned = false;
        }

        Some(after)
    }
}

/// Before/after pair describing one committed update.
#[derive(Debug, Clone)]
pub struct SessionChange {
    pub before: Session,
    pub after: Session,
}

impl SessionChange {
    pub fn session_id(&self) -> Uuid {
        self.after.id
    }

    /// Picks the single notification text for a multi-field update. Only the highest
    /// priority change is reported: status (canceled/rescheduled), start time,
    /// location, instructor, then a generic message.
    pub fn summary(&self) -> String {
        let (before, after) = (&self.before, &self.after);

        if before.status != after.status && matches!(after.status, SessionStatus::Canceled | SessionStatus::Rescheduled) {
            format!("Session status changed to: {}", after.status.label())
        } else if before.starts_at != after.starts_at {
            "Session start time changed.".to_string()
        } else if before.location != after.location {
            "Session location changed.".to_string()
        } else if before.instructor != after.instructor {
            "Session instructor changed.".to_string()
        } else {
            "Session was updated.".to_string()
        }
    }
}

/// What a notice needs to describe a session, detached from the stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub course_name: String,
    pub starts_at: DateTime<Utc>,
    pub location: Option<String>,
    pub instructor: Option<String>,
    pub comment: Option<String>,
}

impl From<&SessionDetails> for SessionSnapshot {
    fn from(details: &SessionDetails) -> Self {
        Self {
            course_name: details.course_name.clone(),
            starts_at: details.session.starts_at,
            location: details.session.location.clone(),
            instructor: details.session.instructor.clone(),
            comment: details.session.comment.clone(),
        }
    }
}

/// State captured inside the delete transaction, before the row disappears.
#[derive(Debug, Clone)]
pub struct DeletedSession {
    pub session_id: Uuid,
    pub snapshot: SessionSnapshot,
    pub participants: Vec<Participant>,
}

impl DeletedSession {
    pub fn summary(&self, tz: Tz) -> String {
        format!(
            "Session of course '{}' ({}) was canceled (deleted).",
            self.snapshot.course_name,
            format_local(&self.snapshot.starts_at, tz)
        )
    }
}

// ===== HTTP DTOs =====

/// Distinguishes an absent field from an explicit `null`.
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Deserialize, Debug, Validate, JsonSchema)]
pub struct SessionRequest {
    pub course_id: Uuid,
    /// ISO-8601; values without an offset are read in the schedule timezone.
    pub date_time: String,
    #[validate(range(min = 1))]
    pub duration_minutes: Option<i32>,
    #[validate(length(max = 128))]
    pub instructor: Option<String>,
    #[validate(length(max = 128))]
    pub location: Option<String>,
    pub status: Option<SessionStatus>,
    pub comment: Option<String>,
}

#[derive(Deserialize, Debug, Default, Validate, JsonSchema)]
pub struct SessionUpdateRequest {
    pub date_time: Option<String>,
    pub status: Option<SessionStatus>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub comment: Option<Option<String>>,
    #[validate(range(min = 1))]
    pub duration_minutes: Option<i32>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub instructor: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub location: Option<Option<String>>,
}

impl SessionRequest {
    pub fn to_new_session(&self, tz: Tz, default_duration_minutes: i32) -> Result<NewSession, AppError> {
        Ok(NewSession {
            course_id: self.course_id,
            starts_at: parse_date_time(&self.date_time, tz)?,
            duration_minutes: self.duration_minutes.unwrap_or(default_duration_minutes),
            instructor: self.instructor.as_deref().and_then(normalize_text),
            location: self.location.as_deref().and_then(normalize_text),
            status: self.status.unwrap_or_default(),
            comment: self.comment.as_deref().and_then(normalize_text),
        })
    }
}

impl SessionUpdateRequest {
    pub fn to_patch(&self, tz: Tz) -> Result<SessionPatch, AppError> {
        let clean = |value: &Option<Option<String>>| value.as_ref().map(|inner| inner.as_deref().and_then(normalize_text));
        Ok(SessionPatch {
            starts_at: self.date_time.as_deref().map(|raw| parse_date_time(raw, tz)).transpose()?,
            status: self.status,
            comment: clean(&self.comment),
            duration_minutes: self.duration_minutes,
            instructor: clean(&self.instructor),
            location: clean(&self.location),
        })
    }
}

fn parse_date_time(raw: &str, tz: Tz) -> Result<DateTime<Utc>, AppError> {
    parse_api_datetime(raw, tz).ok_or_else(|| AppError::BadRequest(format!("Invalid date_time '{raw}', expected ISO-8601")))
}

#[derive(Deserialize, Debug, JsonSchema)]
pub struct RegisterParticipantRequest {
    pub participant_id: Uuid,
}

#[derive(Serialize, Debug, JsonSchema)]
pub struct RegistrationResponse {
    pub status: &'static str,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct IdResponse {
    pub id: Uuid,
}

#[derive(Serialize, Debug, Clone, JsonSchema)]
pub struct ParticipantRef {
    pub id: Uuid,
    pub name: String,
}

#[derive(Serialize, Debug, Clone, JsonSchema)]
pub struct SessionResponse {
    pub id: Uuid,
    pub course_id: Uuid,
    pub course_name: String,
    /// Start time rendered in the schedule timezone.
    pub date_time: String,
    pub duration_minutes: i32,
    pub instructor: Option<String>,
    pub location: Option<String>,
    pub status: SessionStatus,
    pub comment: Option<String>,
    pub warned: bool,
    pub participants: Vec<ParticipantRef>,
}

impl SessionResponse {
    pub fn from_details(details: &SessionDetails, tz: Tz) -> Self {
        let session = &details.session;
        Self {
            id: session.id,
            course_id: session.course_id,
            course_name: details.course_name.clone(),
            date_time: session.starts_at.with_timezone(&tz).to_rfc3339(),
            duration_minutes: session.duration_minutes,
            instructor: session.instructor.clone(),
            location: session.location.clone(),
            status: session.status,
            comment: session.comment.clone(),
            warned: session.warned,
            participants: details
                .participants
                .iter()
                .map(|p| ParticipantRef {
                    id: p.id,
                    name: p.name.clone(),
                })
                .collect(),
        }
    }
}
