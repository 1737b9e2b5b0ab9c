use crate::database::course::CourseRepository;
use crate::database::participant::ParticipantRepository;
use crate::database::session::SessionRepository;
use crate::error::app_error::AppError;
use crate::models::flow::{ActorId, EditAction, FlowInput, FlowReply, ReplyOption, Selection, SettingToggle};
use crate::models::participant::{Participant, ParticipantSettingsRequest};
use crate::models::session::{NewSession, SessionDetails, SessionPatch, SessionStatus};
use crate::service::field_collector::{FieldCollector, FieldValue, FlowFields};
use crate::service::notifier::ChangeNotice;
use crate::util::{combine_local, format_local, normalize_text, parse_date, parse_duration_minutes, parse_time};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

const SKIP_TOKENS: [&str; 2] = ["-", "skip"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStep {
    SelectCourse,
    EnterDate,
    EnterTime,
    EnterDuration,
    EnterInstructor,
    EnterLocation,
    EnterComment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditStep {
    SelectSession,
    ActionMenu,
    EditDate,
    EditTime,
    EditDuration,
    EditStatus,
    EditInstructor,
    EditLocation,
    EditComment,
    ConfirmDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileStep {
    EnterName,
    EnterContact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Create(CreateStep),
    Edit(EditStep),
    Profile(ProfileStep),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputError {
    InvalidDate,
    InvalidTime,
    NonexistentLocalTime,
    InvalidDuration,
    InvalidStatus,
    EmptyName,
    SessionUnavailable,
    UnexpectedInput,
}

impl InputError {
    pub fn message(&self) -> &'static str {
        match self {
            InputError::InvalidDate => "Could not read that date. Use DD.MM.YYYY.",
            InputError::InvalidTime => "Could not read that time. Use HH:MM.",
            InputError::NonexistentLocalTime => "That time does not exist on this date (clock change). Pick another time.",
            InputError::InvalidDuration => "Duration must be a whole number of minutes greater than zero.",
            InputError::InvalidStatus => "Pick one of the offered statuses.",
            InputError::EmptyName => "The name cannot be empty.",
            InputError::SessionUnavailable => "That session can no longer be managed. Pick one from the list.",
            InputError::UnexpectedInput => "Please use one of the offered options.",
        }
    }
}

/// A single-field edit produced by the editing flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEdit {
    StartsAt(DateTime<Utc>),
    Duration(i32),
    Status(SessionStatus),
    Instructor(Option<String>),
    Location(Option<String>),
    Comment(Option<String>),
}

impl SessionEdit {
    pub fn patch(&self) -> SessionPatch {
        let mut patch = SessionPatch::default();
        match self {
            SessionEdit::StartsAt(ts) => patch.starts_at = Some(*ts),
            SessionEdit::Duration(minutes) => patch.duration_minutes = Some(*minutes),
            SessionEdit::Status(status) => patch.status = Some(*status),
            SessionEdit::Instructor(text) => patch.instructor = Some(text.clone()),
            SessionEdit::Location(text) => patch.location = Some(text.clone()),
            SessionEdit::Comment(text) => patch.comment = Some(text.clone()),
        }
        patch
    }

    pub fn summary(&self, tz: Tz) -> String {
        match self {
            SessionEdit::StartsAt(ts) => format!("Start time changed to {}", format_local(ts, tz)),
            SessionEdit::Duration(minutes) => format!("Duration changed to {minutes} minutes"),
            SessionEdit::Status(status) => format!("Status changed to {}", status.label()),
            SessionEdit::Instructor(Some(name)) => format!("Instructor changed to {name}"),
            SessionEdit::Instructor(None) => "Instructor removed".to_string(),
            SessionEdit::Location(Some(place)) => format!("Location changed to {place}"),
            SessionEdit::Location(None) => "Location removed".to_string(),
            SessionEdit::Comment(Some(text)) => format!("Comment updated: {text}"),
            SessionEdit::Comment(None) => "Comment removed".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commit {
    Create(NewSession),
    Edit { session_id: Uuid, edit: SessionEdit },
    Delete(Uuid),
    Profile { name: String, contact: Option<String> },
}

/// Outcome of feeding one input to the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Advance { next: FlowState, value: Option<FieldValue> },
    Reprompt(InputError),
    Commit(Commit),
    Cancel,
    /// The context lacks a value an earlier state should have stored.
    Inconsistent,
}

fn optional_text(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if SKIP_TOKENS.iter().any(|token| trimmed.eq_ignore_ascii_case(token)) {
        None
    } else {
        normalize_text(trimmed)
    }
}

fn resolve_start(fields: &FlowFields, text: &str, tz: Tz) -> Result<DateTime<Utc>, Step> {
    let time = parse_time(text).ok_or(Step::Reprompt(InputError::InvalidTime))?;
    let date = fields.date.ok_or(Step::Inconsistent)?;
    combine_local(date, time, tz).ok_or(Step::Reprompt(InputError::NonexistentLocalTime))
}

/// Pure transition table: (state, input) -> next state, re-prompt, or commit.
pub fn transition(state: FlowState, fields: &FlowFields, input: &FlowInput, tz: Tz) -> Step {
    if input.is_cancel() {
        return Step::Cancel;
    }

    match (state, input) {
        (FlowState::Create(step), input) => create_transition(step, fields, input, tz),
        (FlowState::Edit(step), input) => edit_transition(step, fields, input, tz),
        (FlowState::Profile(step), input) => profile_transition(step, fields, input),
    }
}

fn create_transition(step: CreateStep, fields: &FlowFields, input: &FlowInput, tz: Tz) -> Step {
    use CreateStep::*;

    let advance = |next: CreateStep, value: FieldValue| Step::Advance {
        next: FlowState::Create(next),
        value: Some(value),
    };

    match (step, input) {
        (SelectCourse, FlowInput::Select(Selection::Course(id))) => advance(EnterDate, FieldValue::Course(*id)),
        (EnterDate, FlowInput::Text(text)) => match parse_date(text) {
            Some(date) => advance(EnterTime, FieldValue::Date(date)),
            None => Step::Reprompt(InputError::InvalidDate),
        },
        (EnterTime, FlowInput::Text(text)) => match resolve_start(fields, text, tz) {
            Ok(starts_at) => advance(EnterDuration, FieldValue::StartsAt(starts_at)),
            Err(step) => step,
        },
        (EnterDuration, FlowInput::Text(text)) => match parse_duration_minutes(text) {
            Some(minutes) => advance(EnterInstructor, FieldValue::Duration(minutes)),
            None => Step::Reprompt(InputError::InvalidDuration),
        },
        (EnterInstructor, FlowInput::Text(text)) => advance(EnterLocation, FieldValue::Instructor(optional_text(text))),
        (EnterLocation, FlowInput::Text(text)) => advance(EnterComment, FieldValue::Location(optional_text(text))),
        (EnterComment, FlowInput::Text(text)) => {
            let (Some(course_id), Some(starts_at), Some(duration_minutes)) = (fields.course_id, fields.starts_at, fields.duration_minutes) else {
                return Step::Inconsistent;
            };
            Step::Commit(Commit::Create(NewSession {
                course_id,
                starts_at,
                duration_minutes,
                instructor: fields.instructor.clone(),
                location: fields.location.clone(),
                status: SessionStatus::Planned,
                comment: optional_text(text),
            }))
        }
        _ => Step::Reprompt(InputError::UnexpectedInput),
    }
}

fn edit_transition(step: EditStep, fields: &FlowFields, input: &FlowInput, tz: Tz) -> Step {
    use EditStep::*;

    if step == SelectSession {
        return match input {
            FlowInput::Select(Selection::Session(id)) => Step::Advance {
                next: FlowState::Edit(ActionMenu),
                value: Some(FieldValue::Session(*id)),
            },
            _ => Step::Reprompt(InputError::UnexpectedInput),
        };
    }

    let Some(session_id) = fields.session_id else {
        return Step::Inconsistent;
    };
    let edit = |edit: SessionEdit| Step::Commit(Commit::Edit { session_id, edit });

    match (step, input) {
        (ActionMenu, FlowInput::Select(Selection::Action(action))) => {
            let next = match action {
                EditAction::Date => EditDate,
                EditAction::Duration => EditDuration,
                EditAction::Status => EditStatus,
                EditAction::Instructor => EditInstructor,
                EditAction::Location => EditLocation,
                EditAction::Comment => EditComment,
                EditAction::Delete => ConfirmDelete,
            };
            Step::Advance {
                next: FlowState::Edit(next),
                value: None,
            }
        }
        (EditDate, FlowInput::Text(text)) => match parse_date(text) {
            Some(date) => Step::Advance {
                next: FlowState::Edit(EditTime),
                value: Some(FieldValue::Date(date)),
            },
            None => Step::Reprompt(InputError::InvalidDate),
        },
        (EditTime, FlowInput::Text(text)) => match resolve_start(fields, text, tz) {
            Ok(starts_at) => edit(SessionEdit::StartsAt(starts_at)),
            Err(step) => step,
        },
        (EditDuration, FlowInput::Text(text)) => match parse_duration_minutes(text) {
            Some(minutes) => edit(SessionEdit::Duration(minutes)),
            None => Step::Reprompt(InputError::InvalidDuration),
        },
        (EditStatus, FlowInput::Select(Selection::Status(status))) => edit(SessionEdit::Status(*status)),
        (EditStatus, FlowInput::Text(text)) => match text.parse::<SessionStatus>() {
            Ok(status) => edit(SessionEdit::Status(status)),
            Err(_) => Step::Reprompt(InputError::InvalidStatus),
        },
        (EditInstructor, FlowInput::Text(text)) => edit(SessionEdit::Instructor(optional_text(text))),
        (EditLocation, FlowInput::Text(text)) => edit(SessionEdit::Location(optional_text(text))),
        (EditComment, FlowInput::Text(text)) => edit(SessionEdit::Comment(optional_text(text))),
        (ConfirmDelete, FlowInput::Select(Selection::ConfirmDelete)) => Step::Commit(Commit::Delete(session_id)),
        _ => Step::Reprompt(InputError::UnexpectedInput),
    }
}

fn profile_transition(step: ProfileStep, fields: &FlowFields, input: &FlowInput) -> Step {
    match (step, input) {
        (ProfileStep::EnterName, FlowInput::Text(text)) => match normalize_text(text) {
            Some(name) => Step::Advance {
                next: FlowState::Profile(ProfileStep::EnterContact),
                value: Some(FieldValue::Name(name)),
            },
            None => Step::Reprompt(InputError::EmptyName),
        },
        (ProfileStep::EnterContact, FlowInput::Text(text)) => match &fields.name {
            Some(name) => Step::Commit(Commit::Profile {
                name: name.clone(),
                contact: optional_text(text),
            }),
            None => Step::Inconsistent,
        },
        _ => Step::Reprompt(InputError::UnexpectedInput),
    }
}

/// What one handled input produced: the reply for the actor and, after a commit,
/// the notice the caller should hand to the change notifier.
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub reply: FlowReply,
    pub notice: Option<ChangeNotice>,
}

impl FlowOutcome {
    fn reply(reply: FlowReply) -> Self {
        Self { reply, notice: None }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub tz: Tz,
    pub operators: HashSet<ActorId>,
    pub manage_lookback: Duration,
    pub manage_horizon: Duration,
}

/// Drives the session creation and editing flows for operators, and the profile and
/// settings screens for everyone.
pub struct LifecycleMachine<R> {
    repo: R,
    collector: Arc<FieldCollector<FlowState>>,
    settings: LifecycleSettings,
    actor_locks: Mutex<HashMap<ActorId, Arc<Mutex<()>>>>,
}

fn cancel_option() -> ReplyOption {
    ReplyOption::new("Cancel", Selection::Cancel)
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn profile_text(participant: &Participant) -> String {
    format!(
        "Name: {}\nGroup/company: {}",
        participant.name,
        participant.contact.as_deref().unwrap_or("not set")
    )
}

fn settings_reply(participant: &Participant, headline: Option<String>) -> FlowReply {
    let body = format!(
        "Your notification settings:\nChange notices: {}\nStarting-soon warnings: {}",
        on_off(participant.notifications_enabled),
        on_off(participant.warn_5min_opt_in)
    );
    let text = match headline {
        Some(headline) => format!("{headline}\n{body}"),
        None => body,
    };
    FlowReply::with_options(
        text,
        vec![
            ReplyOption::new("Toggle change notices", Selection::Toggle(SettingToggle::Notifications)),
            ReplyOption::new("Toggle starting-soon warnings", Selection::Toggle(SettingToggle::Warning)),
        ],
    )
}

fn missing_profile_reply() -> FlowReply {
    FlowReply::with_options(
        "Your profile is not set up yet. Fill it in first.",
        vec![ReplyOption::new("Fill in profile", Selection::StartProfile)],
    )
}

fn session_label(details: &SessionDetails, tz: Tz) -> String {
    format!("{}, {}", details.course_name, format_local(&details.session.starts_at, tz))
}

impl<R> LifecycleMachine<R>
where
    R: CourseRepository + ParticipantRepository + SessionRepository + 'static,
{
    pub fn new(repo: R, collector: Arc<FieldCollector<FlowState>>, settings: LifecycleSettings) -> Self {
        Self {
            repo,
            collector,
            settings,
            actor_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_operator(&self, actor: ActorId) -> bool {
        self.settings.operators.contains(&actor)
    }

    fn home_reply(&self, actor: ActorId) -> FlowReply {
        let mut options = Vec::new();
        if self.is_operator(actor) {
            options.push(ReplyOption::new("Create session", Selection::StartCreate));
            options.push(ReplyOption::new("Manage sessions", Selection::StartManage));
        }
        options.push(ReplyOption::new("My profile", Selection::StartProfile));
        options.push(ReplyOption::new("Notification settings", Selection::ShowSettings));
        FlowReply::with_options("What would you like to do?", options)
    }

    fn home_with(&self, actor: ActorId, text: impl Into<String>) -> FlowReply {
        let mut reply = self.home_reply(actor);
        reply.text = text.into();
        reply
    }

    /// Handles one input event. Steps for the same actor are applied in submission order.
    pub async fn handle(&self, actor: ActorId, input: FlowInput, now: DateTime<Utc>) -> FlowOutcome {
        let lock = self.actor_lock(actor).await;
        let _guard = lock.lock().await;

        match self.step(actor, input, now).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_not_found() => {
                self.collector.end(actor).await;
                info!(actor_id = actor, error = %err, "guided flow target disappeared");
                FlowOutcome::reply(self.home_with(actor, "The selected item was not found. It may have been deleted."))
            }
            Err(err) => {
                self.collector.end(actor).await;
                error!(actor_id = actor, error = %err, "guided flow failed");
                FlowOutcome::reply(self.home_with(actor, "Sorry, something went wrong. Please start again."))
            }
        }
    }

    async fn actor_lock(&self, actor: ActorId) -> Arc<Mutex<()>> {
        let mut locks = self.actor_locks.lock().await;
        Arc::clone(locks.entry(actor).or_default())
    }

    async fn step(&self, actor: ActorId, input: FlowInput, now: DateTime<Utc>) -> Result<FlowOutcome, AppError> {
        match input {
            FlowInput::Select(Selection::StartCreate | Selection::StartManage) if !self.is_operator(actor) => {
                return Ok(FlowOutcome::reply(self.home_with(
                    actor,
                    "Only operators can create or manage sessions. You will receive notifications about your sessions here.",
                )));
            }
            FlowInput::Select(Selection::StartCreate) => return self.start(actor, FlowState::Create(CreateStep::SelectCourse), now).await,
            FlowInput::Select(Selection::StartManage) => return self.start(actor, FlowState::Edit(EditStep::SelectSession), now).await,
            FlowInput::Select(Selection::StartProfile) => return self.start(actor, FlowState::Profile(ProfileStep::EnterName), now).await,
            FlowInput::Select(Selection::ShowSettings) => return self.show_settings(actor).await,
            FlowInput::Select(Selection::Toggle(toggle)) => return self.toggle_setting(actor, toggle).await,
            _ => {}
        }

        let Some(snapshot) = self.collector.get(actor).await else {
            return Ok(FlowOutcome::reply(self.home_reply(actor)));
        };

        match transition(snapshot.state, &snapshot.fields, &input, self.settings.tz) {
            Step::Cancel => {
                self.collector.end(actor).await;
                info!(actor_id = actor, "guided flow canceled");
                Ok(FlowOutcome::reply(self.home_with(actor, "Canceled. Nothing was saved.")))
            }
            Step::Reprompt(input_error) => self.reprompt(actor, snapshot.state, &snapshot.fields, input_error, now).await,
            Step::Advance { next, value } => {
                let mut fields = snapshot.fields;
                if let Some(value) = value {
                    if let Some(input_error) = self.check_target(&value, now).await? {
                        return self.reprompt(actor, snapshot.state, &fields, input_error, now).await;
                    }
                    self.collector.set(actor, value.clone()).await;
                    fields.store(value);
                }
                self.collector.move_to(actor, next).await;
                let reply = self.prompt(actor, next, &fields, now).await?;
                Ok(FlowOutcome::reply(reply))
            }
            Step::Commit(commit) => {
                let outcome = self.commit(actor, commit).await;
                self.collector.end(actor).await;
                outcome
            }
            Step::Inconsistent => Err(AppError::BadRequest("Guided flow context is incomplete".to_string())),
        }
    }

    async fn reprompt(
        &self,
        actor: ActorId,
        state: FlowState,
        fields: &FlowFields,
        input_error: InputError,
        now: DateTime<Utc>,
    ) -> Result<FlowOutcome, AppError> {
        let mut reply = self.prompt(actor, state, fields, now).await?;
        reply.text = format!("{}\n{}", input_error.message(), reply.text);
        Ok(FlowOutcome::reply(reply))
    }

    async fn start(&self, actor: ActorId, state: FlowState, now: DateTime<Utc>) -> Result<FlowOutcome, AppError> {
        if self.collector.begin(actor, state).await {
            info!(actor_id = actor, "previous guided flow discarded");
        }
        let reply = self.prompt(actor, state, &FlowFields::default(), now).await?;
        Ok(FlowOutcome::reply(reply))
    }

    /// Selected courses and sessions must still exist before the flow moves on. A session
    /// must also still be one the manage list would offer at `now`.
    async fn check_target(&self, value: &FieldValue, now: DateTime<Utc>) -> Result<Option<InputError>, AppError> {
        match value {
            FieldValue::Course(id) => match self.repo.get_course(id).await? {
                Some(_) => Ok(None),
                None => Err(AppError::NotFound("Course not found".to_string())),
            },
            FieldValue::Session(id) => {
                let details = self
                    .repo
                    .get_session_details(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;
                let session = &details.session;
                let in_range = session.starts_at >= now - self.settings.manage_lookback && session.starts_at <= now + self.settings.manage_horizon;
                if session.status.is_manageable() && in_range {
                    Ok(None)
                } else {
                    Ok(Some(InputError::SessionUnavailable))
                }
            }
            _ => Ok(None),
        }
    }

    async fn show_settings(&self, actor: ActorId) -> Result<FlowOutcome, AppError> {
        let reply = match self.repo.get_participant_by_telegram_id(actor).await? {
            Some(participant) => settings_reply(&participant, None),
            None => missing_profile_reply(),
        };
        Ok(FlowOutcome::reply(reply))
    }

    async fn toggle_setting(&self, actor: ActorId, toggle: SettingToggle) -> Result<FlowOutcome, AppError> {
        let Some(participant) = self.repo.get_participant_by_telegram_id(actor).await? else {
            return Ok(FlowOutcome::reply(missing_profile_reply()));
        };

        let request = match toggle {
            SettingToggle::Notifications => ParticipantSettingsRequest {
                notifications_enabled: Some(!participant.notifications_enabled),
                ..ParticipantSettingsRequest::default()
            },
            SettingToggle::Warning => ParticipantSettingsRequest {
                warn_5min_opt_in: Some(!participant.warn_5min_opt_in),
                ..ParticipantSettingsRequest::default()
            },
        };
        let updated = self
            .repo
            .update_participant_settings(&participant.id, &request)
            .await?
            .ok_or_else(|| AppError::NotFound("Participant not found".to_string()))?;

        let headline = match toggle {
            SettingToggle::Notifications => format!("Change notices are now {}.", on_off(updated.notifications_enabled)),
            SettingToggle::Warning => format!("Starting-soon warnings are now {}.", on_off(updated.warn_5min_opt_in)),
        };
        info!(actor_id = actor, participant_id = %updated.id, setting = ?toggle, "participant setting toggled");
        Ok(FlowOutcome::reply(settings_reply(&updated, Some(headline))))
    }

    async fn load_target(&self, fields: &FlowFields) -> Result<SessionDetails, AppError> {
        let id = fields.session_id.ok_or_else(|| AppError::BadRequest("Guided flow context is incomplete".to_string()))?;
        self.repo
            .get_session_details(&id)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))
    }

    async fn prompt(&self, actor: ActorId, state: FlowState, fields: &FlowFields, now: DateTime<Utc>) -> Result<FlowReply, AppError> {
        let tz = self.settings.tz;
        let text_prompt = |text: &str| -> Result<FlowReply, AppError> { Ok(FlowReply::with_options(text, vec![cancel_option()])) };

        match state {
            FlowState::Create(CreateStep::SelectCourse) => {
                let courses = self.repo.list_courses().await?;
                if courses.is_empty() {
                    self.collector.end(actor).await;
                    return Ok(FlowReply::text("There are no courses yet. Create a course first."));
                }
                let mut options: Vec<ReplyOption> = courses.iter().map(|course| ReplyOption::new(&course.name, Selection::Course(course.id))).collect();
                options.push(cancel_option());
                Ok(FlowReply::with_options("Choose a course:", options))
            }
            FlowState::Create(CreateStep::EnterDate) | FlowState::Edit(EditStep::EditDate) => text_prompt("Enter the session date (DD.MM.YYYY):"),
            FlowState::Create(CreateStep::EnterTime) | FlowState::Edit(EditStep::EditTime) => text_prompt("Enter the start time (HH:MM):"),
            FlowState::Create(CreateStep::EnterDuration) | FlowState::Edit(EditStep::EditDuration) => text_prompt("Enter the duration in minutes:"),
            FlowState::Create(CreateStep::EnterInstructor) | FlowState::Edit(EditStep::EditInstructor) => {
                text_prompt("Enter the instructor name, or '-' to leave it empty:")
            }
            FlowState::Create(CreateStep::EnterLocation) | FlowState::Edit(EditStep::EditLocation) => text_prompt("Enter the location, or '-' to leave it empty:"),
            FlowState::Create(CreateStep::EnterComment) | FlowState::Edit(EditStep::EditComment) => text_prompt("Enter a comment, or 'skip' for none:"),
            FlowState::Edit(EditStep::SelectSession) => {
                let from = now - self.settings.manage_lookback;
                let to = now + self.settings.manage_horizon;
                let sessions = self.repo.list_manageable_sessions(from, to).await?;
                if sessions.is_empty() {
                    self.collector.end(actor).await;
                    return Ok(FlowReply::text("There are no upcoming sessions to manage."));
                }
                let mut options: Vec<ReplyOption> = sessions
                    .iter()
                    .map(|details| ReplyOption::new(session_label(details, tz), Selection::Session(details.session.id)))
                    .collect();
                options.push(cancel_option());
                Ok(FlowReply::with_options("Choose a session:", options))
            }
            FlowState::Edit(EditStep::ActionMenu) => {
                let details = self.load_target(fields).await?;
                let session = &details.session;
                let text = format!(
                    "{}\nDuration: {} min\nInstructor: {}\nLocation: {}\nStatus: {}\nComment: {}\n\nWhat do you want to change?",
                    session_label(&details, tz),
                    session.duration_minutes,
                    session.instructor.as_deref().unwrap_or("not set"),
                    session.location.as_deref().unwrap_or("not set"),
                    session.status.label(),
                    session.comment.as_deref().unwrap_or("none"),
                );
                let mut options: Vec<ReplyOption> = EditAction::ALL.iter().map(|action| ReplyOption::new(action.label(), Selection::Action(*action))).collect();
                options.push(cancel_option());
                Ok(FlowReply::with_options(text, options))
            }
            FlowState::Edit(EditStep::EditStatus) => {
                let mut options: Vec<ReplyOption> = SessionStatus::ALL.iter().map(|status| ReplyOption::new(status.label(), Selection::Status(*status))).collect();
                options.push(cancel_option());
                Ok(FlowReply::with_options("Choose the new status:", options))
            }
            FlowState::Edit(EditStep::ConfirmDelete) => {
                let details = self.load_target(fields).await?;
                Ok(FlowReply::with_options(
                    format!("Delete the session {}? Participants will be notified.", session_label(&details, tz)),
                    vec![ReplyOption::new("Yes, delete", Selection::ConfirmDelete), cancel_option()],
                ))
            }
            FlowState::Profile(ProfileStep::EnterName) => match self.repo.get_participant_by_telegram_id(actor).await? {
                Some(participant) => text_prompt(&format!("Your profile:\n{}\n\nEnter your full name to update it:", profile_text(&participant))),
                None => text_prompt("Your profile is not set up yet. Enter your full name:"),
            },
            FlowState::Profile(ProfileStep::EnterContact) => text_prompt("Enter your group or company, or '-' to leave it empty:"),
        }
    }

    async fn commit(&self, actor: ActorId, commit: Commit) -> Result<FlowOutcome, AppError> {
        let tz = self.settings.tz;
        match commit {
            Commit::Create(new_session) => {
                let session = self.repo.create_session(&new_session).await?;
                info!(actor_id = actor, session_id = %session.id, "session created through guided flow");
                Ok(FlowOutcome::reply(self.home_with(actor, format!("Session created for {}.", format_local(&session.starts_at, tz)))))
            }
            Commit::Edit { session_id, edit } => {
                let mut reply = self.home_reply(actor);
                match self.repo.apply_session_patch(&session_id, &edit.patch()).await? {
                    Some(_) => {
                        let summary = edit.summary(tz);
                        info!(actor_id = actor, session_id = %session_id, summary = %summary, "session edited through guided flow");
                        reply.text = format!("Saved. {summary}.");
                        Ok(FlowOutcome {
                            reply,
                            notice: Some(ChangeNotice::Updated { session_id, summary }),
                        })
                    }
                    None => {
                        reply.text = "Nothing changed, the session already has that value.".to_string();
                        Ok(FlowOutcome::reply(reply))
                    }
                }
            }
            Commit::Delete(session_id) => {
                let deleted = self
                    .repo
                    .delete_session(&session_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;
                info!(actor_id = actor, session_id = %session_id, "session deleted through guided flow");
                let summary = deleted.summary(tz);
                Ok(FlowOutcome {
                    reply: self.home_with(actor, "Session deleted."),
                    notice: Some(ChangeNotice::Deleted { deleted, summary }),
                })
            }
            Commit::Profile { name, contact } => {
                let participant = self.repo.upsert_participant_profile(actor, &name, contact.as_deref()).await?;
                info!(actor_id = actor, participant_id = %participant.id, "participant profile saved");
                Ok(FlowOutcome::reply(self.home_with(actor, format!("Profile saved.\n{}", profile_text(&participant)))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{InMemoryRepository, sample_participant};
    use chrono::{NaiveDate, TimeZone};

    const OPERATOR: ActorId = 100;

    fn text(value: &str) -> FlowInput {
        FlowInput::Text(value.to_string())
    }

    fn select(selection: Selection) -> FlowInput {
        FlowInput::Select(selection)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 30, 12, 0, 0).unwrap()
    }

    fn machine(repo: &InMemoryRepository) -> LifecycleMachine<InMemoryRepository> {
        LifecycleMachine::new(
            repo.clone(),
            Arc::new(FieldCollector::new()),
            LifecycleSettings {
                tz: chrono_tz::UTC,
                operators: HashSet::from([OPERATOR]),
                manage_lookback: Duration::minutes(60),
                manage_horizon: Duration::days(60),
            },
        )
    }

    async fn current_state(machine: &LifecycleMachine<InMemoryRepository>) -> Option<FlowState> {
        machine.collector.get(OPERATOR).await.map(|snapshot| snapshot.state)
    }

    #[test]
    fn invalid_inputs_reprompt_without_advancing() {
        let fields = FlowFields {
            date: NaiveDate::from_ymd_opt(2024, 6, 1),
            session_id: Some(Uuid::new_v4()),
            ..FlowFields::default()
        };
        let tz = chrono_tz::UTC;
        let cases = [
            (FlowState::Create(CreateStep::EnterDate), "32.13.2024", InputError::InvalidDate),
            (FlowState::Create(CreateStep::EnterTime), "25:99", InputError::InvalidTime),
            (FlowState::Create(CreateStep::EnterDuration), "0", InputError::InvalidDuration),
            (FlowState::Create(CreateStep::EnterDuration), "ninety", InputError::InvalidDuration),
            (FlowState::Edit(EditStep::EditDate), "yesterday", InputError::InvalidDate),
            (FlowState::Edit(EditStep::EditTime), "noon", InputError::InvalidTime),
            (FlowState::Edit(EditStep::EditDuration), "-15", InputError::InvalidDuration),
        ];
        for (state, input, expected) in cases {
            assert_eq!(transition(state, &fields, &text(input), tz), Step::Reprompt(expected), "state {state:?}");
        }
    }

    #[test]
    fn comment_skip_sentinel_means_no_comment() {
        let fields = FlowFields {
            course_id: Some(Uuid::new_v4()),
            starts_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap()),
            duration_minutes: Some(90),
            ..FlowFields::default()
        };
        for sentinel in ["skip", "-", "SKIP"] {
            match transition(FlowState::Create(CreateStep::EnterComment), &fields, &text(sentinel), chrono_tz::UTC) {
                Step::Commit(Commit::Create(new_session)) => assert_eq!(new_session.comment, None),
                other => panic!("unexpected step {other:?}"),
            }
        }
    }

    #[test]
    fn cancel_is_accepted_in_every_state() {
        let fields = FlowFields::default();
        for state in [
            FlowState::Create(CreateStep::EnterTime),
            FlowState::Edit(EditStep::ConfirmDelete),
            FlowState::Edit(EditStep::SelectSession),
            FlowState::Profile(ProfileStep::EnterContact),
        ] {
            assert_eq!(transition(state, &fields, &text("/cancel"), chrono_tz::UTC), Step::Cancel);
            assert_eq!(transition(state, &fields, &select(Selection::Cancel), chrono_tz::UTC), Step::Cancel);
        }
    }

    #[test]
    fn edit_summaries_name_the_field() {
        assert_eq!(SessionEdit::Status(SessionStatus::Canceled).summary(chrono_tz::UTC), "Status changed to Canceled");
        assert_eq!(SessionEdit::Location(None).summary(chrono_tz::UTC), "Location removed");
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap();
        assert_eq!(SessionEdit::StartsAt(ts).summary(chrono_tz::UTC), "Start time changed to 01.06.2024 14:30");
    }

    #[test]
    fn local_input_is_read_in_schedule_timezone() {
        let fields = FlowFields {
            date: NaiveDate::from_ymd_opt(2024, 6, 1),
            ..FlowFields::default()
        };
        match transition(FlowState::Create(CreateStep::EnterTime), &fields, &text("14:30"), chrono_tz::Europe::Moscow) {
            Step::Advance {
                value: Some(FieldValue::StartsAt(ts)),
                ..
            } => assert_eq!(ts, Utc.with_ymd_and_hms(2024, 6, 1, 11, 30, 0).unwrap()),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[tokio::test]
    async fn creation_flow_creates_one_planned_session() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let machine = machine(&repo);

        let outcome = machine.handle(OPERATOR, select(Selection::StartCreate), now()).await;
        assert!(outcome.reply.options.iter().any(|option| option.token == format!("course:{}", course.id)));

        machine.handle(OPERATOR, select(Selection::Course(course.id)), now()).await;
        machine.handle(OPERATOR, text("01.06.2024"), now()).await;
        machine.handle(OPERATOR, text("14:30"), now()).await;
        machine.handle(OPERATOR, text("90"), now()).await;
        machine.handle(OPERATOR, text("Dr. Lin"), now()).await;
        machine.handle(OPERATOR, text("Room 305"), now()).await;
        let outcome = machine.handle(OPERATOR, text("skip"), now()).await;

        assert!(outcome.notice.is_none());
        assert!(current_state(&machine).await.is_none());

        let sessions = repo.sessions().await;
        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.course_id, course.id);
        assert_eq!(session.starts_at, Utc.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap());
        assert_eq!(session.duration_minutes, 90);
        assert_eq!(session.instructor.as_deref(), Some("Dr. Lin"));
        assert_eq!(session.location.as_deref(), Some("Room 305"));
        assert_eq!(session.comment, None);
        assert_eq!(session.status, SessionStatus::Planned);
        assert!(!session.warned);
    }

    #[tokio::test]
    async fn invalid_input_keeps_state_and_writes_nothing() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let machine = machine(&repo);

        machine.handle(OPERATOR, select(Selection::StartCreate), now()).await;
        machine.handle(OPERATOR, select(Selection::Course(course.id)), now()).await;
        let outcome = machine.handle(OPERATOR, text("not a date"), now()).await;

        assert!(outcome.reply.text.starts_with(InputError::InvalidDate.message()));
        assert_eq!(current_state(&machine).await, Some(FlowState::Create(CreateStep::EnterDate)));

        machine.handle(OPERATOR, text("01.06.2024"), now()).await;
        machine.handle(OPERATOR, text("14:30"), now()).await;
        machine.handle(OPERATOR, text("0"), now()).await;
        assert_eq!(current_state(&machine).await, Some(FlowState::Create(CreateStep::EnterDuration)));
        assert!(repo.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_discards_context_without_writing() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let machine = machine(&repo);

        machine.handle(OPERATOR, select(Selection::StartCreate), now()).await;
        machine.handle(OPERATOR, select(Selection::Course(course.id)), now()).await;
        machine.handle(OPERATOR, text("cancel"), now()).await;

        assert!(current_state(&machine).await.is_none());
        assert!(repo.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn starting_a_new_flow_replaces_the_old_one() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        repo.add_session(course.id, now() + Duration::days(1)).await;
        let machine = machine(&repo);

        machine.handle(OPERATOR, select(Selection::StartCreate), now()).await;
        machine.handle(OPERATOR, select(Selection::Course(course.id)), now()).await;
        machine.handle(OPERATOR, select(Selection::StartManage), now()).await;

        assert_eq!(current_state(&machine).await, Some(FlowState::Edit(EditStep::SelectSession)));
    }

    #[tokio::test]
    async fn non_operators_cannot_start_flows() {
        let repo = InMemoryRepository::default();
        repo.add_course("Algebra").await;
        let machine = machine(&repo);

        for start in [Selection::StartCreate, Selection::StartManage] {
            let outcome = machine.handle(7, select(start), now()).await;
            assert!(outcome.reply.text.starts_with("Only operators"));
            let tokens: Vec<&str> = outcome.reply.options.iter().map(|option| option.token.as_str()).collect();
            assert_eq!(tokens, vec!["profile", "settings"]);
            assert!(machine.collector.get(7).await.is_none());
        }
    }

    #[tokio::test]
    async fn profile_flow_binds_participant_to_actor() {
        let repo = InMemoryRepository::default();
        let machine = machine(&repo);

        let outcome = machine.handle(7, select(Selection::StartProfile), now()).await;
        assert!(outcome.reply.text.contains("not set up yet"));
        machine.handle(7, text("  Ada Lovelace "), now()).await;
        let outcome = machine.handle(7, text("P2023"), now()).await;

        assert!(outcome.reply.text.starts_with("Profile saved."));
        assert!(machine.collector.get(7).await.is_none());
        let participant = repo.get_participant_by_telegram_id(7).await.unwrap().unwrap();
        assert_eq!(participant.name, "Ada Lovelace");
        assert_eq!(participant.contact.as_deref(), Some("P2023"));
        assert!(participant.notifications_enabled);
        assert!(!participant.warn_5min_opt_in);
    }

    #[tokio::test]
    async fn rerunning_profile_flow_updates_the_same_participant() {
        let repo = InMemoryRepository::default();
        let existing = repo.add_participant(sample_participant(Some(7), false, true)).await;
        let machine = machine(&repo);

        let outcome = machine.handle(7, select(Selection::StartProfile), now()).await;
        assert!(outcome.reply.text.contains("Name: Participant 7"));
        machine.handle(7, text("Ada Lovelace"), now()).await;
        machine.handle(7, text("-"), now()).await;

        let participant = repo.get_participant_by_telegram_id(7).await.unwrap().unwrap();
        assert_eq!(participant.id, existing.id);
        assert_eq!(participant.name, "Ada Lovelace");
        assert_eq!(participant.contact, None);
        assert!(!participant.notifications_enabled);
        assert!(participant.warn_5min_opt_in);
    }

    #[tokio::test]
    async fn blank_profile_name_reprompts() {
        let repo = InMemoryRepository::default();
        let machine = machine(&repo);

        machine.handle(7, select(Selection::StartProfile), now()).await;
        let outcome = machine.handle(7, text("   "), now()).await;

        assert!(outcome.reply.text.starts_with(InputError::EmptyName.message()));
        assert_eq!(
            machine.collector.get(7).await.map(|snapshot| snapshot.state),
            Some(FlowState::Profile(ProfileStep::EnterName))
        );
        assert!(repo.get_participant_by_telegram_id(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settings_toggles_flip_participant_flags() {
        let repo = InMemoryRepository::default();
        repo.add_participant(sample_participant(Some(7), true, false)).await;
        let machine = machine(&repo);

        let outcome = machine.handle(7, select(Selection::ShowSettings), now()).await;
        assert!(outcome.reply.text.contains("Starting-soon warnings: off"));
        let tokens: Vec<&str> = outcome.reply.options.iter().map(|option| option.token.as_str()).collect();
        assert_eq!(tokens, vec!["toggle:notifications", "toggle:warn_5min"]);

        let outcome = machine.handle(7, select(Selection::Toggle(SettingToggle::Warning)), now()).await;
        assert!(outcome.reply.text.starts_with("Starting-soon warnings are now on."));
        machine.handle(7, select(Selection::Toggle(SettingToggle::Notifications)), now()).await;

        let participant = repo.get_participant_by_telegram_id(7).await.unwrap().unwrap();
        assert!(participant.warn_5min_opt_in);
        assert!(!participant.notifications_enabled);
    }

    #[tokio::test]
    async fn settings_without_profile_point_to_profile() {
        let repo = InMemoryRepository::default();
        let machine = machine(&repo);

        let outcome = machine.handle(7, select(Selection::Toggle(SettingToggle::Notifications)), now()).await;

        assert!(outcome.reply.text.contains("not set up yet"));
        assert_eq!(outcome.reply.options, vec![ReplyOption::new("Fill in profile", Selection::StartProfile)]);
        assert!(repo.get_participant_by_telegram_id(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn manage_list_only_offers_upcoming_active_sessions() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let later = repo.add_session(course.id, now() + Duration::days(2)).await;
        let sooner = repo.add_session(course.id, now() + Duration::hours(3)).await;
        let canceled = repo.add_session(course.id, now() + Duration::days(1)).await;
        repo.set_status(&canceled.id, SessionStatus::Canceled).await;
        repo.add_session(course.id, now() - Duration::hours(2)).await;
        repo.add_session(course.id, now() + Duration::days(90)).await;
        let machine = machine(&repo);

        let outcome = machine.handle(OPERATOR, select(Selection::StartManage), now()).await;
        let tokens: Vec<String> = outcome.reply.options.iter().map(|option| option.token.clone()).collect();
        assert_eq!(
            tokens,
            vec![format!("session:{}", sooner.id), format!("session:{}", later.id), "cancel".to_string()]
        );
    }

    #[tokio::test]
    async fn selecting_a_session_outside_the_manage_list_reprompts() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let listed = repo.add_session(course.id, now() + Duration::days(1)).await;
        let completed = repo.add_session(course.id, now() + Duration::days(2)).await;
        repo.set_status(&completed.id, SessionStatus::Completed).await;
        let past = repo.add_session(course.id, now() - Duration::hours(3)).await;
        let machine = machine(&repo);

        machine.handle(OPERATOR, select(Selection::StartManage), now()).await;
        for stale in [completed.id, past.id] {
            let outcome = machine.handle(OPERATOR, select(Selection::Session(stale)), now()).await;
            assert!(outcome.reply.text.starts_with(InputError::SessionUnavailable.message()));
            assert!(outcome.reply.options.iter().any(|option| option.token == format!("session:{}", listed.id)));
            assert_eq!(current_state(&machine).await, Some(FlowState::Edit(EditStep::SelectSession)));
        }

        machine.handle(OPERATOR, select(Selection::Session(listed.id)), now()).await;
        assert_eq!(current_state(&machine).await, Some(FlowState::Edit(EditStep::ActionMenu)));
    }

    async fn open_edit(machine: &LifecycleMachine<InMemoryRepository>, session_id: Uuid, action: EditAction) {
        machine.handle(OPERATOR, select(Selection::StartManage), now()).await;
        machine.handle(OPERATOR, select(Selection::Session(session_id)), now()).await;
        machine.handle(OPERATOR, select(Selection::Action(action)), now()).await;
    }

    #[tokio::test]
    async fn editing_date_clears_warned_and_emits_notice() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let session = repo.add_session(course.id, now() + Duration::days(1)).await;
        repo.set_warned(&session.id, true).await;
        let machine = machine(&repo);

        open_edit(&machine, session.id, EditAction::Date).await;
        machine.handle(OPERATOR, text("05.06.2024"), now()).await;
        let outcome = machine.handle(OPERATOR, text("10:00"), now()).await;

        let stored = repo.session(&session.id).await.unwrap();
        assert_eq!(stored.starts_at, Utc.with_ymd_and_hms(2024, 6, 5, 10, 0, 0).unwrap());
        assert!(!stored.warned);
        assert_eq!(stored.status, SessionStatus::Planned);
        match outcome.notice {
            Some(ChangeNotice::Updated { session_id, summary }) => {
                assert_eq!(session_id, session.id);
                assert_eq!(summary, "Start time changed to 05.06.2024 10:00");
            }
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[tokio::test]
    async fn editing_status_to_cancel_clears_warned() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let session = repo.add_session(course.id, now() + Duration::days(1)).await;
        repo.set_warned(&session.id, true).await;
        let machine = machine(&repo);

        open_edit(&machine, session.id, EditAction::Status).await;
        let outcome = machine.handle(OPERATOR, select(Selection::Status(SessionStatus::Canceled)), now()).await;

        let stored = repo.session(&session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Canceled);
        assert!(!stored.warned);
        assert!(matches!(outcome.notice, Some(ChangeNotice::Updated { ref summary, .. }) if summary == "Status changed to Canceled"));
    }

    #[tokio::test]
    async fn editing_status_to_same_value_is_a_no_op() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let session = repo.add_session(course.id, now() + Duration::days(1)).await;
        repo.set_warned(&session.id, true).await;
        let machine = machine(&repo);

        open_edit(&machine, session.id, EditAction::Status).await;
        let outcome = machine.handle(OPERATOR, select(Selection::Status(SessionStatus::Planned)), now()).await;

        assert!(outcome.notice.is_none());
        assert_eq!(repo.write_count().await, 0);
        assert!(repo.session(&session.id).await.unwrap().warned);
    }

    #[tokio::test]
    async fn editing_comment_touches_only_comment() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let session = repo.add_session(course.id, now() + Duration::days(1)).await;
        let machine = machine(&repo);

        open_edit(&machine, session.id, EditAction::Comment).await;
        machine.handle(OPERATOR, text("Bring laptops"), now()).await;

        let stored = repo.session(&session.id).await.unwrap();
        assert_eq!(stored.comment.as_deref(), Some("Bring laptops"));
        assert_eq!(stored.starts_at, session.starts_at);
        assert_eq!(stored.location, session.location);
    }

    #[tokio::test]
    async fn delete_requires_confirmation_and_returns_snapshot() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let session = repo.add_session(course.id, Utc.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap()).await;
        let participant = repo.add_participant(sample_participant(Some(9), true, false)).await;
        repo.enroll(session.id, participant.id).await;
        let machine = machine(&repo);

        open_edit(&machine, session.id, EditAction::Delete).await;
        let outcome = machine.handle(OPERATOR, text("yes"), now()).await;
        assert!(outcome.notice.is_none());
        assert!(repo.session(&session.id).await.is_some());

        let outcome = machine.handle(OPERATOR, select(Selection::ConfirmDelete), now()).await;
        assert!(repo.session(&session.id).await.is_none());
        match outcome.notice {
            Some(ChangeNotice::Deleted { deleted, summary }) => {
                assert_eq!(deleted.snapshot.course_name, "Algebra");
                assert_eq!(deleted.participants.len(), 1);
                assert_eq!(summary, "Session of course 'Algebra' (01.06.2024 14:30) was canceled (deleted).");
            }
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[tokio::test]
    async fn vanished_session_ends_flow_with_not_found() {
        let repo = InMemoryRepository::default();
        let course = repo.add_course("Algebra").await;
        let session = repo.add_session(course.id, now() + Duration::days(1)).await;
        let machine = machine(&repo);

        open_edit(&machine, session.id, EditAction::Duration).await;
        repo.remove_session(&session.id).await;
        let outcome = machine.handle(OPERATOR, text("45"), now()).await;

        assert!(outcome.reply.text.contains("not found"));
        assert!(outcome.notice.is_none());
        assert!(current_state(&machine).await.is_none());
    }

    #[tokio::test]
    async fn idle_input_gets_home_menu() {
        let repo = InMemoryRepository::default();
        let machine = machine(&repo);

        let outcome = machine.handle(OPERATOR, text("hello"), now()).await;
        assert_eq!(outcome.reply, machine.home_reply(OPERATOR));
    }
}
