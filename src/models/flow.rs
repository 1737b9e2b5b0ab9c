use crate::error::app_error::AppError;
use crate::models::session::SessionStatus;
use rocket::serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of whoever drives a guided flow (the inbound channel's user id).
pub type ActorId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Date,
    Duration,
    Status,
    Instructor,
    Location,
    Comment,
    Delete,
}

impl EditAction {
    pub const ALL: [EditAction; 7] = [
        EditAction::Date,
        EditAction::Duration,
        EditAction::Status,
        EditAction::Instructor,
        EditAction::Location,
        EditAction::Comment,
        EditAction::Delete,
    ];

    fn as_token(&self) -> &'static str {
        match self {
            EditAction::Date => "edit_date",
            EditAction::Duration => "edit_duration",
            EditAction::Status => "edit_status",
            EditAction::Instructor => "edit_instructor",
            EditAction::Location => "edit_location",
            EditAction::Comment => "edit_comment",
            EditAction::Delete => "delete",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EditAction::Date => "Change date and time",
            EditAction::Duration => "Change duration",
            EditAction::Status => "Change status",
            EditAction::Instructor => "Change instructor",
            EditAction::Location => "Change location",
            EditAction::Comment => "Change comment",
            EditAction::Delete => "Delete session",
        }
    }
}

/// Participant notification setting flipped from the settings menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingToggle {
    Notifications,
    Warning,
}

impl SettingToggle {
    fn as_token(&self) -> &'static str {
        match self {
            SettingToggle::Notifications => "notifications",
            SettingToggle::Warning => "warn_5min",
        }
    }
}

/// A discrete choice made by pressing a button rather than typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    StartCreate,
    StartManage,
    StartProfile,
    ShowSettings,
    Toggle(SettingToggle),
    Course(Uuid),
    Session(Uuid),
    Action(EditAction),
    Status(SessionStatus),
    ConfirmDelete,
    Cancel,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::StartCreate => f.write_str("create"),
            Selection::StartManage => f.write_str("manage"),
            Selection::StartProfile => f.write_str("profile"),
            Selection::ShowSettings => f.write_str("settings"),
            Selection::Toggle(toggle) => write!(f, "toggle:{}", toggle.as_token()),
            Selection::Course(id) => write!(f, "course:{id}"),
            Selection::Session(id) => write!(f, "session:{id}"),
            Selection::Action(action) => write!(f, "action:{}", action.as_token()),
            Selection::Status(status) => write!(f, "status:{status}"),
            Selection::ConfirmDelete => f.write_str("delete:confirm"),
            Selection::Cancel => f.write_str("cancel"),
        }
    }
}

impl FromStr for Selection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        match token {
            "create" => return Ok(Selection::StartCreate),
            "manage" => return Ok(Selection::StartManage),
            "profile" => return Ok(Selection::StartProfile),
            "settings" => return Ok(Selection::ShowSettings),
            "delete:confirm" => return Ok(Selection::ConfirmDelete),
            "cancel" => return Ok(Selection::Cancel),
            _ => {}
        }

        let (kind, value) = token.split_once(':').ok_or_else(|| format!("Unknown selection: {token}"))?;
        let parse_id = |value: &str| Uuid::parse_str(value).map_err(|err| format!("Invalid id in selection '{token}': {err}"));

        match kind {
            "course" => Ok(Selection::Course(parse_id(value)?)),
            "session" => Ok(Selection::Session(parse_id(value)?)),
            "status" => Ok(Selection::Status(value.parse()?)),
            "action" => EditAction::ALL
                .into_iter()
                .find(|action| action.as_token() == value)
                .map(Selection::Action)
                .ok_or_else(|| format!("Unknown action: {value}")),
            "toggle" => [SettingToggle::Notifications, SettingToggle::Warning]
                .into_iter()
                .find(|toggle| toggle.as_token() == value)
                .map(Selection::Toggle)
                .ok_or_else(|| format!("Unknown setting: {value}")),
            _ => Err(format!("Unknown selection: {token}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowInput {
    Text(String),
    Select(Selection),
}

impl FlowInput {
    pub fn is_cancel(&self) -> bool {
        match self {
            FlowInput::Select(Selection::Cancel) => true,
            FlowInput::Text(text) => {
                let text = text.trim();
                text.eq_ignore_ascii_case("cancel") || text.eq_ignore_ascii_case("/cancel")
            }
            FlowInput::Select(_) => false,
        }
    }
}

#[derive(Deserialize, Debug, JsonSchema)]
pub struct FlowEventRequest {
    pub actor_id: ActorId,
    pub text: Option<String>,
    pub selection: Option<String>,
}

impl FlowEventRequest {
    pub fn to_input(&self) -> Result<FlowInput, AppError> {
        match (&self.text, &self.selection) {
            (Some(text), None) => Ok(FlowInput::Text(text.clone())),
            (None, Some(token)) => token.parse::<Selection>().map(FlowInput::Select).map_err(AppError::BadRequest),
            _ => Err(AppError::BadRequest("Exactly one of text or selection must be provided".to_string())),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct ReplyOption {
    pub label: String,
    pub token: String,
}

impl ReplyOption {
    pub fn new(label: impl Into<String>, selection: Selection) -> Self {
        Self {
            label: label.into(),
            token: selection.to_string(),
        }
    }
}

/// One outbound prompt or confirmation per turn.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct FlowReply {
    pub text: String,
    pub options: Vec<ReplyOption>,
}

impl FlowReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: Vec::new(),
        }
    }

    pub fn with_options(text: impl Into<String>, options: Vec<ReplyOption>) -> Self {
        Self {
            text: text.into(),
            options,
        }
    }
}
