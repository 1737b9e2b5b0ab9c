use rocket::serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use uuid::Uuid;
use validator::Validate;

/// Delivery address on the outbound channel.
pub type ChatId = i64;

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Participant {
    pub id: Uuid,
    pub telegram_id: Option<ChatId>,
    pub name: String,
    pub contact: Option<String>,
    pub notifications_enabled: bool,
    pub warn_5min_opt_in: bool,
}

impl Participant {
    /// Chat to deliver change notices to, if the participant wants them and can be reached.
    pub fn change_recipient(&self) -> Option<ChatId> {
        self.telegram_id.filter(|_| self.notifications_enabled)
    }

    /// Chat to deliver "starting soon" warnings to.
    pub fn warning_recipient(&self) -> Option<ChatId> {
        self.change_recipient().filter(|_| self.warn_5min_opt_in)
    }
}

#[derive(Deserialize, Debug, Validate, JsonSchema)]
pub struct ParticipantRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(max = 128))]
    pub contact: Option<String>,
    pub telegram_id: Option<ChatId>,
    pub notifications_enabled: Option<bool>,
    pub warn_5min_opt_in: Option<bool>,
}

#[derive(Deserialize, Debug, Default, JsonSchema)]
pub struct ParticipantSettingsRequest {
    pub notifications_enabled: Option<bool>,
    pub warn_5min_opt_in: Option<bool>,
}

#[derive(Serialize, Debug, Clone, JsonSchema)]
pub struct ParticipantResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<ChatId>,
    pub notifications_enabled: bool,
    pub warn_5min_opt_in: bool,
}

impl From<&Participant> for ParticipantResponse {
    fn from(participant: &Participant) -> Self {
        Self {
            id: participant.id,
            name: participant.name.clone(),
            contact: participant.contact.clone(),
            telegram_id: participant.telegram_id,
            notifications_enabled: participant.notifications_enabled,
            warn_5min_opt_in: participant.warn_5min_opt_in,
        }
    }
}
