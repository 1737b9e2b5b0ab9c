use crate::database::session::SessionRepository;
use crate::error::app_error::AppError;
use crate::models::participant::Participant;
use crate::models::session::{DeletedSession, SessionSnapshot};
use crate::service::messenger::Messenger;
use crate::util::{escape_html, format_local};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Post-commit description of a change that participants should hear about.
#[derive(Debug, Clone)]
pub enum ChangeNotice {
    Updated { session_id: Uuid, summary: String },
    Deleted { deleted: DeletedSession, summary: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Renders the message body shared by update and deletion notices.
pub fn change_message(summary: &str, snapshot: &SessionSnapshot, tz: Tz) -> String {
    let mut lines = vec![
        format!("<b>{}</b>", escape_html(summary)),
        format!("Course: {}", escape_html(&snapshot.course_name)),
        format!("Time: {}", format_local(&snapshot.starts_at, tz)),
        format!("Location: {}", escape_html(snapshot.location.as_deref().unwrap_or("not set"))),
        format!("Instructor: {}", escape_html(snapshot.instructor.as_deref().unwrap_or("not set"))),
    ];
    if let Some(comment) = &snapshot.comment {
        lines.push(format!("Comment: {}", escape_html(comment)));
    }
    lines.join("\n")
}

pub struct ChangeNotifier<R> {
    repo: R,
    messenger: Arc<dyn Messenger>,
    tz: Tz,
}

impl<R: SessionRepository + 'static> ChangeNotifier<R> {
    pub fn new(repo: R, messenger: Arc<dyn Messenger>, tz: Tz) -> Self {
        Self { repo, messenger, tz }
    }

    /// Sends `summary` to every enrolled participant who wants change notices. A session
    /// that no longer exists is silently skipped.
    pub async fn notify(&self, session_id: &Uuid, summary: &str) -> Result<DeliveryReport, AppError> {
        let Some(details) = self.repo.get_session_details(session_id).await? else {
            debug!(session_id = %session_id, "session vanished before notification, skipping");
            return Ok(DeliveryReport::default());
        };

        let body = change_message(summary, &SessionSnapshot::from(&details), self.tz);
        let report = self.fan_out(&details.participants, &body).await;
        info!(
            session_id = %session_id,
            recipients = report.recipients,
            delivered = report.delivered,
            "change notice sent"
        );
        Ok(report)
    }

    /// Deletion notices come from the snapshot taken before the row was removed.
    pub async fn notify_deleted(&self, deleted: &DeletedSession, summary: &str) -> DeliveryReport {
        let body = change_message(summary, &deleted.snapshot, self.tz);
        let report = self.fan_out(&deleted.participants, &body).await;
        info!(
            session_id = %deleted.session_id,
            recipients = report.recipients,
            delivered = report.delivered,
            "deletion notice sent"
        );
        report
    }

    pub async fn deliver(&self, notice: ChangeNotice) -> DeliveryReport {
        match notice {
            ChangeNotice::Updated { session_id, summary } => match self.notify(&session_id, &summary).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "could not load session for change notice");
                    DeliveryReport::default()
                }
            },
            ChangeNotice::Deleted { deleted, summary } => self.notify_deleted(&deleted, &summary).await,
        }
    }

    /// Runs delivery off the request path; the triggering mutation has already committed.
    pub fn dispatch(self: &Arc<Self>, notice: ChangeNotice) -> JoinHandle<DeliveryReport> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move { notifier.deliver(notice).await })
    }

    async fn fan_out(&self, participants: &[Participant], body: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for chat_id in participants.iter().filter_map(Participant::change_recipient) {
            report.recipients += 1;
            match self.messenger.send_message(chat_id, body).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(chat_id, error = %err, "change notice delivery failed");
                }
            }
        }
        report
    }
}
