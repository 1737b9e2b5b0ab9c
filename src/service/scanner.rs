use crate::config::ScannerConfig;
use crate::database::session::SessionRepository;
use crate::error::app_error::AppError;
use crate::models::participant::Participant;
use crate::models::scan::ScanReport;
use crate::models::session::SessionDetails;
use crate::service::messenger::Messenger;
use crate::util::{escape_html, format_local};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Periodically warns participants about sessions that are about to start.
pub struct ProximityScanner<R> {
    repo: R,
    messenger: Arc<dyn Messenger>,
    tz: Tz,
    lead: Duration,
    tolerance: Duration,
}

impl<R: SessionRepository + 'static> ProximityScanner<R> {
    pub fn new(repo: R, messenger: Arc<dyn Messenger>, tz: Tz, config: &ScannerConfig) -> Self {
        Self {
            repo,
            messenger,
            tz,
            lead: Duration::seconds(config.lead_seconds),
            tolerance: Duration::seconds(config.tolerance_seconds.abs()),
        }
    }

    /// Start-time window examined by a tick at `now`, inclusive on both ends.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now + self.lead - self.tolerance, now + self.lead + self.tolerance)
    }

    /// Runs one scan. Each session is claimed (its `warned` flag set) before anything is
    /// sent, so overlapping ticks from the background loop, the cron endpoint or the cron
    /// binary never deliver the same notice twice. A claim whose sends all fail is released
    /// for the next tick. Storage errors are scoped to the session they occur on.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ScanReport, AppError> {
        let (from, to) = self.window(now);
        let candidates = self.repo.list_warn_candidates(from, to).await?;

        let mut report = ScanReport {
            sessions_found: candidates.len(),
            ..ScanReport::default()
        };

        for details in &candidates {
            let session_id = details.session.id;
            let starts_at = details.session.starts_at;
            let recipients: Vec<i64> = details.participants.iter().filter_map(Participant::warning_recipient).collect();
            if recipients.is_empty() {
                debug!(session_id = %session_id, "no eligible recipients for starting-soon notice");
                continue;
            }

            match self.repo.claim_warning(&session_id, starts_at).await {
                Ok(true) => {}
                Ok(false) => {
                    report.sessions_skipped += 1;
                    debug!(session_id = %session_id, "session already claimed or changed, skipping");
                    continue;
                }
                Err(err) => {
                    report.storage_errors += 1;
                    error!(session_id = %session_id, error = %err, "could not claim session for starting-soon notice");
                    continue;
                }
            }

            let body = self.warning_message(details);
            let mut delivered = 0;
            for chat_id in recipients {
                match self.messenger.send_message(chat_id, &body).await {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        report.notices_failed += 1;
                        warn!(session_id = %session_id, chat_id, error = %err, "starting-soon notice failed");
                    }
                }
            }
            report.notices_sent += delivered;

            if delivered > 0 {
                report.sessions_warned += 1;
                info!(session_id = %session_id, delivered, "session marked as warned");
                continue;
            }

            // Nobody got it; hand the session back to the next tick.
            if let Err(err) = self.repo.release_warning(&session_id, starts_at).await {
                report.storage_errors += 1;
                error!(session_id = %session_id, error = %err, "could not release starting-soon claim");
            }
        }

        Ok(report)
    }

    fn warning_message(&self, details: &SessionDetails) -> String {
        let session = &details.session;
        let mut lines = vec![
            format!("<b>Session starts in {} minutes</b>", self.lead.num_minutes()),
            format!("Course: {}", escape_html(&details.course_name)),
            format!("Time: {}", format_local(&session.starts_at, self.tz)),
            format!("Location: {}", escape_html(session.location.as_deref().unwrap_or("not set"))),
            format!("Instructor: {}", escape_html(session.instructor.as_deref().unwrap_or("not set"))),
        ];
        if let Some(comment) = &session.comment {
            lines.push(format!("Comment: {}", escape_html(comment)));
        }
        lines.join("\n")
    }

    pub fn spawn(self: Arc<Self>, interval: std::time::Duration, startup_delay: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(startup_delay).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.tick(Utc::now()).await {
                    Ok(report) if report.sessions_found > 0 => info!(
                        sessions_found = report.sessions_found,
                        sessions_warned = report.sessions_warned,
                        notices_sent = report.notices_sent,
                        notices_failed = report.notices_failed,
                        sessions_skipped = report.sessions_skipped,
                        storage_errors = report.storage_errors,
                        "proximity scan finished"
                    ),
                    Ok(_) => debug!("proximity scan found nothing"),
                    Err(err) => error!(error = %err, "proximity scan failed"),
                }
            }
        })
    }
}
