pub mod course;
pub mod cron;
pub mod error;
pub mod flow;
pub mod health;
pub mod participant;
pub mod schedule;
pub mod session;

use crate::config::Config;
use crate::error::app_error::AppError;
use chrono_tz::Tz;

pub(crate) fn schedule_tz(config: &Config) -> Result<Tz, AppError> {
    config.schedule.tz().map_err(AppError::configuration)
}
