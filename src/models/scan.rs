use rocket::serde::Serialize;
use schemars::JsonSchema;

/// Outcome of one proximity scanner tick.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
pub struct ScanReport {
    pub sessions_found: usize,
    pub sessions_warned: usize,
    pub notices_sent: usize,
    pub notices_failed: usize,
    /// Candidates another tick claimed first.
    pub sessions_skipped: usize,
    /// Sessions whose claim or release hit a storage error.
    pub storage_errors: usize,
}
