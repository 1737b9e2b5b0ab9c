use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const DISPLAY_FORMAT: &str = "%d.%m.%Y %H:%M";

const DATE_FORMATS: [&str; 2] = ["%d.%m.%Y", "%Y-%m-%d"];
const NAIVE_DATETIME_FORMATS: [&str; 4] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];

pub fn format_local(ts: &DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format(DISPLAY_FORMAT).to_string()
}

/// Parses an operator-entered calendar date (`DD.MM.YYYY`, or ISO `YYYY-MM-DD`).
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let trimmed = input.trim();
    DATE_FORMATS.iter().find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

/// Parses an `HH:MM` wall-clock time.
pub fn parse_time(input: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M").ok()
}

/// Parses a strictly positive number of minutes.
pub fn parse_duration_minutes(input: &str) -> Option<i32> {
    input.trim().parse::<i32>().ok().filter(|minutes| *minutes > 0)
}

/// Resolves a local wall-clock moment to UTC. Ambiguous moments (DST fall-back)
/// resolve to the earlier instant; moments inside a DST gap do not exist.
pub fn combine_local(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    local_to_utc(&date.and_time(time), tz)
}

fn local_to_utc(naive: &NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(naive) {
        LocalResult::Single(ts) => Some(ts.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Parses an ISO-8601 timestamp from the HTTP API. Values with an offset are
/// taken as-is, naive values are read in the schedule timezone.
pub fn parse_api_datetime(input: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .and_then(|naive| local_to_utc(&naive, tz))
}

/// UTC bounds `[start, end)` of a local calendar day.
pub fn local_day_bounds(date: NaiveDate, tz: Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let next = date.succ_opt()?;
    let start = first_instant_of(date, tz)?;
    let end = first_instant_of(next, tz)?;
    Some((start, end))
}

fn first_instant_of(date: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    // Midnight can fall into a DST gap in a handful of zones; walk forward to the first valid minute.
    (0..=180).find_map(|minute| {
        let naive = date.and_time(NaiveTime::MIN) + chrono::Duration::minutes(minute);
        local_to_utc(&naive, tz)
    })
}

/// Escapes text for Telegram's HTML parse mode.
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Trims free text and maps an empty answer to "not set".
pub fn normalize_text(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
}
