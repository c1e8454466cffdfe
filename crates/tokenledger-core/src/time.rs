//! Wall-clock source and ISO-8601 instant helpers.
//!
//! Instants are persisted as RFC 3339 strings with millisecond precision and
//! a `Z` suffix, matching the records already on disk. Parsing is defensive:
//! a malformed `expiresAt` must never silently drop a credit, so the expiry
//! predicate treats unparseable instants as "not past".

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use std::sync::Mutex;

use crate::constants::FAR_FUTURE_EXPIRY;

/// Source of "now". Production code uses [`SystemClock`]; tests pin time
/// with [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current instant as an ISO string.
    fn now_iso(&self) -> String {
        to_iso(self.now())
    }
}

/// Wall clock backed by the OS.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn at_iso(iso: &str) -> Self {
        let now = parse_iso(iso).unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
        Self::at(now)
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut guard = self.now.lock().unwrap();
        *guard += Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ── Formatting / parsing ─────────────────────────────────────────────────────

/// Render an instant as the ledger's ISO-8601 wire format.
pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a ledger ISO instant. Returns `None` on malformed input.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ── Predicates ───────────────────────────────────────────────────────────────

/// True when the record never expires.
pub fn is_never_expires(iso: &str) -> bool {
    iso == FAR_FUTURE_EXPIRY
}

/// True when `iso` parses and is strictly before `now`. The far-future
/// sentinel and unparseable instants are never past.
pub fn is_past(iso: &str, now: DateTime<Utc>) -> bool {
    if is_never_expires(iso) {
        return false;
    }
    match parse_iso(iso) {
        Some(dt) => dt < now,
        None => false,
    }
}

// ── Offsets / day bounds ─────────────────────────────────────────────────────

/// ISO instant `secs` seconds after `now`.
pub fn offset_iso(now: DateTime<Utc>, secs: i64) -> String {
    to_iso(now + Duration::seconds(secs))
}

/// Midnight UTC at the start of `now`'s day.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now)
}

/// Last millisecond of `now`'s day.
pub fn end_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_milli_opt(23, 59, 59, 999)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(iso: &str) -> DateTime<Utc> {
        parse_iso(iso).expect("test instant must parse")
    }

    #[test]
    fn iso_round_trip_keeps_millis() {
        let now = at("2025-06-15T10:30:00.250Z");
        assert_eq!(to_iso(now), "2025-06-15T10:30:00.250Z");
    }

    #[test]
    fn sentinel_parses_but_is_never_past() {
        assert!(parse_iso(FAR_FUTURE_EXPIRY).is_some());
        assert!(!is_past(FAR_FUTURE_EXPIRY, at("2025-01-01T00:00:00.000Z")));
    }

    #[test]
    fn past_instant_is_past() {
        let now = at("2025-01-01T00:00:00.000Z");
        assert!(is_past("2020-01-01T00:00:00.000Z", now));
        assert!(!is_past("2030-01-01T00:00:00.000Z", now));
    }

    #[test]
    fn boundary_is_not_strictly_past() {
        let now = at("2025-01-01T00:00:00.000Z");
        assert!(!is_past("2025-01-01T00:00:00.000Z", now));
    }

    #[test]
    fn unparseable_is_not_past() {
        let now = at("2025-01-01T00:00:00.000Z");
        assert!(!is_past("not-a-date", now));
        assert!(!is_past("", now));
    }

    #[test]
    fn offset_adds_seconds() {
        let now = at("2025-01-01T00:00:00.000Z");
        assert_eq!(offset_iso(now, 1_800), "2025-01-01T00:30:00.000Z");
    }

    #[test]
    fn day_bounds() {
        let now = at("2025-06-15T10:30:00.000Z");
        assert_eq!(to_iso(start_of_day(now)), "2025-06-15T00:00:00.000Z");
        assert_eq!(to_iso(end_of_day(now)), "2025-06-15T23:59:59.999Z");
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at_iso("2025-01-01T00:00:00.000Z");
        clock.advance_secs(301);
        assert_eq!(clock.now_iso(), "2025-01-01T00:05:01.000Z");
    }
}
