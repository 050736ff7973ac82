//! Normalization of RSS `<pubDate>` strings.
//!
//! Feeds rarely agree on a date format. [`parse_pub_date`] walks an ordered
//! list of [`Layout`]s and returns the first one that parses. The order is a
//! priority, not a uniqueness guarantee: a string may match more than one
//! layout, and a feed is assumed to stick to one format.
//!
//! Weekday prefixes (`"Mon, "`) are accepted but never checked against the
//! date, because feeds frequently get them wrong.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use thiserror::Error;

/// No layout matched. Carries the original input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not parse date: {0:?}")]
pub struct DateParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    /// Trailing `-0700` or `-07:00`
    Numeric,
    /// Trailing abbreviation such as `GMT` or `PST`
    Named,
    /// The format string itself ends in a literal `Z`
    LiteralZ,
    /// Full RFC 3339, fractional seconds allowed
    Rfc3339,
    /// No zone in the input; UTC is assumed
    Naive,
}

/// One accepted pub-date shape.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    name: &'static str,
    weekday: bool,
    datetime: &'static str,
    zone: Zone,
}

/// Accepted layouts, in priority order.
pub const LAYOUTS: &[Layout] = &[
    Layout {
        name: "RFC1123Z",
        weekday: true,
        datetime: "%d %b %Y %H:%M:%S",
        zone: Zone::Numeric,
    },
    Layout {
        name: "RFC1123",
        weekday: true,
        datetime: "%d %b %Y %H:%M:%S",
        zone: Zone::Named,
    },
    Layout {
        name: "RFC822Z",
        weekday: false,
        datetime: "%d %b %y %H:%M",
        zone: Zone::Numeric,
    },
    Layout {
        name: "RFC822",
        weekday: false,
        datetime: "%d %b %y %H:%M",
        zone: Zone::Named,
    },
    Layout {
        name: "RFC1123 with Z",
        weekday: true,
        datetime: "%d %b %Y %H:%M:%S Z",
        zone: Zone::LiteralZ,
    },
    Layout {
        name: "ISO-8601 UTC",
        weekday: false,
        datetime: "%Y-%m-%dT%H:%M:%SZ",
        zone: Zone::LiteralZ,
    },
    Layout {
        name: "RFC3339",
        weekday: false,
        datetime: "",
        zone: Zone::Rfc3339,
    },
    Layout {
        name: "ISO-8601 local",
        weekday: false,
        datetime: "%Y-%m-%dT%H:%M:%S",
        zone: Zone::Naive,
    },
    Layout {
        name: "ISO-8601 local without seconds",
        weekday: false,
        datetime: "%Y-%m-%dT%H:%M",
        zone: Zone::Naive,
    },
    Layout {
        name: "SQL datetime",
        weekday: false,
        datetime: "%Y-%m-%d %H:%M:%S",
        zone: Zone::Naive,
    },
    Layout {
        name: "SQL datetime without seconds",
        weekday: false,
        datetime: "%Y-%m-%d %H:%M",
        zone: Zone::Naive,
    },
    Layout {
        name: "day month year numeric zone",
        weekday: false,
        datetime: "%d %b %Y %H:%M:%S",
        zone: Zone::Numeric,
    },
    Layout {
        name: "day month year named zone",
        weekday: false,
        datetime: "%d %b %Y %H:%M:%S",
        zone: Zone::Named,
    },
];

/// Parse a raw `<pubDate>` value.
///
/// - empty or whitespace-only input is `Ok(None)`, not an error
/// - the first matching layout in [`LAYOUTS`] wins
/// - no match is `Err(DateParseError)` with the original string
pub fn parse_pub_date(raw: &str) -> Result<Option<DateTime<Utc>>, DateParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    LAYOUTS
        .iter()
        .find_map(|layout| layout.parse(trimmed))
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .ok_or_else(|| DateParseError(raw.to_string()))
}

impl Layout {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Parse `input` against this layout only.
    pub fn parse(&self, input: &str) -> Option<DateTime<FixedOffset>> {
        let body = if self.weekday {
            strip_weekday(input)?
        } else {
            input
        };

        match self.zone {
            Zone::Numeric => {
                let (rest, zone) = body.rsplit_once(char::is_whitespace)?;
                let offset = numeric_offset(zone)?;
                let naive = NaiveDateTime::parse_from_str(rest.trim_end(), self.datetime).ok()?;
                naive.and_local_timezone(offset).single()
            }
            Zone::Named => {
                let (rest, zone) = body.rsplit_once(char::is_whitespace)?;
                let offset = named_offset(zone)?;
                let naive = NaiveDateTime::parse_from_str(rest.trim_end(), self.datetime).ok()?;
                naive.and_local_timezone(offset).single()
            }
            Zone::LiteralZ | Zone::Naive => NaiveDateTime::parse_from_str(body, self.datetime)
                .ok()
                .map(|naive| naive.and_utc().fixed_offset()),
            Zone::Rfc3339 => DateTime::parse_from_rfc3339(body).ok(),
        }
    }

    /// Render `ts` in this layout. Named zones are always written as `GMT`.
    pub fn format(&self, ts: DateTime<FixedOffset>) -> String {
        if self.zone == Zone::Rfc3339 {
            return ts.to_rfc3339();
        }

        let local = match self.zone {
            Zone::Numeric => ts.naive_local(),
            _ => ts.naive_utc(),
        };

        let mut out = String::new();
        if self.weekday {
            out.push_str(&local.format("%a, ").to_string());
        }
        out.push_str(&local.format(self.datetime).to_string());
        match self.zone {
            Zone::Numeric => out.push_str(&ts.format(" %z").to_string()),
            Zone::Named => out.push_str(" GMT"),
            _ => {}
        }
        out
    }
}

/// `"Mon, 02 Jan ..."` -> `"02 Jan ..."`. The day name is not validated.
fn strip_weekday(input: &str) -> Option<&str> {
    let (day, rest) = input.split_once(',')?;
    let day = day.trim();
    if (3..=9).contains(&day.len()) && day.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(rest.trim_start())
    } else {
        None
    }
}

/// `+0530`, `-07:00`
fn numeric_offset(zone: &str) -> Option<FixedOffset> {
    let (sign, digits) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    let digits: String = match digits.len() {
        4 => digits.to_string(),
        5 if digits.as_bytes()[2] == b':' => digits.replace(':', ""),
        _ => return None,
    };
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// RFC 822 zone names. Unknown alphabetic abbreviations are taken as UTC.
fn named_offset(zone: &str) -> Option<FixedOffset> {
    if !(2..=5).contains(&zone.len()) || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let hours = match zone.to_ascii_uppercase().as_str() {
        "UT" | "UTC" | "GMT" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        other => {
            tracing::debug!(zone = %other, "Unknown zone abbreviation, assuming UTC");
            0
        }
    };
    FixedOffset::east_opt(hours * 3600)
}
