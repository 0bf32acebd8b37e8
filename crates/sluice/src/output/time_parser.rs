//! ⏱️ Time parsing for `time_key` values, plus the `@timestamp` formatter.
//!
//! Strategy is picked once from config: an explicit strftime format, or `Auto`
//! which accepts epoch numbers, numeric strings and RFC 3339.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::common::EventTime;
use crate::error::RoutingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeParser {
    Strftime { format: String },
    Auto,
}

impl TimeParser {
    pub fn from_format(format: Option<&str>) -> Self {
        match format {
            Some(format) => TimeParser::Strftime {
                format: format.to_string(),
            },
            None => TimeParser::Auto,
        }
    }

    pub fn format_name(&self) -> &str {
        match self {
            TimeParser::Strftime { format } => format,
            TimeParser::Auto => "auto",
        }
    }

    pub fn parse(&self, value: &Value) -> Result<EventTime, RoutingError> {
        match self {
            TimeParser::Auto => parse_auto(value),
            TimeParser::Strftime { format } => {
                let text = value_text(value);
                parse_with_format(&text, format).ok_or_else(|| RoutingError::TimeParse {
                    value: text,
                    reason: format!("does not match format '{format}'"),
                })
            }
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_with_format(text: &str, format: &str) -> Option<EventTime> {
    if let Ok(with_offset) = DateTime::parse_from_str(text, format) {
        return Some(with_offset.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, format)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn parse_auto(value: &Value) -> Result<EventTime, RoutingError> {
    let from_epoch = |secs: f64| {
        let whole = secs.trunc() as i64;
        let nanos = ((secs - secs.trunc()) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
        DateTime::from_timestamp(whole, nanos)
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(secs) => from_epoch(secs),
            Err(_) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        },
        _ => None,
    };
    parsed.ok_or_else(|| RoutingError::TimeParse {
        value: value_text(value),
        reason: "not an epoch number or RFC 3339 timestamp".to_string(),
    })
}

/// 🕰️ ISO 8601 with exactly `precision` fractional digits (0..=9), always UTC.
pub fn format_timestamp(time: &EventTime, precision: u8) -> String {
    let mut out = time.format("%Y-%m-%dT%H:%M:%S").to_string();
    let precision = usize::from(precision.min(9));
    if precision > 0 {
        let nanos = format!("{:09}", time.timestamp_subsec_nanos());
        out.push('.');
        out.push_str(&nanos[..precision]);
    }
    out.push_str("+00:00");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test_support::new_years_day;
    use serde_json::json;

    #[test]
    fn the_one_where_auto_eats_whatever_you_throw_at_it() {
        let parser = TimeParser::Auto;
        assert_eq!(parser.parse(&json!(1704067200)).unwrap(), new_years_day());
        assert_eq!(parser.parse(&json!("1704067200")).unwrap(), new_years_day());
        assert_eq!(
            parser.parse(&json!("2024-01-01T01:00:00+01:00")).unwrap(),
            new_years_day()
        );
        assert!(parser.parse(&json!("last tuesday")).is_err());
        assert!(parser.parse(&json!({"nested": true})).is_err());
    }

    #[test]
    fn the_one_where_strftime_is_strict_about_it() {
        let parser = TimeParser::from_format(Some("%d/%m/%Y %H:%M:%S"));
        assert_eq!(parser.parse(&json!("01/01/2024 00:00:00")).unwrap(), new_years_day());
        let err = parser.parse(&json!("2024-01-01")).expect_err("wrong shape");
        assert!(err.to_string().contains("2024-01-01"));
        assert_eq!(parser.format_name(), "%d/%m/%Y %H:%M:%S");
    }

    #[test]
    fn the_one_where_precision_trims_the_nanoseconds() {
        let time = new_years_day() + chrono::Duration::nanoseconds(123_456_789);
        assert_eq!(format_timestamp(&time, 3), "2024-01-01T00:00:00.123+00:00");
        assert_eq!(format_timestamp(&time, 9), "2024-01-01T00:00:00.123456789+00:00");
        assert_eq!(format_timestamp(&time, 0), "2024-01-01T00:00:00+00:00");
    }
}
