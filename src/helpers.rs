use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Utc};
use std::cmp::Ordering;

use crate::models::Millis;

pub const MS_PER_MINUTE: Millis = 60 * 1000;
pub const MS_PER_DAY: Millis = 24 * 60 * MS_PER_MINUTE;

/// Helper for safe float comparison with NaN handling
pub fn compare_floats(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Division that yields 0 instead of NaN or infinity
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let value = numerator / denominator;
    if value.is_finite() { value } else { 0.0 }
}

/// Generic sorting with custom comparator and order
pub fn sort_with_order<T, F>(items: &mut [T], compare_fn: F, ascending: bool)
where
    F: Fn(&T, &T) -> Ordering,
{
    items.sort_by(|a, b| {
        let cmp = compare_fn(a, b);
        if ascending { cmp } else { cmp.reverse() }
    });
}

pub fn now_millis() -> Millis {
    Utc::now().timestamp_millis()
}

pub fn to_utc(ms: Millis) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub fn to_local(ms: Millis) -> DateTime<Local> {
    to_utc(ms).with_timezone(&Local)
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(30)
}

/// Start (inclusive) and end (exclusive) of a local calendar month, in millis
pub fn local_month_bounds(year: i32, month: u32) -> (Millis, Millis) {
    let start = local_midnight(year, month, 1);
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    (start, local_midnight(ny, nm, 1))
}

fn local_midnight(year: i32, month: u32, day: u32) -> Millis {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|dt| Local.from_local_datetime(&dt).earliest())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

/// Parse YYYY-MM-DD or YYYYMMDD into local-midnight millis
pub fn parse_date(input: &str) -> Option<Millis> {
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(input, "%Y%m%d"))
        .ok()?;
    Some(local_midnight(date.year(), date.month(), date.day()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_floats() {
        assert_eq!(compare_floats(1.0, 2.0), Ordering::Less);
        assert_eq!(compare_floats(2.0, 1.0), Ordering::Greater);
        assert_eq!(compare_floats(f64::NAN, 1.0), Ordering::Equal);
    }

    #[test]
    fn test_safe_ratio() {
        assert_eq!(safe_ratio(1.0, 0.0), 0.0);
        assert_eq!(safe_ratio(f64::INFINITY, 1.0), 0.0);
        assert_eq!(safe_ratio(3.0, 2.0), 1.5);
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
        assert_eq!(days_in_month(2024, 4), 30);
    }

    #[test]
    fn test_month_bounds_and_parse_date() {
        let (start, end) = local_month_bounds(2024, 3);
        assert_eq!(parse_date("2024-03-01"), Some(start));
        assert_eq!(parse_date("20240401"), Some(end));
        assert!(parse_date("March").is_none());
    }
}
