//! Evaluation context and time parsing helpers
//!
//! [`EvalConfig`] carries the time range, storage step and render options
//! through recursive expression evaluation. Functions that need a modified
//! sub-range (timeShift, moving windows, Holt-Winters bootstrap) clone the
//! config and adjust the clone; the parent config is never mutated.

use std::time::Instant;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};
use crate::parser::{ArgExpr, Expr};

/// Evaluation context threaded through the whole expression tree.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Start of the time range, unix milliseconds (inclusive).
    pub start_time: i64,

    /// End of the time range, unix milliseconds (exclusive).
    pub end_time: i64,

    /// Storage-level step for fetched series, milliseconds.
    pub storage_step: i64,

    /// Evaluation deadline; threaded down to storage fetches.
    pub deadline: Option<Instant>,

    /// Wall-clock "now" in unix milliseconds, for relative time resolution.
    pub current_time: i64,

    /// Default xFilesFactor for series without a per-series override.
    pub x_files_factor: f64,

    /// Enforced tag filters appended to every storage search.
    pub etfs: Vec<(String, String)>,

    /// The original query, for diagnostics.
    pub original_query: String,
}

impl EvalConfig {
    /// Number of output points for the given step over `[start_time, end_time)`.
    pub fn points_len(&self, step: i64) -> usize {
        if step <= 0 || self.end_time <= self.start_time {
            return 0;
        }
        ((self.end_time - self.start_time + step - 1) / step) as usize
    }

    /// Timestamp grid with the given step starting at `start_time`.
    pub fn new_timestamps(&self, step: i64) -> Vec<i64> {
        let points_len = self.points_len(step);
        let mut timestamps = Vec::with_capacity(points_len);
        let mut ts = self.start_time;
        for _ in 0..points_len {
            timestamps.push(ts);
            ts += step;
        }
        timestamps
    }

    /// Whether the evaluation deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }
}

/// Parse a Graphite interval string such as `45s`, `5min`, `-1h`, `7d`,
/// `1mon` into milliseconds. Multiple groups are summed: `1h30min`.
pub fn parse_interval(s: &str) -> Result<i64> {
    let s = s.trim();
    let (is_minus, mut rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    rest = rest.trim_start();
    if rest.is_empty() {
        return Err(Error::Argument(format!("cannot parse interval from {:?}", s)));
    }
    let mut total_ms = 0f64;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(Error::Argument(format!(
                "missing number in interval {:?}",
                s
            )));
        }
        let n: f64 = rest[..digits_end]
            .parse()
            .map_err(|err| Error::Argument(format!("cannot parse interval {:?}: {}", s, err)))?;
        rest = &rest[digits_end..];
        let unit_end = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = rest[unit_end..].trim_start();
        total_ms += n * interval_unit_msecs(unit, s)? as f64;
    }
    let total = total_ms as i64;
    Ok(if is_minus { -total } else { total })
}

fn interval_unit_msecs(unit: &str, full: &str) -> Result<i64> {
    let msecs = if unit == "ms" {
        1
    } else if unit.starts_with("mon") {
        30 * 24 * 3600 * 1000
    } else if unit.starts_with("min") || unit == "m" {
        60 * 1000
    } else if unit.starts_with('s') || unit.is_empty() {
        1000
    } else if unit.starts_with('h') {
        3600 * 1000
    } else if unit.starts_with('d') {
        24 * 3600 * 1000
    } else if unit.starts_with('w') {
        7 * 24 * 3600 * 1000
    } else if unit.starts_with('y') {
        365 * 24 * 3600 * 1000
    } else {
        return Err(Error::Argument(format!(
            "unsupported interval unit {:?} in {:?}",
            unit, full
        )));
    };
    Ok(msecs)
}

/// Resolve a Graphite time specifier against `current_time` (unix ms).
///
/// Supported forms: `now`, relative offsets (`-1d`, `now-7d`, `+2h`),
/// unix epoch seconds, `HH:MM_YYYYMMDD` and `YYYYMMDD` (UTC).
pub fn parse_time(current_time: i64, s: &str) -> Result<i64> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Ok(current_time);
    }
    let rel = s.strip_prefix("now").unwrap_or(s).trim_start();
    if rel.starts_with('-') || rel.starts_with('+') {
        let offset = parse_interval(rel)?;
        return Ok(current_time + offset);
    }
    if s.chars().all(|c| c.is_ascii_digit()) && s.len() != 8 {
        let secs: i64 = s
            .parse()
            .map_err(|err| Error::Argument(format!("cannot parse time {:?}: {}", s, err)))?;
        return Ok(secs * 1000);
    }
    if let Some((hhmm, date)) = s.split_once('_') {
        let t = NaiveTime::parse_from_str(hhmm, "%H:%M")
            .map_err(|err| Error::Argument(format!("cannot parse time {:?}: {}", s, err)))?;
        let d = NaiveDate::parse_from_str(date, "%Y%m%d")
            .map_err(|err| Error::Argument(format!("cannot parse time {:?}: {}", s, err)))?;
        return Ok(naive_to_msecs(NaiveDateTime::new(d, t)));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y%m%d") {
        return Ok(naive_to_msecs(d.and_hms_opt(0, 0, 0).unwrap_or_default()));
    }
    Err(Error::Argument(format!("cannot parse time {:?}", s)))
}

fn naive_to_msecs(dt: NaiveDateTime) -> i64 {
    Utc.from_utc_datetime(&dt).timestamp_millis()
}

/// Align `start_time` (unix ms, UTC) down to the calendar unit named by `s`
/// (`ms`, `s`, `min`, `h`, `d`, `w<weekday>`, `mon`, `y`), for
/// smartSummarize's `alignTo`.
pub fn align_time_unit(start_time: i64, s: &str) -> Result<i64> {
    let dt = Utc
        .timestamp_millis_opt(start_time)
        .single()
        .ok_or_else(|| Error::Argument(format!("invalid timestamp {}", start_time)))?;
    let d = dt.date_naive();
    let aligned = if s.starts_with("ms") {
        return Ok(start_time);
    } else if s.starts_with("min") {
        d.and_hms_opt(dt.time().hour(), dt.time().minute(), 0)
    } else if s.starts_with("mon") {
        NaiveDate::from_ymd_opt(d.year(), d.month(), 1).and_then(|d| d.and_hms_opt(0, 0, 0))
    } else if s.starts_with('s') {
        d.and_hms_opt(dt.time().hour(), dt.time().minute(), dt.time().second())
    } else if s.starts_with('h') {
        d.and_hms_opt(dt.time().hour(), 0, 0)
    } else if s.starts_with('d') {
        d.and_hms_opt(0, 0, 0)
    } else if s.starts_with('w') {
        // Optional ISO weekday digit to align to, Monday by default.
        let weekday = match s.as_bytes().last() {
            Some(c @ b'0'..=b'9') => (c - b'0') as i64,
            _ => 1,
        };
        let mut days_back = dt.weekday().num_days_from_sunday() as i64 - weekday;
        if days_back < 0 {
            days_back += 7;
        }
        (d - chrono::Duration::days(days_back)).and_hms_opt(0, 0, 0)
    } else if s.starts_with('y') {
        NaiveDate::from_ymd_opt(d.year(), 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
    } else {
        return Err(Error::Argument(format!("unsupported interval {:?}", s)));
    };
    aligned
        .map(naive_to_msecs)
        .ok_or_else(|| Error::Argument(format!("cannot align {} to {:?}", start_time, s)))
}

/// Resolve a window size argument: a number means a count of storage steps,
/// a string is an interval. Returns `(window_msecs, steps_count)` where
/// `steps_count` is non-zero only for the numeric form.
pub fn get_window_size(ec: &EvalConfig, window_arg: &ArgExpr) -> Result<(i64, f64)> {
    let (window_size, steps_count) = match &window_arg.expr {
        Expr::Number(ne) => (
            (ne.n * ec.storage_step as f64) as i64,
            ne.n,
        ),
        Expr::Str(se) => (
            parse_interval(&se.s)
                .map_err(|err| Error::Argument(format!("cannot parse windowSize: {}", err)))?,
            0.0,
        ),
        other => {
            return Err(Error::Argument(format!(
                "unexpected type for windowSize arg: {:?}; expecting number or string",
                other.to_query_string()
            )));
        }
    };
    if window_size <= 0 {
        return Err(Error::Argument(format!(
            "windowSize must be positive; got {}ms",
            window_size
        )));
    }
    Ok((window_size, steps_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EvalConfig {
        EvalConfig {
            start_time: 120_000,
            end_time: 210_000,
            storage_step: 30_000,
            deadline: None,
            current_time: 150_000_000,
            x_files_factor: 0.0,
            etfs: Vec::new(),
            original_query: String::new(),
        }
    }

    #[test]
    fn test_points_len() {
        let ec = test_config();
        assert_eq!(ec.points_len(30_000), 3);
        assert_eq!(ec.points_len(45_000), 2);
        assert_eq!(ec.points_len(13_000), 7);
        assert_eq!(ec.new_timestamps(45_000), vec![120_000, 165_000]);
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("45s").unwrap(), 45_000);
        assert_eq!(parse_interval("1m").unwrap(), 60_000);
        assert_eq!(parse_interval("5min").unwrap(), 300_000);
        assert_eq!(parse_interval("-1h").unwrap(), -3_600_000);
        assert_eq!(parse_interval("1d").unwrap(), 86_400_000);
        assert_eq!(parse_interval("7d").unwrap(), 7 * 86_400_000);
        assert_eq!(parse_interval("1mon").unwrap(), 30 * 86_400_000);
        assert_eq!(parse_interval("1h30min").unwrap(), 5_400_000);
        assert_eq!(parse_interval("100ms").unwrap(), 100);
        assert!(parse_interval("x5").is_err());
        assert!(parse_interval("5q").is_err());
    }

    #[test]
    fn test_parse_time() {
        let now = 1_500_000_000_000;
        assert_eq!(parse_time(now, "now").unwrap(), now);
        assert_eq!(parse_time(now, "-1h").unwrap(), now - 3_600_000);
        assert_eq!(parse_time(now, "now-1d").unwrap(), now - 86_400_000);
        assert_eq!(parse_time(now, "1500000000").unwrap(), 1_500_000_000_000);
        // 2017-07-14 00:00 UTC
        assert_eq!(parse_time(now, "20170714").unwrap(), 1_499_990_400_000);
        assert_eq!(
            parse_time(now, "02:40_20170714").unwrap(),
            1_499_990_400_000 + 2 * 3_600_000 + 40 * 60_000
        );
        assert!(parse_time(now, "tomorrow-ish").is_err());
    }

    #[test]
    fn test_align_time_unit() {
        // 2017-07-14 02:40:30.500 UTC
        let ts = 1_499_999_430_500;
        assert_eq!(align_time_unit(ts, "s").unwrap(), 1_499_999_430_000);
        assert_eq!(align_time_unit(ts, "min").unwrap(), 1_499_999_400_000);
        assert_eq!(align_time_unit(ts, "h").unwrap(), 1_499_997_600_000);
        assert_eq!(align_time_unit(ts, "d").unwrap(), 1_499_990_400_000);
        // 2017-07-01
        assert_eq!(align_time_unit(ts, "mon").unwrap(), 1_498_867_200_000);
    }
}
