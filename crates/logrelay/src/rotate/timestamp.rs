// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Leading-timestamp parsing for log lines.
//!
//! Layouts are chrono format strings. Only the prefix the layout consumes is
//! parsed, the rest of the line is ignored. Layouts without an offset are read
//! in the local timezone, layouts without a year (classic syslog) get the
//! current year.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Utc};

/// Parses the timestamp `line` starts with.
#[must_use]
pub fn parse_line_timestamp(line: &str, layout: &str) -> Option<DateTime<Utc>> {
    if let Ok((dt, _)) = DateTime::parse_and_remainder(line, layout) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = match NaiveDateTime::parse_and_remainder(line, layout) {
        Ok((naive, _)) => naive,
        Err(_) if !layout.contains("%Y") && !layout.contains("%y") => {
            let year = Local::now().year();
            NaiveDateTime::parse_and_remainder(&format!("{year} {line}"), &format!("%Y {layout}"))
                .ok()?
                .0
        }
        Err(_) => return None,
    };
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Earliest and latest timestamp over `lines`. Lines that do not parse are
/// skipped.
pub fn time_window<'a, I>(lines: I, layout: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .filter_map(|line| parse_line_timestamp(line, layout))
        .fold(None, |window, ts| match window {
            None => Some((ts, ts)),
            Some((min, max)) => Some((min.min(ts), max.max(ts))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISO: &str = "%Y-%m-%dT%H:%M:%S%z";

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, h, m, 0).single().expect("valid")
    }

    #[test]
    fn test_parse_with_offset_ignores_rest_of_line() {
        assert_eq!(
            parse_line_timestamp("2024-05-14T12:30:00+0200 GET /index.html 200", ISO),
            Some(utc(10, 30))
        );
    }

    #[test]
    fn test_parse_naive_uses_local_time() {
        let expected = Local
            .with_ymd_and_hms(2024, 5, 14, 10, 30, 0)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc));
        assert_eq!(
            parse_line_timestamp("2024-05-14 10:30:00 worker started", "%Y-%m-%d %H:%M:%S"),
            expected
        );
    }

    #[test]
    fn test_parse_syslog_without_year() {
        let parsed = parse_line_timestamp("May 14 10:30:00 host sshd[1]: accepted", "%b %d %H:%M:%S")
            .expect("parsed");
        let local = parsed.with_timezone(&Local);
        assert_eq!(local.year(), Local::now().year());
        assert_eq!((local.month(), local.day()), (5, 14));
    }

    #[test]
    fn test_unparseable_line() {
        assert_eq!(parse_line_timestamp("no timestamp here", ISO), None);
        assert_eq!(parse_line_timestamp("", ISO), None);
    }

    #[test]
    fn test_time_window_skips_garbage() {
        let lines = [
            "2024-05-14T10:05:00+0000 b",
            "garbage",
            "2024-05-14T10:01:00+0000 a",
            "2024-05-14T10:09:00+0000 c",
        ];
        assert_eq!(time_window(lines, ISO), Some((utc(10, 1), utc(10, 9))));
        assert_eq!(time_window(["garbage"], ISO), None);
    }
}
