// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};

/// When a trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period, first tick one period after the trigger starts.
    Every(Duration),
    /// Once a day at a wall-clock time in the local timezone.
    DailyAt(DailyAt),
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(period) => write!(f, "every {}s", period.as_secs()),
            Schedule::DailyAt(at) => write!(f, "daily at {at}"),
        }
    }
}

/// Wall-clock time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DailyAt {
    pub hour: u32,
    pub minute: u32,
}

impl fmt::Display for DailyAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl DailyAt {
    pub const MIDNIGHT: DailyAt = DailyAt { hour: 0, minute: 0 };

    /// Parses `"H"`, `"HH"` or `"HH:MM"`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (hour, minute) = match value.split_once(':') {
            Some((hour, minute)) => (hour.trim(), minute.trim()),
            None => (value, "0"),
        };
        let hour: u32 = hour.parse().ok()?;
        let minute: u32 = minute.parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self { hour, minute })
    }

    fn time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }

    /// This time of day on `date` in `tz`.
    ///
    /// Ambiguous local times resolve to the earlier instant, times skipped by a
    /// DST jump move forward to the first valid hour.
    pub fn on<Tz: TimeZone>(self, date: NaiveDate, tz: &Tz) -> DateTime<Tz> {
        resolve_local(tz, date.and_time(self.time()))
    }

    /// Today's occurrence relative to `now`, which may lie in the past.
    pub fn today<Tz: TimeZone>(self, now: &DateTime<Tz>) -> DateTime<Tz> {
        self.on(now.date_naive(), &now.timezone())
    }
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    let mut candidate = naive;
    for _ in 0..24 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => return t,
            LocalResult::None => candidate += TimeDelta::hours(1),
        }
    }
    tz.from_utc_datetime(&naive)
}

/// Next occurrence of `at` strictly after `now`, rolling over to tomorrow.
pub fn next_daily_fire<Tz: TimeZone>(now: &DateTime<Tz>, at: DailyAt) -> DateTime<Tz> {
    let today = at.today(now);
    if today > *now {
        return today;
    }
    match now.date_naive().succ_opt() {
        Some(tomorrow) => at.on(tomorrow, &now.timezone()),
        None => today + TimeDelta::days(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, h, m, s).single().expect("valid")
    }

    #[test]
    fn test_parse() {
        assert_eq!(DailyAt::parse("3"), Some(DailyAt { hour: 3, minute: 0 }));
        assert_eq!(DailyAt::parse("03:30"), Some(DailyAt { hour: 3, minute: 30 }));
        assert_eq!(DailyAt::parse(" 23:59 "), Some(DailyAt { hour: 23, minute: 59 }));
        assert_eq!(DailyAt::parse("0"), Some(DailyAt::MIDNIGHT));
        assert_eq!(DailyAt::parse("24"), None);
        assert_eq!(DailyAt::parse("12:60"), None);
        assert_eq!(DailyAt::parse(""), None);
        assert_eq!(DailyAt::parse("a:b"), None);
        assert_eq!(DailyAt::parse("-1"), None);
    }

    #[test]
    fn test_next_fire_later_today() {
        let at = DailyAt { hour: 3, minute: 30 };
        assert_eq!(next_daily_fire(&utc(2, 0, 0), at), utc(3, 30, 0));
    }

    #[test]
    fn test_next_fire_rolls_to_tomorrow() {
        let at = DailyAt { hour: 3, minute: 30 };
        let next = next_daily_fire(&utc(10, 0, 0), at);
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2024, 5, 15, 3, 30, 0).single().expect("valid")
        );
    }

    #[test]
    fn test_next_fire_is_strictly_after_now() {
        let at = DailyAt { hour: 3, minute: 30 };
        let now = utc(3, 30, 0);
        let next = next_daily_fire(&now, at);
        assert!(next > now);
        assert_eq!(next - now, TimeDelta::days(1));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Schedule::DailyAt(DailyAt { hour: 4, minute: 5 }).to_string(),
            "daily at 04:05"
        );
        assert_eq!(
            Schedule::Every(Duration::from_secs(300)).to_string(),
            "every 300s"
        );
    }
}
