//! Discovery filters: recording time window and working-hours policy.

use chrono::{Datelike, FixedOffset, NaiveTime, Offset, Utc, Weekday};

use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// TimeWindow
// ---------------------------------------------------------------------------

/// Half-open recording-time window `[from, until)`. Open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeWindow {
    pub from: Option<Timestamp>,
    pub until: Option<Timestamp>,
}

impl TimeWindow {
    /// A window that accepts everything.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.until.map_or(true, |until| ts < until)
    }
}

// ---------------------------------------------------------------------------
// WorkSchedule
// ---------------------------------------------------------------------------

/// Working-days and working-hours policy, evaluated in a fixed UTC offset.
///
/// Hours are `[start, end)`; when `end <= start` the range wraps past
/// midnight (night shifts). A schedule with no days accepts nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkSchedule {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub offset: FixedOffset,
}

impl WorkSchedule {
    /// Every day, all day, in UTC.
    pub fn always() -> Self {
        Self {
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
            offset: Utc.fix(),
        }
    }

    /// Whether a recording that started at `ts` falls within working time.
    pub fn accepts(&self, ts: Timestamp) -> bool {
        let local = ts.with_timezone(&self.offset);
        let time = local.time();
        if self.start < self.end {
            self.days.contains(&local.weekday()) && time >= self.start && time < self.end
        } else if self.start == self.end {
            self.days.contains(&local.weekday())
        } else if time >= self.start {
            // Late part of a wrapping shift belongs to today's shift.
            self.days.contains(&local.weekday())
        } else if time < self.end {
            // Early part belongs to the shift that started yesterday.
            self.days.contains(&local.weekday().pred())
        } else {
            false
        }
    }

    /// Parse `mon,tue,...` day lists.
    pub fn parse_days(s: &str) -> Result<Vec<Weekday>, CoreError> {
        s.split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| CoreError::Validation(format!("Invalid weekday: \"{d}\"")))
            })
            .collect()
    }

    /// Parse `HH:MM-HH:MM` hour ranges.
    pub fn parse_hours(s: &str) -> Result<(NaiveTime, NaiveTime), CoreError> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| CoreError::Validation(format!("Invalid hour range: \"{s}\"")))?;
        let parse = |t: &str| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .map_err(|_| CoreError::Validation(format!("Invalid time of day: \"{t}\"")))
        };
        Ok((parse(start)?, parse(end)?))
    }
}

impl Default for WorkSchedule {
    fn default() -> Self {
        Self::always()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn weekdays_9_to_17() -> WorkSchedule {
        WorkSchedule {
            days: WorkSchedule::parse_days("mon,tue,wed,thu,fri").unwrap(),
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            offset: FixedOffset::east_opt(0).unwrap(),
        }
    }

    #[test]
    fn window_bounds_are_half_open() {
        let window = TimeWindow {
            from: Some(at(2024, 1, 1, 0, 0)),
            until: Some(at(2024, 1, 2, 0, 0)),
        };
        assert!(window.contains(at(2024, 1, 1, 0, 0)));
        assert!(window.contains(at(2024, 1, 1, 23, 59)));
        assert!(!window.contains(at(2024, 1, 2, 0, 0)));
        assert!(TimeWindow::unbounded().contains(at(1999, 1, 1, 0, 0)));
    }

    #[test]
    fn office_hours_accept_weekday_daytime() {
        // 2024-01-03 is a Wednesday.
        let schedule = weekdays_9_to_17();
        assert!(schedule.accepts(at(2024, 1, 3, 10, 30)));
        assert!(!schedule.accepts(at(2024, 1, 3, 17, 0)));
        assert!(!schedule.accepts(at(2024, 1, 3, 8, 59)));
    }

    #[test]
    fn weekends_rejected() {
        // 2024-01-06 is a Saturday.
        assert!(!weekdays_9_to_17().accepts(at(2024, 1, 6, 12, 0)));
    }

    #[test]
    fn offset_applied_before_checking_hours() {
        let schedule = WorkSchedule {
            offset: FixedOffset::east_opt(2 * 3600).unwrap(),
            ..weekdays_9_to_17()
        };
        // 07:30 UTC is 09:30 local.
        assert!(schedule.accepts(at(2024, 1, 3, 7, 30)));
    }

    #[test]
    fn night_shift_wraps_midnight() {
        let schedule = WorkSchedule {
            days: vec![Weekday::Fri],
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            offset: FixedOffset::east_opt(0).unwrap(),
        };
        // Friday 2024-01-05 23:00 and Saturday 03:00 belong to Friday's shift.
        assert!(schedule.accepts(at(2024, 1, 5, 23, 0)));
        assert!(schedule.accepts(at(2024, 1, 6, 3, 0)));
        assert!(!schedule.accepts(at(2024, 1, 6, 23, 0)));
        assert!(!schedule.accepts(at(2024, 1, 5, 12, 0)));
    }

    #[test]
    fn always_accepts_everything() {
        assert!(WorkSchedule::always().accepts(at(2024, 1, 6, 3, 0)));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(
            WorkSchedule::parse_days("mon, sat").unwrap(),
            vec![Weekday::Mon, Weekday::Sat]
        );
        assert!(WorkSchedule::parse_days("funday").is_err());
        let (s, e) = WorkSchedule::parse_hours("08:00-18:30").unwrap();
        assert_eq!(s, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(e, NaiveTime::from_hms_opt(18, 30, 0).unwrap());
        assert!(WorkSchedule::parse_hours("8am").is_err());
    }
}
