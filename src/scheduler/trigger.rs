//! Trigger rules and due-ness.

use super::ScheduleError;
use chrono::{DateTime, Datelike, Duration, Month, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// When a schedule entry becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Every `minutes` since the last firing.
    Interval { minutes: u32 },
    /// Once on each listed day of the week.
    Weekdays { days: Vec<Weekday> },
    /// Once in each listed month, on or after `day` when given. A `day`
    /// past the end of a short month means that month's last day.
    Months {
        months: Vec<Month>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        day: Option<u32>,
    },
}

const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

const ALL_MONTHS: [Month; 12] = [
    Month::January,
    Month::February,
    Month::March,
    Month::April,
    Month::May,
    Month::June,
    Month::July,
    Month::August,
    Month::September,
    Month::October,
    Month::November,
    Month::December,
];

impl Trigger {
    pub fn every_minutes(minutes: u32) -> Self {
        Trigger::Interval { minutes }
    }

    pub fn weekdays(days: impl IntoIterator<Item = Weekday>) -> Self {
        Trigger::Weekdays {
            days: days.into_iter().collect(),
        }
    }

    /// Every day of the week.
    pub fn daily() -> Self {
        Self::weekdays(ALL_WEEKDAYS)
    }

    pub fn weekly(day: Weekday) -> Self {
        Self::weekdays([day])
    }

    pub fn months(months: impl IntoIterator<Item = Month>, day: Option<u32>) -> Self {
        Trigger::Months {
            months: months.into_iter().collect(),
            day,
        }
    }

    /// Every month of the year.
    pub fn monthly() -> Self {
        Self::months(ALL_MONTHS, None)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Trigger::Interval { minutes } => {
                if *minutes == 0 {
                    return Err(ScheduleError::ZeroInterval);
                }
            }
            Trigger::Weekdays { days } => {
                if days.is_empty() {
                    return Err(ScheduleError::EmptyDaySet);
                }
            }
            Trigger::Months { months, day } => {
                if months.is_empty() {
                    return Err(ScheduleError::EmptyMonthSet);
                }
                if let Some(day) = day {
                    if !(1..=31).contains(day) {
                        return Err(ScheduleError::InvalidDay(*day));
                    }
                }
            }
        }
        Ok(())
    }

    /// Sorted, deduplicated copy so equal rule sets compare equal.
    pub fn normalized(&self) -> Self {
        match self {
            Trigger::Interval { minutes } => Trigger::Interval { minutes: *minutes },
            Trigger::Weekdays { days } => {
                let mut days = days.clone();
                days.sort_by_key(|d| d.num_days_from_monday());
                days.dedup();
                Trigger::Weekdays { days }
            }
            Trigger::Months { months, day } => {
                let mut months = months.clone();
                months.sort_by_key(|m| m.number_from_month());
                months.dedup();
                Trigger::Months { months, day: *day }
            }
        }
    }

    /// Whether an entry last fired at `last` is due at `now`.
    ///
    /// Calendar rules are evaluated in `tz`.
    pub fn is_due(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>, tz: Tz) -> bool {
        match self {
            Trigger::Interval { minutes } => match last {
                None => true,
                Some(last) => now - last >= Duration::minutes(i64::from(*minutes)),
            },
            Trigger::Weekdays { days } => {
                let today = now.with_timezone(&tz);
                if !days.contains(&today.weekday()) {
                    return false;
                }
                match last {
                    None => true,
                    Some(last) => last.with_timezone(&tz).date_naive() < today.date_naive(),
                }
            }
            Trigger::Months { months, day } => {
                let today = now.with_timezone(&tz);
                let in_month = months
                    .iter()
                    .any(|m| m.number_from_month() == today.month());
                let anchor = day.map(|d| d.min(last_day_of_month(today.year(), today.month())));
                if !in_month || anchor.is_some_and(|d| today.day() < d) {
                    return false;
                }
                match last {
                    None => true,
                    Some(last) => {
                        let last = last.with_timezone(&tz);
                        (last.year(), last.month()) < (today.year(), today.month())
                    }
                }
            }
        }
    }

    /// Short human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Trigger::Interval { minutes } => format!("every {minutes} min"),
            Trigger::Weekdays { days } if days.len() == 7 => "daily".to_string(),
            Trigger::Weekdays { days } => {
                let names: Vec<String> = days.iter().map(|d| d.to_string()).collect();
                format!("weekly on {}", names.join(","))
            }
            Trigger::Months { months, day } => {
                let names: Vec<&str> = months.iter().map(|m| m.name()).collect();
                let months = if months.len() == 12 {
                    "every month".to_string()
                } else {
                    names.join(",")
                };
                match day {
                    Some(day) => format!("{months} from day {day}"),
                    None => months,
                }
            }
        }
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(28, |last| last.day())
}
