//! Calendars of time dimensions.
//!
//! A time dimension stores raw numeric offsets from a base epoch in fixed units. Decoding an
//! offset yields calendar fields, which are compared at a concept level to decide whether two
//! values belong to the same group.

use serde::{Deserialize, Serialize};

use crate::error::CubeError;
use crate::hierarchy;
use crate::models::MidnightPolicy;

const SECONDS_PER_DAY: i64 = 86_400;
/// Offsets beyond this many seconds (about 30 million years) are rejected.
const MAX_SECONDS: f64 = 1e15;
const MONTH_DAYS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Calendar systems
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CalendarKind {
    /// Gregorian leap rules, extended to dates before their introduction
    #[serde(
        rename = "standard",
        alias = "gregorian",
        alias = "proleptic_gregorian"
    )]
    Standard,
    /// A leap year every four years
    #[serde(rename = "julian")]
    Julian,
    /// Every year has 365 days
    #[serde(rename = "noleap", alias = "365_day")]
    NoLeap,
    /// Every year has 366 days
    #[serde(rename = "all_leap", alias = "366_day")]
    AllLeap,
    /// Twelve months of 30 days
    #[serde(rename = "360_day")]
    Day360,
    /// Month lengths and leap rule given by the descriptor
    #[serde(rename = "user_defined")]
    UserDefined,
}

/// Units of raw time values
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnits {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnits {
    fn seconds(self) -> f64 {
        match self {
            Self::Seconds => 1.0,
            Self::Minutes => 60.0,
            Self::Hours => 3_600.0,
            Self::Days => 86_400.0,
        }
    }
}

/// Calendar parameters of a time dimension.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CalendarDescriptor {
    pub calendar: CalendarKind,
    pub units: TimeUnits,
    /// Epoch of raw value 0, `YYYY-MM-DD hh:mm:ss`
    pub base_time: String,
    /// Days of each month of a user defined calendar
    pub month_lengths: Option<[u32; 12]>,
    /// A user defined calendar has a leap year every `leap_year` years
    pub leap_year: Option<i64>,
    /// Month (1-based) receiving the extra day of a leap year
    pub leap_month: Option<u32>,
}

/// Calendar fields of a decoded time value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CalendarFields {
    pub year: i64,
    /// 1-based
    pub month: u32,
    /// 1-based
    pub day: u32,
    /// 24 for a midnight folded into the previous day
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    /// 1-based
    pub day_of_year: u32,
}

/// Fields compared to decide group membership; unused trailing fields are zero.
pub type GroupKey = [i64; 5];

impl CalendarFields {
    /// Returns the fields that identify the group of this instant at `level`.
    pub fn group_key(&self, level: char) -> Result<GroupKey, CubeError> {
        let year = self.year;
        let doy = i64::from(self.day_of_year);
        let hour = i64::from(self.hour);
        let minute = i64::from(self.minute);
        let second = i64::from(self.second);
        let month = i64::from(self.month);
        let key = match level {
            hierarchy::SECOND => [year, doy, hour, minute, second],
            hierarchy::MINUTE => [year, doy, hour, minute, 0],
            hierarchy::HOUR => [year, doy, hour, 0, 0],
            hierarchy::THREE_HOURS => [year, doy, hour / 3, 0, 0],
            hierarchy::SIX_HOURS => [year, doy, hour / 6, 0, 0],
            hierarchy::DAY => [year, doy, 0, 0, 0],
            hierarchy::WEEK => [year, (doy - 1) / 7, 0, 0, 0],
            hierarchy::MONTH => [year, month, 0, 0, 0],
            hierarchy::QUARTER => [year, (month - 1) / 3, 0, 0, 0],
            hierarchy::YEAR => [year, 0, 0, 0, 0],
            hierarchy::ALL => [0; 5],
            _ => {
                return Err(CubeError::Calendar {
                    message: format!("concept level '{}' is not a time level", level),
                })
            }
        };
        Ok(key)
    }
}

/// Parsed base epoch.
struct BaseTime {
    year: i64,
    month: u32,
    day: u32,
    seconds_of_day: i64,
}

fn calendar_error(message: impl Into<String>) -> CubeError {
    CubeError::Calendar {
        message: message.into(),
    }
}

impl CalendarDescriptor {
    /// Returns a Gregorian calendar counting `units` from `base_time`.
    pub fn standard(base_time: &str, units: TimeUnits) -> Self {
        Self {
            calendar: CalendarKind::Standard,
            units,
            base_time: base_time.to_string(),
            month_lengths: None,
            leap_year: None,
            leap_month: None,
        }
    }

    /// Checks that the descriptor can decode values.
    pub fn validate(&self) -> Result<(), CubeError> {
        if self.calendar == CalendarKind::UserDefined {
            let lengths = self
                .month_lengths
                .ok_or_else(|| calendar_error("user defined calendar without month lengths"))?;
            if lengths.iter().any(|days| *days == 0) {
                return Err(calendar_error("month lengths must be greater than 0"));
            }
            match (self.leap_year, self.leap_month) {
                (None, _) => {}
                (Some(years), Some(month)) if years > 0 && (1..=12).contains(&month) => {}
                (Some(_), _) => {
                    return Err(calendar_error(
                        "leap year rule needs a period greater than 0 and a leap month in 1..=12",
                    ))
                }
            }
        }
        self.parse_base()?;
        Ok(())
    }

    fn is_leap(&self, year: i64) -> bool {
        match self.calendar {
            CalendarKind::Standard => {
                (year.rem_euclid(4) == 0 && year.rem_euclid(100) != 0) || year.rem_euclid(400) == 0
            }
            CalendarKind::Julian => year.rem_euclid(4) == 0,
            CalendarKind::NoLeap | CalendarKind::Day360 => false,
            CalendarKind::AllLeap => true,
            CalendarKind::UserDefined => match self.leap_year {
                Some(years) if years > 0 => year.rem_euclid(years) == 0,
                _ => false,
            },
        }
    }

    /// Returns the number of days of `month` (1-based) in `year`.
    pub fn month_length(&self, year: i64, month: u32) -> u32 {
        let index = (month.clamp(1, 12) - 1) as usize;
        match self.calendar {
            CalendarKind::Day360 => 30,
            CalendarKind::UserDefined => {
                let base = self.month_lengths.map_or(MONTH_DAYS[index], |m| m[index]);
                if self.is_leap(year) && self.leap_month == Some(month) {
                    base + 1
                } else {
                    base
                }
            }
            _ => {
                if month == 2 && self.is_leap(year) {
                    29
                } else {
                    MONTH_DAYS[index]
                }
            }
        }
    }

    /// Returns the length of the leap cycle, in years and in days.
    ///
    /// Shifting a year by a whole cycle keeps its month lengths.
    fn leap_cycle(&self) -> (i64, i64) {
        match self.calendar {
            CalendarKind::Standard => (400, 146_097),
            CalendarKind::Julian => (4, 1_461),
            CalendarKind::NoLeap | CalendarKind::AllLeap | CalendarKind::Day360 => {
                (1, self.year_length(0))
            }
            CalendarKind::UserDefined => {
                let common: i64 = self
                    .month_lengths
                    .unwrap_or(MONTH_DAYS)
                    .iter()
                    .map(|days| i64::from(*days))
                    .sum();
                match (self.leap_year, self.leap_month) {
                    (Some(years), Some(month)) if years > 0 && (1..=12).contains(&month) => {
                        (years, years * common + 1)
                    }
                    _ => (1, common),
                }
            }
        }
    }

    /// Returns the number of days in `year`.
    pub fn year_length(&self, year: i64) -> i64 {
        (1..=12).map(|m| i64::from(self.month_length(year, m))).sum()
    }

    fn parse_base(&self) -> Result<BaseTime, CubeError> {
        let invalid = || calendar_error(format!("invalid base time {}", self.base_time));
        let mut parts = self.base_time.split_whitespace();
        let date = parts.next().ok_or_else(invalid)?;
        let time = parts.next().unwrap_or("00:00:00");
        if parts.next().is_some() {
            return Err(invalid());
        }
        // A leading '-' belongs to the year.
        let (sign, date) = match date.strip_prefix('-') {
            Some(rest) => (-1, rest),
            None => (1, date),
        };
        let date: Vec<&str> = date.split('-').collect();
        let time: Vec<&str> = time.split(':').collect();
        if date.len() != 3 || time.is_empty() || time.len() > 3 {
            return Err(invalid());
        }
        let year = sign * date[0].parse::<i64>().map_err(|_| invalid())?;
        let month: u32 = date[1].parse().map_err(|_| invalid())?;
        let day: u32 = date[2].parse().map_err(|_| invalid())?;
        let mut hms = [0_i64; 3];
        for (field, text) in hms.iter_mut().zip(&time) {
            *field = text.parse().map_err(|_| invalid())?;
        }
        if !(1..=12).contains(&month)
            || day == 0
            || day > self.month_length(year, month)
            || !(0..24).contains(&hms[0])
            || !(0..60).contains(&hms[1])
            || !(0..60).contains(&hms[2])
        {
            return Err(invalid());
        }
        Ok(BaseTime {
            year,
            month,
            day,
            seconds_of_day: hms[0] * 3_600 + hms[1] * 60 + hms[2],
        })
    }

    /// Decodes a raw value into calendar fields.
    ///
    /// With [MidnightPolicy::FoldBackward], a value at exactly midnight decoded for a day or
    /// coarser `level` is reported as hour 24 of the previous day.
    pub fn decode(
        &self,
        value: f64,
        level: char,
        policy: MidnightPolicy,
    ) -> Result<CalendarFields, CubeError> {
        let offset = value * self.units.seconds();
        if !offset.is_finite() || offset.abs() > MAX_SECONDS {
            return Err(calendar_error(format!("time value {} is out of range", value)));
        }
        let base = self.parse_base()?;
        if self.year_length(base.year) <= 0 {
            return Err(calendar_error("calendar years hold no days"));
        }
        let seconds = base.seconds_of_day + offset.round() as i64;
        let mut days = seconds.div_euclid(SECONDS_PER_DAY);
        let mut seconds_of_day = seconds.rem_euclid(SECONDS_PER_DAY);
        if seconds_of_day == 0
            && policy == MidnightPolicy::FoldBackward
            && hierarchy::folds_midnight(level)
        {
            days -= 1;
            seconds_of_day = SECONDS_PER_DAY;
        }

        // Day of year (0-based) of the base date, then move by whole days.
        let mut year = base.year;
        let mut day_of_year = (1..base.month)
            .map(|m| i64::from(self.month_length(year, m)))
            .sum::<i64>()
            + i64::from(base.day)
            - 1
            + days;
        let (cycle_years, cycle_days) = self.leap_cycle();
        let cycles = day_of_year.div_euclid(cycle_days);
        year += cycles * cycle_years;
        day_of_year -= cycles * cycle_days;
        while day_of_year < 0 {
            year -= 1;
            day_of_year += self.year_length(year);
        }
        loop {
            let length = self.year_length(year);
            if day_of_year < length {
                break;
            }
            day_of_year -= length;
            year += 1;
        }

        let mut month = 1;
        let mut day = day_of_year;
        while day >= i64::from(self.month_length(year, month)) {
            day -= i64::from(self.month_length(year, month));
            month += 1;
        }

        Ok(CalendarFields {
            year,
            month,
            day: (day + 1) as u32,
            hour: (seconds_of_day / 3_600) as u32,
            minute: (seconds_of_day % 3_600 / 60) as u32,
            second: (seconds_of_day % 60) as u32,
            day_of_year: (day_of_year + 1) as u32,
        })
    }
}
