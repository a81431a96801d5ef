use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Timezone of a rule's business-hours window: an IANA zone such as
/// `America/New_York`, or a fixed UTC offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTimezone {
    Named(Tz),
    Fixed { label: String, offset: FixedOffset },
}

impl RuleTimezone {
    pub fn utc() -> Self {
        Self::Named(Tz::UTC)
    }

    /// Accepts IANA names plus the offset spellings `Z`, `+05:30`, `-0800`,
    /// `UTC+2` and `GMT-08:00`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if let Ok(tz) = trimmed.parse::<Tz>() {
            return Ok(Self::Named(tz));
        }

        let upper = trimmed.to_ascii_uppercase();
        let rest = upper
            .strip_prefix("UTC")
            .or_else(|| upper.strip_prefix("GMT"))
            .unwrap_or(&upper);
        if rest.is_empty() || rest == "Z" {
            return Ok(Self::utc());
        }

        let (sign, digits) = if let Some(digits) = rest.strip_prefix('+') {
            (1, digits)
        } else if let Some(digits) = rest.strip_prefix('-') {
            (-1, digits)
        } else {
            return Err(format!("unsupported timezone '{trimmed}'"));
        };
        let (hours, minutes) = match digits.split_once(':') {
            Some((h, m)) => (h, m),
            None if digits.len() == 4 && digits.is_ascii() => digits.split_at(2),
            None => (digits, "0"),
        };
        let hours: i32 = hours
            .parse()
            .map_err(|_| format!("unsupported timezone '{trimmed}'"))?;
        let minutes: i32 = minutes
            .parse()
            .map_err(|_| format!("unsupported timezone '{trimmed}'"))?;
        if hours > 14 || minutes > 59 {
            return Err(format!("timezone offset out of range in '{trimmed}'"));
        }
        let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .ok_or_else(|| format!("timezone offset out of range in '{trimmed}'"))?;
        Ok(Self::Fixed {
            label: trimmed.to_string(),
            offset,
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Named(tz) => tz.name(),
            Self::Fixed { label, .. } => label,
        }
    }

    /// Wall-clock time at `now`, honoring daylight saving for named zones.
    pub fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Named(tz) => now.with_timezone(tz).naive_local(),
            Self::Fixed { offset, .. } => now.with_timezone(offset).naive_local(),
        }
    }
}

/// Weekly window during which a rule may assign contacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "BusinessHoursSpec", try_from = "BusinessHoursSpec")]
pub struct BusinessHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub working_days: Vec<Weekday>,
    pub timezone: RuleTimezone,
}

/// Stored form of [`BusinessHours`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHoursSpec {
    pub start: String,
    pub end: String,
    pub working_days: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| format!("invalid time '{}', expected HH:MM", raw.trim()))
}

pub fn parse_weekday(raw: &str) -> Option<Weekday> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl BusinessHours {
    pub fn from_spec(spec: &BusinessHoursSpec) -> Result<Self, String> {
        let mut working_days = Vec::with_capacity(spec.working_days.len());
        for raw in &spec.working_days {
            let day = parse_weekday(raw).ok_or_else(|| format!("invalid working day '{raw}'"))?;
            if !working_days.contains(&day) {
                working_days.push(day);
            }
        }
        if working_days.is_empty() {
            return Err("business hours need at least one working day".to_string());
        }
        Ok(Self {
            start: parse_hhmm(&spec.start)?,
            end: parse_hhmm(&spec.end)?,
            working_days,
            timezone: RuleTimezone::parse(&spec.timezone)?,
        })
    }

    pub fn to_spec(&self) -> BusinessHoursSpec {
        BusinessHoursSpec {
            start: self.start.format("%H:%M").to_string(),
            end: self.end.format("%H:%M").to_string(),
            working_days: self
                .working_days
                .iter()
                .map(|day| weekday_name(*day).to_string())
                .collect(),
            timezone: self.timezone.as_str().to_string(),
        }
    }

    /// Minute-resolution check; both ends are inclusive. A window whose start
    /// is after its end wraps past midnight.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = self.timezone.local(now);
        if !self.working_days.contains(&local.weekday()) {
            return false;
        }

        let minute_of_day = local.hour() * 60 + local.minute();
        let start = self.start.hour() * 60 + self.start.minute();
        let end = self.end.hour() * 60 + self.end.minute();
        if start <= end {
            (start..=end).contains(&minute_of_day)
        } else {
            minute_of_day >= start || minute_of_day <= end
        }
    }
}

impl TryFrom<BusinessHoursSpec> for BusinessHours {
    type Error = String;

    fn try_from(spec: BusinessHoursSpec) -> Result<Self, Self::Error> {
        Self::from_spec(&spec)
    }
}

impl From<BusinessHours> for BusinessHoursSpec {
    fn from(hours: BusinessHours) -> Self {
        hours.to_spec()
    }
}

/// Calendar day (`YYYY-MM-DD`) of `now` in the given timezone.
pub fn local_day_key(now: DateTime<Utc>, timezone: &RuleTimezone) -> String {
    timezone.local(now).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc, Weekday};

    use super::{BusinessHours, BusinessHoursSpec, RuleTimezone, local_day_key};

    fn weekday_hours(tz: &str) -> BusinessHours {
        BusinessHours::from_spec(&BusinessHoursSpec {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
            working_days: ["mon", "tue", "wed", "thu", "fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            timezone: tz.to_string(),
        })
        .expect("valid hours")
    }

    #[test]
    fn window_is_inclusive_at_both_ends() {
        let hours = weekday_hours("UTC");
        // 2026-03-02 is a Monday.
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 59).unwrap()));
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 17, 1, 0).unwrap()));
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 8, 59, 0).unwrap()));
    }

    #[test]
    fn weekends_are_outside_a_weekday_window() {
        let hours = weekday_hours("UTC");
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap()));
    }

    #[test]
    fn offset_shifts_local_time_and_day() {
        let hours = weekday_hours("-08:00");
        // Monday 16:30 UTC is Monday 08:30 in UTC-8.
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 16, 30, 0).unwrap()));
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 17, 30, 0).unwrap()));
        // Saturday 00:30 UTC is still Friday 16:30 in UTC-8.
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 3, 7, 0, 30, 0).unwrap()));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let mut hours = weekday_hours("UTC");
        hours.start = chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        hours.end = chrono::NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 23, 15, 0).unwrap()));
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 3, 3, 5, 59, 0).unwrap()));
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).unwrap()));
    }

    fn utc_offset_at(tz: &str, now: chrono::DateTime<Utc>) -> i64 {
        let tz = RuleTimezone::parse(tz).unwrap();
        (tz.local(now) - now.naive_utc()).num_seconds()
    }

    #[test]
    fn timezone_parser_accepts_common_offset_spellings() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        assert_eq!(utc_offset_at("UTC", now), 0);
        assert_eq!(utc_offset_at("+05:30", now), 5 * 3600 + 1800);
        assert_eq!(utc_offset_at("-0800", now), -8 * 3600);
        assert_eq!(utc_offset_at("UTC+2", now), 2 * 3600);
        assert!(RuleTimezone::parse("Mars/Olympus_Mons").is_err());
    }

    #[test]
    fn named_zone_is_accepted_and_kept_by_name() {
        let hours = weekday_hours("America/New_York");
        assert_eq!(hours.timezone.as_str(), "America/New_York");
        assert_eq!(hours.to_spec().timezone, "America/New_York");
        // Monday 13:30 UTC is 08:30 EST, 14:30 UTC is 09:30 EST.
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 13, 30, 0).unwrap()));
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap()));
    }

    #[test]
    fn named_zone_follows_daylight_saving() {
        // US clocks spring forward on Sunday 2026-03-08.
        let hours = weekday_hours("America/New_York");
        let friday_before = Utc.with_ymd_and_hms(2026, 3, 6, 13, 30, 0).unwrap();
        let monday_after = Utc.with_ymd_and_hms(2026, 3, 9, 13, 30, 0).unwrap();
        // 13:30 UTC is 08:30 EST before the switch and 09:30 EDT after it.
        assert!(!hours.contains(friday_before));
        assert!(hours.contains(monday_after));
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 3, 9, 21, 30, 0).unwrap()));
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 3, 9, 12, 59, 0).unwrap()));
    }

    #[test]
    fn day_key_in_named_zone_trails_utc_in_the_evening() {
        let tz = RuleTimezone::parse("America/Los_Angeles").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 3, 0, 0).unwrap();
        assert_eq!(local_day_key(now, &tz), "2026-06-30");
    }

    #[test]
    fn spec_round_trip_keeps_short_day_names() {
        let hours = weekday_hours("UTC");
        let spec = hours.to_spec();
        assert_eq!(spec.working_days[0], "mon");
        assert_eq!(hours.working_days[4], Weekday::Fri);
    }

    #[test]
    fn missing_working_days_are_rejected() {
        let err = BusinessHours::from_spec(&BusinessHoursSpec {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
            working_days: Vec::new(),
            timezone: "UTC".to_string(),
        })
        .expect_err("must reject");
        assert!(err.contains("working day"));
    }

    #[test]
    fn day_key_uses_rule_timezone() {
        let tz = RuleTimezone::parse("+09:00").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 20, 0, 0).unwrap();
        assert_eq!(local_day_key(now, &tz), "2026-03-03");
    }
}
