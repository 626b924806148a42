use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigViolation, Mode, ThermostatConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const WEEKDAYS: [DayOfWeek; 5] = [Self::Mon, Self::Tue, Self::Wed, Self::Thu, Self::Fri];
    pub const WEEKEND: [DayOfWeek; 2] = [Self::Sat, Self::Sun];

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

/// Time of day written as `"HH:MM"`. Older configuration files used the
/// 12-hour `"3:04PM"` form, which is still accepted when reading.
mod clock_time {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";
    const KITCHEN_FORMAT: &str = "%I:%M%p";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let trimmed = raw.trim();
        NaiveTime::parse_from_str(trimmed, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(&trimmed.to_ascii_uppercase(), KITCHEN_FORMAT))
            .map_err(|_| D::Error::custom(format!("invalid time of day '{raw}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub days: BTreeSet<DayOfWeek>,
    #[serde(rename = "mode")]
    pub mode_name: String,
    #[serde(with = "clock_time")]
    pub start: NaiveTime,
    #[serde(with = "clock_time")]
    pub end: NaiveTime,
}

impl ScheduleEntry {
    /// Inclusive of the start minute, exclusive of the end minute. Seconds
    /// are ignored so an entry ending at 17:00 is already over at 17:00:30.
    pub fn covers<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        if !self.days.contains(&DayOfWeek::from_chrono(now.weekday())) {
            return false;
        }

        let minute = minute_of_day(now.hour(), now.minute());
        let start = minute_of_day(self.start.hour(), self.start.minute());
        let end = minute_of_day(self.end.hour(), self.end.minute());

        start <= minute && minute < end
    }
}

fn minute_of_day(hour: u32, minute: u32) -> u32 {
    hour * 60 + minute
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveWindow<'a> {
    pub mode_name: &'a str,
    pub mode: Mode,
}

/// Picks the comfort window in force at `now`.
///
/// The schedule is a priority list: the first entry that covers `now` wins
/// even when later entries overlap it. Entries naming a mode that no longer
/// exists are skipped. With no match the default mode applies.
pub fn resolve_window<'a, Tz: TimeZone>(
    now: &DateTime<Tz>,
    config: &'a ThermostatConfig,
) -> Result<ActiveWindow<'a>, ConfigViolation> {
    let scheduled = config.schedule.iter().find_map(|entry| {
        let (name, mode) = config.modes.get_key_value(&entry.mode_name)?;
        entry.covers(now).then_some(ActiveWindow {
            mode_name: name.as_str(),
            mode: *mode,
        })
    });

    if let Some(window) = scheduled {
        return Ok(window);
    }

    config
        .modes
        .get_key_value(&config.default_mode)
        .map(|(name, mode)| ActiveWindow {
            mode_name: name.as_str(),
            mode: *mode,
        })
        .ok_or_else(|| ConfigViolation::MissingDefaultMode(config.default_mode.clone()))
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;

    use super::*;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn entry(days: &[DayOfWeek], mode: &str, start: NaiveTime, end: NaiveTime) -> ScheduleEntry {
        ScheduleEntry {
            days: days.iter().copied().collect(),
            mode_name: mode.to_string(),
            start,
            end,
        }
    }

    fn config_with(schedule: Vec<ScheduleEntry>) -> ThermostatConfig {
        let mut config = ThermostatConfig::default();
        config.modes.insert("work".to_string(), Mode::new(62.0, 85.0));
        config.modes.insert("sleep".to_string(), Mode::new(66.0, 76.0));
        config.schedule = schedule;
        config
    }

    #[test]
    fn falls_back_to_default_mode() {
        let config = config_with(vec![entry(
            &DayOfWeek::WEEKDAYS,
            "work",
            time(8, 0),
            time(17, 0),
        )]);

        // Jan 10, 2026 is a Saturday.
        let window = resolve_window(&fixed_time(10, 12, 0), &config).unwrap();

        assert_eq!(window.mode_name, "default");
        assert_eq!(window.mode, Mode::new(69.0, 80.0));
    }

    #[test]
    fn first_matching_entry_wins() {
        let config = config_with(vec![
            entry(&[DayOfWeek::Mon], "sleep", time(6, 0), time(9, 0)),
            entry(&DayOfWeek::WEEKDAYS, "work", time(7, 0), time(18, 0)),
        ]);

        // Jan 5, 2026 is a Monday.
        let window = resolve_window(&fixed_time(5, 8, 0), &config).unwrap();
        assert_eq!(window.mode_name, "sleep");

        let window = resolve_window(&fixed_time(5, 9, 0), &config).unwrap();
        assert_eq!(window.mode_name, "work");
    }

    #[test]
    fn start_minute_is_inclusive_and_end_minute_exclusive() {
        let config = config_with(vec![entry(
            &[DayOfWeek::Tue],
            "work",
            time(8, 30),
            time(17, 15),
        )]);

        let mode_at = |hour, minute| {
            resolve_window(&fixed_time(6, hour, minute), &config)
                .unwrap()
                .mode_name
        };

        assert_eq!(mode_at(8, 29), "default");
        assert_eq!(mode_at(8, 30), "work");
        assert_eq!(mode_at(12, 0), "work");
        assert_eq!(mode_at(17, 14), "work");
        assert_eq!(mode_at(17, 15), "default");
    }

    #[test]
    fn skips_entries_for_removed_modes() {
        let mut config = config_with(vec![
            entry(&[DayOfWeek::Mon], "vacation", time(0, 0), time(23, 59)),
            entry(&[DayOfWeek::Mon], "work", time(0, 0), time(23, 59)),
        ]);
        config.modes.remove("vacation");

        let window = resolve_window(&fixed_time(5, 10, 0), &config).unwrap();
        assert_eq!(window.mode_name, "work");
    }

    #[test]
    fn missing_default_is_a_config_violation() {
        let mut config = config_with(Vec::new());
        config.default_mode = "gone".to_string();

        assert_eq!(
            resolve_window(&fixed_time(5, 10, 0), &config),
            Err(ConfigViolation::MissingDefaultMode("gone".to_string()))
        );
    }

    #[test]
    fn reads_both_time_formats() {
        let raw = r#"[
            {"days": ["SAT", "SUN"], "mode": "sleep", "start": "22:00", "end": "23:30"},
            {"days": ["MON"], "mode": "work", "start": "8:15AM", "end": "5:00pm"}
        ]"#;

        let entries: Vec<ScheduleEntry> = serde_json::from_str(raw).unwrap();

        assert_eq!(entries[0].start, time(22, 0));
        assert_eq!(entries[0].days.len(), 2);
        assert_eq!(entries[1].start, time(8, 15));
        assert_eq!(entries[1].end, time(17, 0));

        let encoded = serde_json::to_value(&entries[1]).unwrap();
        assert_eq!(encoded["start"], "08:15");
        assert_eq!(encoded["end"], "17:00");
    }
}
