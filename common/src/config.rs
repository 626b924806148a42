use std::{collections::BTreeMap, time::Duration};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{decision::FAN_CYCLE, schedule::ScheduleEntry, types::TemperatureUnits};

pub const DEFAULT_MODE_NAME: &str = "default";

/// A named comfort window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub low: f64,
    pub high: f64,
}

impl Mode {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn is_valid(&self) -> bool {
        self.low.is_finite() && self.high.is_finite() && self.low < self.high
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigViolation {
    #[error("default mode '{0}' is not defined")]
    MissingDefaultMode(String),
    #[error("mode '{name}' must have low < high")]
    InvalidMode { name: String },
    #[error("schedule entry #{index} must start before it ends")]
    InvalidScheduleWindow { index: usize },
    #[error("schedule entry #{index} references unknown mode '{mode}'")]
    UnknownScheduleMode { index: usize, mode: String },
    #[error("schedule entry #{index} has no days")]
    EmptyScheduleDays { index: usize },
    #[error("overshoot must be a non-negative number")]
    NegativeOvershoot,
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("minimum fan runtime cannot exceed one hour")]
    FanRuntimeTooLong,
    #[error("timezone '{0}' is not a known IANA zone")]
    InvalidTimezone(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid thermostat configuration: {}", join_violations(.0))]
    Invalid(Vec<ConfigViolation>),
}

impl ConfigError {
    pub fn violations(&self) -> &[ConfigViolation] {
        match self {
            Self::Invalid(violations) => violations,
        }
    }
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermostatConfig {
    pub modes: BTreeMap<String, Mode>,
    pub default_mode: String,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
    pub overshoot: f64,
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub min_fan_runtime_ms: u64,
    pub max_consecutive_errors: u8,
    #[serde(default)]
    pub unit_preference: TemperatureUnits,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

impl Default for ThermostatConfig {
    fn default() -> Self {
        Self {
            modes: BTreeMap::from([(DEFAULT_MODE_NAME.to_string(), Mode::new(69.0, 80.0))]),
            default_mode: DEFAULT_MODE_NAME.to_string(),
            schedule: Vec::new(),
            overshoot: 2.0,
            poll_interval_ms: 60_000,
            min_fan_runtime_ms: 0,
            max_consecutive_errors: 3,
            unit_preference: TemperatureUnits::Fahrenheit,
            timezone: default_timezone(),
        }
    }
}

impl ThermostatConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_fan_runtime(&self) -> Duration {
        Duration::from_millis(self.min_fan_runtime_ms)
    }

    pub fn tz(&self) -> Option<Tz> {
        self.timezone.parse().ok()
    }

    /// Returns every problem with this configuration; empty means usable.
    pub fn validate(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();

        if !self.modes.contains_key(&self.default_mode) {
            violations.push(ConfigViolation::MissingDefaultMode(
                self.default_mode.clone(),
            ));
        }

        for (name, mode) in &self.modes {
            if !mode.is_valid() {
                violations.push(ConfigViolation::InvalidMode { name: name.clone() });
            }
        }

        for (i, entry) in self.schedule.iter().enumerate() {
            // Entries are numbered from one, matching what an operator sees in a list.
            let index = i + 1;
            if entry.start >= entry.end {
                violations.push(ConfigViolation::InvalidScheduleWindow { index });
            }
            if !self.modes.contains_key(&entry.mode_name) {
                violations.push(ConfigViolation::UnknownScheduleMode {
                    index,
                    mode: entry.mode_name.clone(),
                });
            }
            if entry.days.is_empty() {
                violations.push(ConfigViolation::EmptyScheduleDays { index });
            }
        }

        if !(self.overshoot.is_finite() && self.overshoot >= 0.0) {
            violations.push(ConfigViolation::NegativeOvershoot);
        }

        if self.poll_interval_ms == 0 {
            violations.push(ConfigViolation::ZeroPollInterval);
        }

        if self.min_fan_runtime() > FAN_CYCLE {
            violations.push(ConfigViolation::FanRuntimeTooLong);
        }

        if self.tz().is_none() {
            violations.push(ConfigViolation::InvalidTimezone(self.timezone.clone()));
        }

        violations
    }

    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let violations = self.validate();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations))
        }
    }
}

/// Wiring of the three HVAC control lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub heat_pin: u8,
    pub cool_pin: u8,
    pub fan_pin: u8,
    pub active_low: bool,
    pub fan_cooldown_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            heat_pin: 16,
            cool_pin: 20,
            fan_pin: 21,
            active_low: true,
            fan_cooldown_ms: 60_000,
        }
    }
}

impl HardwareConfig {
    pub fn fan_cooldown(&self) -> Duration {
        Duration::from_millis(self.fan_cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThermometerConfig {
    pub stale_after_ms: u64,
}

impl Default for ThermometerConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub thermostat: ThermostatConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub thermometer: ThermometerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    /// Falls back to the default thermostat settings when the stored ones
    /// would be rejected, returning what was wrong with them.
    pub fn sanitize(&mut self) -> Vec<ConfigViolation> {
        let violations = self.thermostat.validate();
        if !violations.is_empty() {
            self.thermostat = ThermostatConfig::default();
        }
        violations
    }
}
