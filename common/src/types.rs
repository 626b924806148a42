use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{config::ThermostatConfig, event_log::EventRecord};

pub fn c_to_f(temp_c: f64) -> f64 {
    temp_c * 9.0 / 5.0 + 32.0
}

pub fn f_to_c(temp_f: f64) -> f64 {
    (temp_f - 32.0) * 5.0 / 9.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TemperatureUnits {
    Celsius,
    #[default]
    Fahrenheit,
}

impl TemperatureUnits {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Celsius => "Celsius",
            Self::Fahrenheit => "Fahrenheit",
        }
    }

    /// Converts `value`, expressed in `self`, into `target` units.
    pub fn convert(self, value: f64, target: TemperatureUnits) -> f64 {
        match (self, target) {
            (Self::Celsius, Self::Fahrenheit) => c_to_f(value),
            (Self::Fahrenheit, Self::Celsius) => f_to_c(value),
            _ => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub temperature: f64,
    pub units: TemperatureUnits,
}

impl TemperatureReading {
    pub fn new(temperature: f64, units: TemperatureUnits) -> Self {
        Self { temperature, units }
    }

    pub fn in_units(&self, units: TemperatureUnits) -> f64 {
        self.units.convert(self.temperature, units)
    }
}

/// What the HVAC equipment is physically doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorDirection {
    #[default]
    Off,
    Heating,
    Cooling,
    #[serde(rename = "fan")]
    FanOnly,
}

impl ActuatorDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heating => "heating",
            Self::Cooling => "cooling",
            Self::FanOnly => "fan",
        }
    }

    /// Heating and cooling leave warm or chilled air in the ducts that the
    /// fan should keep moving after the equipment stops.
    pub fn is_conditioning(self) -> bool {
        matches!(self, Self::Heating | Self::Cooling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacCommand {
    Heat,
    Cool,
    Fan,
    Off,
}

impl HvacCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heat => "heat",
            Self::Cool => "cool",
            Self::Fan => "fan",
            Self::Off => "off",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "heat" => Some(Self::Heat),
            "cool" => Some(Self::Cool),
            "fan" => Some(Self::Fan),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn direction(self) -> ActuatorDirection {
        match self {
            Self::Heat => ActuatorDirection::Heating,
            Self::Cool => ActuatorDirection::Cooling,
            Self::Fan => ActuatorDirection::FanOnly,
            Self::Off => ActuatorDirection::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OutputLevels {
    pub heat: bool,
    pub cool: bool,
    pub fan: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorState {
    pub direction: ActuatorDirection,
    #[serde(rename = "fanCooldownActive")]
    pub fan_cooldown_active: bool,
    #[serde(rename = "lastFanOnAt")]
    pub last_fan_on_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorState {
    Idle,
    Polling,
    Cancelled,
    Fatal,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Polling => "POLLING",
            Self::Cancelled => "CANCELLED",
            Self::Fatal => "FATAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThermostatStatus {
    pub config: ThermostatConfig,
    #[serde(rename = "activeMode")]
    pub active_mode: Option<String>,
    pub actuator: ActuatorState,
    pub outputs: OutputLevels,
    pub supervisor: SupervisorState,
    #[serde(rename = "consecutiveErrors")]
    pub consecutive_errors: u8,
    #[serde(rename = "lastEvent")]
    pub last_event: Option<EventRecord>,
    pub events: Vec<EventRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_between_scales() {
        assert_eq!(c_to_f(100.0), 212.0);
        assert_eq!(f_to_c(32.0), 0.0);

        let reading = TemperatureReading::new(20.0, TemperatureUnits::Celsius);
        assert!((reading.in_units(TemperatureUnits::Fahrenheit) - 68.0).abs() < 1e-9);
        assert_eq!(reading.in_units(TemperatureUnits::Celsius), 20.0);
    }

    #[test]
    fn direction_serializes_lowercase() {
        let encoded = serde_json::to_string(&ActuatorDirection::FanOnly).unwrap();
        assert_eq!(encoded, "\"fan\"");

        let decoded: ActuatorDirection = serde_json::from_str("\"heating\"").unwrap();
        assert_eq!(decoded, ActuatorDirection::Heating);
    }

    #[test]
    fn parses_manual_commands() {
        assert_eq!(HvacCommand::parse(" HEAT "), Some(HvacCommand::Heat));
        assert_eq!(HvacCommand::parse("fan"), Some(HvacCommand::Fan));
        assert_eq!(HvacCommand::parse("dehumidify"), None);
        assert_eq!(HvacCommand::Cool.direction(), ActuatorDirection::Cooling);
    }
}
