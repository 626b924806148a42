pub mod config;
pub mod decision;
pub mod event_log;
pub mod schedule;
pub mod topics;
pub mod types;

pub use config::{
    ConfigError, ConfigViolation, HardwareConfig, Mode, NetworkConfig, RuntimeConfig,
    ThermometerConfig, ThermostatConfig,
};
pub use decision::{decide, Decision, DecisionInput};
pub use event_log::{EventLog, EventRecord};
pub use schedule::{resolve_window, ActiveWindow, DayOfWeek, ScheduleEntry};
pub use topics::*;
pub use types::{
    ActuatorDirection, ActuatorState, HvacCommand, OutputLevels, SupervisorState,
    TemperatureReading, TemperatureUnits, ThermostatStatus,
};
