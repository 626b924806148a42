pub const TOPIC_SENSOR_TEMP: &str = "thermostat/sensor/temperature";
pub const TOPIC_SENSOR_STATUS: &str = "thermostat/sensor/status";

pub const TOPIC_CONTROLLER_STATE: &str = "thermostat/controller/state";

pub const TOPIC_CMD_HVAC: &str = "thermostat/cmnd/hvac";
