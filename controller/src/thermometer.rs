use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use hvac_common::{TemperatureReading, TemperatureUnits};

/// Readings outside this range (in Fahrenheit) are treated as sensor faults.
const PLAUSIBLE_RANGE_F: std::ops::RangeInclusive<f64> = -40.0..=150.0;

#[derive(Debug, Error)]
pub enum ThermometerError {
    #[error("no temperature reading received yet")]
    NoReading,
    #[error("last temperature reading is {age:?} old")]
    Stale { age: Duration },
    #[error("thermometer unavailable: {0}")]
    Unavailable(String),
    #[error("invalid temperature payload: {0}")]
    InvalidPayload(String),
}

#[async_trait]
pub trait Thermometer: Send + Sync {
    async fn read_temperature(&self) -> Result<TemperatureReading, ThermometerError>;

    async fn shutdown(&self) {}
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<(TemperatureReading, Instant)>,
    closed: bool,
}

/// Thermometer fed by a remote sensor publishing over MQTT. Each read hands
/// back the latest sample as long as it is fresher than `stale_after`.
#[derive(Debug)]
pub struct MqttThermometer {
    slot: Mutex<Slot>,
    stale_after: Duration,
}

impl MqttThermometer {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            stale_after,
        }
    }

    pub fn update(&self, reading: TemperatureReading) {
        let mut slot = self.slot();
        if slot.closed {
            return;
        }
        debug!(
            "temperature sample {:.1} {}",
            reading.temperature,
            reading.units.as_str()
        );
        slot.latest = Some((reading, Instant::now()));
    }

    /// Parses a sensor payload and stores it.
    pub fn ingest(&self, payload: &str) -> Result<TemperatureReading, ThermometerError> {
        let reading = parse_payload(payload)?;
        self.update(reading);
        Ok(reading)
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Thermometer for MqttThermometer {
    async fn read_temperature(&self) -> Result<TemperatureReading, ThermometerError> {
        let slot = self.slot();
        if slot.closed {
            return Err(ThermometerError::Unavailable("shut down".to_string()));
        }
        let (reading, received_at) = slot.latest.ok_or(ThermometerError::NoReading)?;
        let age = received_at.elapsed();
        if age > self.stale_after {
            return Err(ThermometerError::Stale { age });
        }
        Ok(reading)
    }

    async fn shutdown(&self) {
        let mut slot = self.slot();
        slot.closed = true;
        slot.latest = None;
        info!("thermometer feed closed");
    }
}

/// Accepts a JSON [`TemperatureReading`] or a bare number, which older
/// sensors publish in Fahrenheit.
pub fn parse_payload(payload: &str) -> Result<TemperatureReading, ThermometerError> {
    let trimmed = payload.trim();
    let reading = match trimmed.parse::<f64>() {
        Ok(value) => TemperatureReading::new(value, TemperatureUnits::Fahrenheit),
        Err(_) => serde_json::from_str::<TemperatureReading>(trimmed)
            .map_err(|err| ThermometerError::InvalidPayload(err.to_string()))?,
    };

    let fahrenheit = reading.in_units(TemperatureUnits::Fahrenheit);
    if !fahrenheit.is_finite() || !PLAUSIBLE_RANGE_F.contains(&fahrenheit) {
        return Err(ThermometerError::InvalidPayload(format!(
            "{} {} is out of range",
            reading.temperature,
            reading.units.as_str()
        )));
    }
    Ok(reading)
}
