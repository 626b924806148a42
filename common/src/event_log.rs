use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActuatorDirection, TemperatureUnits};

pub const DEFAULT_EVENT_CAPACITY: usize = 60;

/// One control-loop outcome. `ambient_temperature` is `None` when the
/// thermometer could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "ambientTemperature")]
    pub ambient_temperature: Option<f64>,
    pub units: TemperatureUnits,
    pub direction: ActuatorDirection,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn reading(
        temperature: f64,
        units: TemperatureUnits,
        direction: ActuatorDirection,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            ambient_temperature: Some(temperature),
            units,
            direction,
            timestamp,
        }
    }

    pub fn read_failure(
        units: TemperatureUnits,
        direction: ActuatorDirection,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            ambient_temperature: None,
            units,
            direction,
            timestamp,
        }
    }

    pub fn is_read_failure(&self) -> bool {
        self.ambient_temperature.is_none()
    }
}

/// Fixed-capacity ring of the most recent events. Once full, each push
/// overwrites the oldest record.
#[derive(Debug, Clone)]
pub struct EventLog {
    buffer: Vec<EventRecord>,
    capacity: usize,
    next: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventLog {
    /// A zero capacity is bumped to one so the log can always report the
    /// latest event.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn push(&mut self, record: EventRecord) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(record);
        } else {
            self.buffer[self.next] = record;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Oldest first.
    pub fn get_all(&self) -> Vec<EventRecord> {
        if self.buffer.len() < self.capacity {
            return self.buffer.clone();
        }

        let (newer, older) = self.buffer.split_at(self.next);
        older.iter().chain(newer).copied().collect()
    }

    pub fn last(&self) -> Option<&EventRecord> {
        if self.buffer.is_empty() {
            return None;
        }
        let index = (self.next + self.capacity - 1) % self.capacity;
        self.buffer.get(index)
    }
}
