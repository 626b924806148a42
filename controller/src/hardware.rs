//! Physical HVAC control lines.
//!
//! The actuator only speaks in logical terms ("fan on"); [`PinOutputs`] maps
//! that onto electrical levels. Relay boards on the reference wiring close
//! when the pin is driven low, so `active_low` is the default.

use std::{
    collections::BTreeSet,
    convert::Infallible,
    fmt,
    sync::{Arc, Mutex},
};

use embedded_hal::digital::{ErrorType, OutputPin};
use thiserror::Error;
use tracing::{debug, info};

use hvac_common::HardwareConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine {
    Heat,
    Cool,
    Fan,
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Heat => "HEAT",
            Self::Cool => "COOL",
            Self::Fan => "FAN",
        })
    }
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("pin {0} is already claimed")]
    PinConflict(u8),
    #[error("failed to drive {line} output: {reason}")]
    Write { line: OutputLine, reason: String },
}

/// Write access to the heat, cool and fan control lines.
pub trait HvacOutputs: Send + 'static {
    fn write(&mut self, line: OutputLine, active: bool) -> Result<(), HardwareError>;

    /// Hands the lines back to the platform. Called once, after every line
    /// has been driven inactive.
    fn release(&mut self);
}

pub struct PinOutputs<P> {
    heat: P,
    cool: P,
    fan: P,
    active_low: bool,
}

impl<P> PinOutputs<P>
where
    P: OutputPin + Send + 'static,
{
    /// Takes ownership of the pins and drives every line inactive before
    /// returning, so nothing is energized by a half-initialized board.
    pub fn new(heat: P, cool: P, fan: P, active_low: bool) -> Result<Self, HardwareError> {
        let mut outputs = Self {
            heat,
            cool,
            fan,
            active_low,
        };
        for line in [OutputLine::Fan, OutputLine::Heat, OutputLine::Cool] {
            outputs.write(line, false)?;
        }
        Ok(outputs)
    }

    fn pin(&mut self, line: OutputLine) -> &mut P {
        match line {
            OutputLine::Heat => &mut self.heat,
            OutputLine::Cool => &mut self.cool,
            OutputLine::Fan => &mut self.fan,
        }
    }
}

impl<P> HvacOutputs for PinOutputs<P>
where
    P: OutputPin + Send + 'static,
{
    fn write(&mut self, line: OutputLine, active: bool) -> Result<(), HardwareError> {
        let drive_high = active != self.active_low;
        let pin = self.pin(line);
        let result = if drive_high {
            pin.set_high()
        } else {
            pin.set_low()
        };
        result.map_err(|err| HardwareError::Write {
            line,
            reason: format!("{err:?}"),
        })
    }

    fn release(&mut self) {
        debug!("hvac output pins released");
    }
}

/// Stand-in for a GPIO line on hosts without one. Level changes are logged
/// and the last level is observable through [`SimPin::is_high`].
#[derive(Debug)]
pub struct SimPin {
    number: u8,
    high: bool,
    claims: Arc<Mutex<BTreeSet<u8>>>,
}

/// Hands out [`SimPin`]s, refusing to give the same pin number out twice.
#[derive(Debug, Clone, Default)]
pub struct SimGpio {
    claims: Arc<Mutex<BTreeSet<u8>>>,
}

impl SimGpio {
    pub fn claim(&self, number: u8) -> Result<SimPin, HardwareError> {
        let mut claims = self
            .claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !claims.insert(number) {
            return Err(HardwareError::PinConflict(number));
        }
        Ok(SimPin {
            number,
            high: false,
            claims: Arc::clone(&self.claims),
        })
    }

    pub fn open_outputs(&self, config: &HardwareConfig) -> Result<PinOutputs<SimPin>, HardwareError> {
        info!(
            "using pins heat={} cool={} fan={} (active_low={})",
            config.heat_pin, config.cool_pin, config.fan_pin, config.active_low
        );
        let heat = self.claim(config.heat_pin)?;
        let cool = self.claim(config.cool_pin)?;
        let fan = self.claim(config.fan_pin)?;
        PinOutputs::new(heat, cool, fan, config.active_low)
    }
}

impl SimPin {
    pub fn is_high(&self) -> bool {
        self.high
    }

    fn drive(&mut self, high: bool) {
        if self.high != high {
            debug!("pin {} -> {}", self.number, if high { "HIGH" } else { "LOW" });
        }
        self.high = high;
    }
}

impl Drop for SimPin {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(&self.number);
        }
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true);
        Ok(())
    }
}
