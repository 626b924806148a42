//! Actuator state machine.
//!
//! [`Actuator`] is a cloneable handle around the single owner of the HVAC
//! outputs. Every transition runs under one async mutex, which also guards
//! the fan cooldown timer, so the poll loop, manual overrides and the
//! cooldown task can never interleave half-applied output changes.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use hvac_common::{ActuatorDirection, ActuatorState, Decision, HvacCommand, OutputLevels};

use crate::hardware::{HardwareError, HvacOutputs, OutputLine};

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("actuator has been shut down")]
    ShutDown,
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

#[derive(Clone)]
pub struct Actuator {
    shared: Arc<Mutex<ActuatorInner>>,
    fan_cooldown: Duration,
}

struct Cooldown {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

struct ActuatorInner {
    outputs: Option<Box<dyn HvacOutputs>>,
    levels: OutputLevels,
    direction: ActuatorDirection,
    last_fan_on_at: DateTime<Utc>,
    cooldown: Option<Cooldown>,
    cooldown_generation: u64,
}

impl ActuatorInner {
    fn ensure_running(&self) -> Result<(), ActuatorError> {
        if self.outputs.is_some() {
            Ok(())
        } else {
            Err(ActuatorError::ShutDown)
        }
    }

    fn drive(&mut self, line: OutputLine, active: bool) -> Result<(), ActuatorError> {
        let outputs = self.outputs.as_mut().ok_or(ActuatorError::ShutDown)?;
        outputs.write(line, active)?;
        match line {
            OutputLine::Heat => self.levels.heat = active,
            OutputLine::Cool => self.levels.cool = active,
            OutputLine::Fan => self.levels.fan = active,
        }
        Ok(())
    }

    /// The cooldown task is told to stand down; it never touches the fan
    /// after a cancel, so the caller's fan ON write is seamless.
    fn cancel_cooldown(&mut self) {
        if let Some(cooldown) = self.cooldown.take() {
            let _ = cooldown.cancel.send(());
            debug!("fan cooldown cancelled");
        }
    }

    /// Best-effort stop after a failed transition. The direction follows the
    /// levels the lines actually hold.
    fn fail_safe(&mut self) {
        self.cancel_cooldown();
        for line in [OutputLine::Heat, OutputLine::Cool, OutputLine::Fan] {
            if let Err(err) = self.drive(line, false) {
                warn!("failed to switch {line} off: {err}");
            }
        }

        self.direction = if self.levels.heat {
            ActuatorDirection::Heating
        } else if self.levels.cool {
            ActuatorDirection::Cooling
        } else if self.levels.fan {
            ActuatorDirection::FanOnly
        } else {
            ActuatorDirection::Off
        };
    }

    fn state(&self) -> ActuatorState {
        ActuatorState {
            direction: self.direction,
            fan_cooldown_active: self.cooldown.is_some(),
            last_fan_on_at: self.last_fan_on_at,
        }
    }
}

impl Actuator {
    /// Outputs are expected to be idle (every line inactive) when handed over.
    pub fn new<O: HvacOutputs>(outputs: O, fan_cooldown: Duration) -> Self {
        info!("fan cooldown set to {fan_cooldown:?}");
        Self {
            shared: Arc::new(Mutex::new(ActuatorInner {
                outputs: Some(Box::new(outputs)),
                levels: OutputLevels::default(),
                direction: ActuatorDirection::Off,
                last_fan_on_at: Utc::now(),
                cooldown: None,
                cooldown_generation: 0,
            })),
            fan_cooldown,
        }
    }

    pub async fn heat(&self) -> Result<(), ActuatorError> {
        self.execute(HvacCommand::Heat).await
    }

    pub async fn cool(&self) -> Result<(), ActuatorError> {
        self.execute(HvacCommand::Cool).await
    }

    pub async fn fan(&self) -> Result<(), ActuatorError> {
        self.execute(HvacCommand::Fan).await
    }

    pub async fn off(&self) -> Result<(), ActuatorError> {
        self.execute(HvacCommand::Off).await
    }

    pub async fn execute(&self, command: HvacCommand) -> Result<(), ActuatorError> {
        let mut inner = self.shared.lock().await;
        self.execute_locked(&mut inner, command)
    }

    /// Applies a decision's command (if any) and stores its fan timestamp as
    /// one step. Returns the direction in force afterwards.
    pub async fn apply(&self, decision: &Decision) -> Result<ActuatorDirection, ActuatorError> {
        let mut inner = self.shared.lock().await;
        inner.ensure_running()?;
        if let Some(command) = decision.command {
            self.execute_locked(&mut inner, command)?;
        }
        inner.last_fan_on_at = decision.last_fan_on_at;
        Ok(inner.direction)
    }

    /// Cancels any cooldown, forces every output off and releases the
    /// hardware. Every later operation fails with [`ActuatorError::ShutDown`].
    pub async fn shutdown(&self) -> Result<(), ActuatorError> {
        let mut inner = self.shared.lock().await;
        if inner.outputs.is_none() {
            return Ok(());
        }

        inner.cancel_cooldown();
        let mut first_error = None;
        for line in [OutputLine::Cool, OutputLine::Heat, OutputLine::Fan] {
            if let Err(err) = inner.drive(line, false) {
                warn!("failed to switch {line} off during shutdown: {err}");
                first_error.get_or_insert(err);
            }
        }
        inner.direction = ActuatorDirection::Off;
        if let Some(mut outputs) = inner.outputs.take() {
            outputs.release();
        }
        info!("actuator shut down");

        first_error.map_or(Ok(()), Err)
    }

    pub async fn direction(&self) -> ActuatorDirection {
        self.shared.lock().await.direction
    }

    pub async fn state(&self) -> ActuatorState {
        self.shared.lock().await.state()
    }

    pub async fn outputs(&self) -> OutputLevels {
        self.shared.lock().await.levels
    }

    fn execute_locked(
        &self,
        inner: &mut ActuatorInner,
        command: HvacCommand,
    ) -> Result<(), ActuatorError> {
        inner.ensure_running()?;
        let previous = inner.direction;

        if let Err(err) = self.transition(inner, previous, command) {
            warn!("{} failed, switching outputs off: {err}", command.as_str());
            inner.fail_safe();
            return Err(err);
        }

        inner.direction = command.direction();
        if previous != inner.direction {
            info!("hvac {} -> {}", previous.as_str(), inner.direction.as_str());
        }
        Ok(())
    }

    fn transition(
        &self,
        inner: &mut ActuatorInner,
        previous: ActuatorDirection,
        command: HvacCommand,
    ) -> Result<(), ActuatorError> {
        match command {
            HvacCommand::Heat => {
                inner.cancel_cooldown();
                inner.drive(OutputLine::Fan, true)?;
                inner.drive(OutputLine::Cool, false)?;
                inner.drive(OutputLine::Heat, true)?;
            }
            HvacCommand::Cool => {
                inner.cancel_cooldown();
                inner.drive(OutputLine::Fan, true)?;
                inner.drive(OutputLine::Heat, false)?;
                inner.drive(OutputLine::Cool, true)?;
            }
            HvacCommand::Fan => {
                inner.cancel_cooldown();
                inner.drive(OutputLine::Fan, true)?;
                inner.drive(OutputLine::Heat, false)?;
                inner.drive(OutputLine::Cool, false)?;
            }
            HvacCommand::Off => {
                inner.drive(OutputLine::Heat, false)?;
                inner.drive(OutputLine::Cool, false)?;
                if previous.is_conditioning() {
                    self.start_cooldown(inner);
                } else if inner.cooldown.is_none() {
                    inner.drive(OutputLine::Fan, false)?;
                }
            }
        }
        Ok(())
    }

    fn start_cooldown(&self, inner: &mut ActuatorInner) {
        inner.cooldown_generation += 1;
        let generation = inner.cooldown_generation;
        let (cancel, cancelled) = oneshot::channel();
        inner.cooldown = Some(Cooldown { generation, cancel });

        let shared = Arc::downgrade(&self.shared);
        let duration = self.fan_cooldown;
        debug!("fan cooldown started for {duration:?}");

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = cancelled => return,
            }
            finish_cooldown(shared, generation).await;
        });
    }
}

async fn finish_cooldown(shared: Weak<Mutex<ActuatorInner>>, generation: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut inner = shared.lock().await;

    // A newer transition may have taken the lock between the timer firing
    // and this task acquiring it.
    if inner.cooldown.as_ref().map(|cooldown| cooldown.generation) != Some(generation) {
        return;
    }

    inner.cooldown = None;
    match inner.drive(OutputLine::Fan, false) {
        Ok(()) => debug!("fan cooldown finished"),
        Err(err) => warn!("failed to stop fan after cooldown: {err}"),
    }
}
