//! Poll supervisor.
//!
//! Runs the read-decide-act cycle on a timer in its own task. The running
//! loop works from an immutable snapshot of the configuration; changing it
//! means cancelling the loop, swapping the snapshot and starting again.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::{
    sync::{oneshot, watch, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use hvac_common::{
    decide, resolve_window, ConfigError, DecisionInput, EventLog, EventRecord, SupervisorState,
    ThermostatConfig, ThermostatStatus,
};

use crate::{
    actuator::{Actuator, ActuatorError},
    thermometer::Thermometer,
};

struct RunningLoop {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct PollSupervisor {
    actuator: Actuator,
    thermometer: Arc<dyn Thermometer>,
    events: Arc<Mutex<EventLog>>,
    config: Arc<ThermostatConfig>,
    errors: Arc<AtomicU8>,
    state: Arc<watch::Sender<SupervisorState>>,
    running: Option<RunningLoop>,
}

impl PollSupervisor {
    pub fn new(
        config: ThermostatConfig,
        actuator: Actuator,
        thermometer: Arc<dyn Thermometer>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            actuator,
            thermometer,
            events: Arc::new(Mutex::new(EventLog::default())),
            config: Arc::new(config),
            errors: Arc::new(AtomicU8::new(0)),
            state: Arc::new(state),
            running: None,
        }
    }

    /// Spawns the poll loop. Does nothing if a loop is already running.
    pub fn start(&mut self) -> Result<(), ConfigError> {
        self.config.ensure_valid()?;
        if self.running.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            debug!("poll loop already running");
            return Ok(());
        }

        let (cancel, cancelled) = oneshot::channel();
        let poll_loop = PollLoop {
            actuator: self.actuator.clone(),
            thermometer: Arc::clone(&self.thermometer),
            events: Arc::clone(&self.events),
            config: Arc::clone(&self.config),
            errors: Arc::clone(&self.errors),
            state: Arc::clone(&self.state),
        };

        self.errors.store(0, Ordering::Relaxed);
        self.state.send_replace(SupervisorState::Polling);
        info!(
            "poll loop starting every {:?}",
            self.config.poll_interval()
        );
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            // A panic inside the loop would otherwise leave the state at POLLING.
            if let Err(err) = tokio::spawn(poll_loop.run(cancelled)).await {
                error!("poll loop task failed: {err}");
                state.send_replace(SupervisorState::Fatal);
            }
        });
        self.running = Some(RunningLoop { cancel, handle });
        Ok(())
    }

    /// Stops the poll loop and waits for it to exit. Outputs stay as they
    /// were last commanded.
    pub async fn cancel(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.cancel.send(());
        if let Err(err) = running.handle.await {
            error!("poll loop task failed: {err}");
            self.state.send_replace(SupervisorState::Fatal);
        }
    }

    /// Validates `config` and restarts the loop with it. An invalid config is
    /// rejected before the running loop is touched.
    pub async fn reconfigure(&mut self, config: ThermostatConfig) -> Result<(), ConfigError> {
        config.ensure_valid()?;
        self.cancel().await;
        self.config = Arc::new(config);
        info!("thermostat configuration replaced");
        self.start()
    }

    pub fn config(&self) -> Arc<ThermostatConfig> {
        Arc::clone(&self.config)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn consecutive_errors(&self) -> u8 {
        self.errors.load(Ordering::Relaxed)
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.lock().await.get_all()
    }

    pub fn active_mode(&self, now: DateTime<Utc>) -> Option<String> {
        let tz = self.config.tz()?;
        resolve_window(&now.with_timezone(&tz), &self.config)
            .ok()
            .map(|window| window.mode_name.to_string())
    }

    pub async fn status(&self) -> ThermostatStatus {
        let actuator = self.actuator.state().await;
        let outputs = self.actuator.outputs().await;
        let events = self.events.lock().await;

        ThermostatStatus {
            config: (*self.config).clone(),
            active_mode: self.active_mode(Utc::now()),
            actuator,
            outputs,
            supervisor: self.state(),
            consecutive_errors: self.consecutive_errors(),
            last_event: events.last().copied(),
            events: events.get_all(),
        }
    }
}

struct PollLoop {
    actuator: Actuator,
    thermometer: Arc<dyn Thermometer>,
    events: Arc<Mutex<EventLog>>,
    config: Arc<ThermostatConfig>,
    errors: Arc<AtomicU8>,
    state: Arc<watch::Sender<SupervisorState>>,
}

impl PollLoop {
    async fn run(self, mut cancelled: oneshot::Receiver<()>) {
        let period = self.config.poll_interval();
        let min_gap = period / 2;

        let mut last_cycle = Instant::now();
        if self.cycle().await.is_err() {
            self.halt();
            return;
        }

        let mut ticker = tokio::time::interval_at(last_cycle + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                _ = ticker.tick() => {
                    let since_last = last_cycle.elapsed();
                    if since_last < min_gap {
                        debug!("skipping tick {since_last:?} after the previous cycle");
                        continue;
                    }
                    last_cycle = Instant::now();
                    if self.cycle().await.is_err() {
                        self.halt();
                        return;
                    }
                }
            }
        }

        info!("poll loop cancelled");
        self.state.send_replace(SupervisorState::Cancelled);
    }

    fn halt(&self) {
        error!("actuator is shut down; poll loop stopping");
        self.state.send_replace(SupervisorState::Fatal);
    }

    /// One read-decide-act pass. Only a shut-down actuator is reported back;
    /// every other failure is logged and absorbed.
    async fn cycle(&self) -> Result<(), ActuatorError> {
        let now = Utc::now();
        let units = self.config.unit_preference;

        let record = match self.thermometer.read_temperature().await {
            Ok(reading) => {
                self.errors.store(0, Ordering::Relaxed);

                let tz = self.config.tz().unwrap_or(Tz::UTC);
                let window = match resolve_window(&now.with_timezone(&tz), &self.config) {
                    Ok(window) => window,
                    Err(err) => {
                        warn!("no comfort window, leaving hvac as is: {err}");
                        let direction = self.actuator.direction().await;
                        let record =
                            EventRecord::reading(reading.in_units(units), units, direction, now);
                        self.events.lock().await.push(record);
                        return Ok(());
                    }
                };

                let actuator = self.actuator.state().await;
                let decision = decide(&DecisionInput {
                    reading,
                    unit_preference: units,
                    window: window.mode,
                    overshoot: self.config.overshoot,
                    direction: actuator.direction,
                    last_fan_on_at: actuator.last_fan_on_at,
                    min_fan_runtime: self.config.min_fan_runtime(),
                    now,
                });
                info!(
                    "{:.1} {} in '{}' [{:.1}, {:.1}], {}: {}",
                    decision.temperature,
                    units.as_str(),
                    window.mode_name,
                    window.mode.low,
                    window.mode.high,
                    actuator.direction.as_str(),
                    decision.reason()
                );

                let direction = match self.actuator.apply(&decision).await {
                    Ok(direction) => direction,
                    Err(ActuatorError::ShutDown) => return Err(ActuatorError::ShutDown),
                    Err(err) => {
                        warn!("failed to apply decision: {err}");
                        self.actuator.direction().await
                    }
                };
                EventRecord::reading(decision.temperature, units, direction, now)
            }
            Err(err) => {
                let failures = self.record_failure();
                warn!("temperature read failed ({failures} in a row): {err}");

                if failures > self.config.max_consecutive_errors {
                    warn!("too many consecutive read failures, turning hvac off");
                    match self.actuator.off().await {
                        Ok(()) => {}
                        Err(ActuatorError::ShutDown) => return Err(ActuatorError::ShutDown),
                        Err(err) => warn!("failed to turn hvac off: {err}"),
                    }
                    self.errors.store(0, Ordering::Relaxed);
                }

                EventRecord::read_failure(units, self.actuator.direction().await, now)
            }
        };

        self.events.lock().await.push(record);
        Ok(())
    }

    fn record_failure(&self) -> u8 {
        let previous = self
            .errors
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_add(1))
            })
            .unwrap_or(u8::MAX);
        previous.saturating_add(1)
    }
}
