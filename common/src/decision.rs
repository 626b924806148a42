use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    config::Mode,
    types::{ActuatorDirection, HvacCommand, TemperatureReading, TemperatureUnits},
};

/// Span over which the fan must run for at least the configured minimum.
pub const FAN_CYCLE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct DecisionInput {
    pub reading: TemperatureReading,
    pub unit_preference: TemperatureUnits,
    pub window: Mode,
    pub overshoot: f64,
    pub direction: ActuatorDirection,
    pub last_fan_on_at: DateTime<Utc>,
    pub min_fan_runtime: Duration,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Reading expressed in the preferred units.
    pub temperature: f64,
    pub command: Option<HvacCommand>,
    pub last_fan_on_at: DateTime<Utc>,
}

impl Decision {
    pub fn reason(&self) -> &'static str {
        match self.command {
            Some(HvacCommand::Off) => "window satisfied",
            Some(HvacCommand::Heat) => "below window",
            Some(HvacCommand::Cool) => "above window",
            Some(HvacCommand::Fan) => "fan circulation due",
            None => "no change",
        }
    }
}

/// Chooses the next actuator command. Rules are checked in priority order and
/// the first one that applies wins.
pub fn decide(input: &DecisionInput) -> Decision {
    let temp = input.reading.in_units(input.unit_preference);
    let window = input.window;
    let now = input.now;
    let fan_runtime = to_delta(input.min_fan_runtime);
    let fan_cycling = !fan_runtime.is_zero();

    let command_at = |command, last_fan_on_at| Decision {
        temperature: temp,
        command: Some(command),
        last_fan_on_at,
    };

    let heating_done =
        input.direction == ActuatorDirection::Heating && temp > window.low + input.overshoot;
    let cooling_done =
        input.direction == ActuatorDirection::Cooling && temp < window.high - input.overshoot;
    // While the fan runs on its own, `last_fan_on_at` holds the time it is due to stop.
    let fan_done =
        fan_cycling && input.direction == ActuatorDirection::FanOnly && now >= input.last_fan_on_at;

    if heating_done || cooling_done || fan_done {
        return command_at(HvacCommand::Off, now);
    }

    if temp < window.low {
        return command_at(HvacCommand::Heat, now);
    }

    if temp > window.high {
        return command_at(HvacCommand::Cool, now);
    }

    if fan_cycling && now - input.last_fan_on_at > to_delta(FAN_CYCLE) - fan_runtime {
        let stop_at = now
            .checked_add_signed(fan_runtime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        return command_at(HvacCommand::Fan, stop_at);
    }

    Decision {
        temperature: temp,
        command: None,
        last_fan_on_at: input.last_fan_on_at,
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    fn input(temp: f64, direction: ActuatorDirection) -> DecisionInput {
        DecisionInput {
            reading: TemperatureReading::new(temp, TemperatureUnits::Fahrenheit),
            unit_preference: TemperatureUnits::Fahrenheit,
            window: Mode::new(69.0, 80.0),
            overshoot: 3.0,
            direction,
            last_fan_on_at: start(),
            min_fan_runtime: Duration::ZERO,
            now: start() + TimeDelta::minutes(1),
        }
    }

    #[test]
    fn heats_then_stops_then_cools() {
        let decision = decide(&input(68.9, ActuatorDirection::Off));
        assert_eq!(decision.command, Some(HvacCommand::Heat));

        let decision = decide(&input(72.5, ActuatorDirection::Heating));
        assert_eq!(decision.command, Some(HvacCommand::Off));

        let decision = decide(&input(82.0, ActuatorDirection::Off));
        assert_eq!(decision.command, Some(HvacCommand::Cool));
    }

    #[test]
    fn keeps_heating_inside_overshoot_band() {
        let decision = decide(&input(71.9, ActuatorDirection::Heating));

        assert_eq!(decision.command, None);
        assert_eq!(decision.last_fan_on_at, start());
    }

    #[test]
    fn stop_condition_takes_precedence() {
        // Far above the window while heating: stop first, cooling comes on a later tick.
        let decision = decide(&input(90.0, ActuatorDirection::Heating));
        assert_eq!(decision.command, Some(HvacCommand::Off));

        let decision = decide(&input(60.0, ActuatorDirection::Cooling));
        assert_eq!(decision.command, Some(HvacCommand::Off));
        assert_eq!(decision.last_fan_on_at, start() + TimeDelta::minutes(1));
    }

    #[test]
    fn stops_cooling_below_high_minus_overshoot() {
        let decision = decide(&input(77.5, ActuatorDirection::Cooling));
        assert_eq!(decision.command, None);

        let decision = decide(&input(76.9, ActuatorDirection::Cooling));
        assert_eq!(decision.command, Some(HvacCommand::Off));
    }

    #[test]
    fn normalizes_reading_to_preferred_units() {
        // 20C is 68F, below a 69F low bound.
        let mut celsius = input(20.0, ActuatorDirection::Off);
        celsius.reading.units = TemperatureUnits::Celsius;

        let decision = decide(&celsius);

        assert_eq!(decision.command, Some(HvacCommand::Heat));
        assert!((decision.temperature - 68.0).abs() < 1e-9);
    }

    #[test]
    fn cycles_fan_for_minimum_runtime_each_hour() {
        let fan_runtime = Duration::from_secs(10 * 60);
        let mut idle = input(72.0, ActuatorDirection::Off);
        idle.min_fan_runtime = fan_runtime;

        idle.now = start() + TimeDelta::minutes(50);
        assert_eq!(decide(&idle).command, None);

        idle.now = start() + TimeDelta::minutes(51);
        let decision = decide(&idle);
        assert_eq!(decision.command, Some(HvacCommand::Fan));
        assert_eq!(decision.last_fan_on_at, idle.now + TimeDelta::minutes(10));

        let mut running = idle;
        running.direction = ActuatorDirection::FanOnly;
        running.last_fan_on_at = decision.last_fan_on_at;

        running.now = idle.now + TimeDelta::minutes(9);
        assert_eq!(decide(&running).command, None);

        running.now = idle.now + TimeDelta::minutes(10);
        let stop = decide(&running);
        assert_eq!(stop.command, Some(HvacCommand::Off));
        assert_eq!(stop.last_fan_on_at, running.now);
    }

    #[test]
    fn fan_cycling_disabled_without_minimum_runtime() {
        let mut idle = input(72.0, ActuatorDirection::FanOnly);
        idle.now = start() + TimeDelta::hours(5);

        assert_eq!(decide(&idle).command, None);
    }

    #[test]
    fn oversized_fan_runtime_saturates_stop_time() {
        let mut idle = input(72.0, ActuatorDirection::Off);
        idle.min_fan_runtime = Duration::from_millis(10_000_000_000_000_000);

        let decision = decide(&idle);

        assert_eq!(decision.command, Some(HvacCommand::Fan));
        assert_eq!(decision.last_fan_on_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn demand_overrides_running_fan() {
        let mut running = input(60.0, ActuatorDirection::FanOnly);
        running.min_fan_runtime = Duration::from_secs(600);
        running.last_fan_on_at = running.now + TimeDelta::minutes(5);

        let decision = decide(&running);

        assert_eq!(decision.command, Some(HvacCommand::Heat));
        assert_eq!(decision.reason(), "below window");
    }
}
