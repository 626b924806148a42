use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{debug, info, warn};

use hvac_common::{
    types::f_to_c, TemperatureReading, TemperatureUnits, TOPIC_SENSOR_STATUS, TOPIC_SENSOR_TEMP,
};

const DEFAULT_INTERVAL_SECS: u64 = 30;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let interval_secs = std::env::var("SENSOR_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_INTERVAL_SECS);
    let units = std::env::var("SENSOR_UNITS")
        .ok()
        .and_then(|value| parse_units(&value))
        .unwrap_or(TemperatureUnits::Celsius);

    let mut mqtt_options = MqttOptions::new("hvac-sensor", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    mqtt.publish(TOPIC_SENSOR_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish sensor online status")?;

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!(
        "sensor publisher started ({}s interval, {})",
        interval_secs,
        units.as_str()
    );

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        let reading = simulated_reading(tick, units);
        let payload = serde_json::to_vec(&reading).context("failed to encode reading")?;
        debug!(
            "publishing {:.2} {}",
            reading.temperature,
            reading.units.as_str()
        );

        mqtt.publish(TOPIC_SENSOR_TEMP, QoS::AtLeastOnce, true, payload)
            .await
            .context("failed to publish sensor temperature")?;
    }
}

fn parse_units(value: &str) -> Option<TemperatureUnits> {
    match value.trim().to_ascii_lowercase().as_str() {
        "c" | "celsius" => Some(TemperatureUnits::Celsius),
        "f" | "fahrenheit" => Some(TemperatureUnits::Fahrenheit),
        _ => None,
    }
}

/// A room drifting in a slow triangle between 66F and 74F, one step per tick.
fn simulated_reading(tick: u64, units: TemperatureUnits) -> TemperatureReading {
    let phase = (tick % 40) as f64;
    let offset = if phase < 20.0 { phase } else { 40.0 - phase };
    let temperature_f = 66.0 + offset * 0.4;

    let temperature = match units {
        TemperatureUnits::Fahrenheit => temperature_f,
        TemperatureUnits::Celsius => f_to_c(temperature_f),
    };
    TemperatureReading::new((temperature * 100.0).round() / 100.0, units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_names() {
        assert_eq!(parse_units("Celsius"), Some(TemperatureUnits::Celsius));
        assert_eq!(parse_units(" f "), Some(TemperatureUnits::Fahrenheit));
        assert_eq!(parse_units("kelvin"), None);
    }

    #[test]
    fn simulated_room_stays_in_band() {
        for tick in 0..100 {
            let reading = simulated_reading(tick, TemperatureUnits::Fahrenheit);
            assert!((66.0..=74.0).contains(&reading.temperature));
        }

        let reading = simulated_reading(0, TemperatureUnits::Celsius);
        assert_eq!(reading.units, TemperatureUnits::Celsius);
        assert!((reading.temperature - 18.89).abs() < 1e-9);
    }
}
