use std::{io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use hvac_common::{
    ConfigError, HvacCommand, RuntimeConfig, SupervisorState, ThermostatConfig, TOPIC_CMD_HVAC,
    TOPIC_CONTROLLER_STATE, TOPIC_SENSOR_TEMP,
};

use crate::{
    actuator::{Actuator, ActuatorError},
    hardware::SimGpio,
    supervisor::PollSupervisor,
    thermometer::{MqttThermometer, Thermometer},
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const STATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Mutex<PollSupervisor>>,
    actuator: Actuator,
    thermometer: Arc<MqttThermometer>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Error)]
enum ApplyConfigError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),
    #[error("failed to persist thermostat config: {0:#}")]
    Persist(anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ViolationsBody {
    error: String,
    violations: Vec<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    for violation in runtime.sanitize() {
        warn!("stored thermostat config rejected, using defaults: {violation}");
    }

    let outputs = SimGpio::default()
        .open_outputs(&runtime.hardware)
        .context("failed to initialize hvac outputs")?;
    let actuator = Actuator::new(outputs, runtime.hardware.fan_cooldown());
    let thermometer = Arc::new(MqttThermometer::new(Duration::from_millis(
        runtime.thermometer.stale_after_ms,
    )));

    let mut supervisor = PollSupervisor::new(
        runtime.thermostat.clone(),
        actuator.clone(),
        thermometer.clone(),
    );
    supervisor
        .start()
        .context("failed to start poll supervisor")?;
    spawn_supervisor_watch(supervisor.subscribe());

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("hvac-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        supervisor: Arc::new(Mutex::new(supervisor)),
        actuator,
        thermometer,
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .route("/api/events", get(handle_get_events))
        .route("/api/hvac/{command}", post(handle_hvac_command))
        .layer(CorsLayer::permissive())
        .with_state(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(&app_state).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn shutdown(app_state: &AppState) {
    app_state.supervisor.lock().await.cancel().await;

    if let Err(err) = app_state.actuator.off().await {
        warn!("failed to turn hvac off: {err}");
    }
    if let Err(err) = app_state.actuator.shutdown().await {
        warn!("actuator shutdown failed: {err}");
    }
    app_state.thermometer.shutdown().await;

    if let Err(err) = app_state.mqtt.disconnect().await {
        warn!("mqtt disconnect failed: {err}");
    }
    info!("controller stopped");
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_SENSOR_TEMP, TOPIC_CMD_HVAC] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_supervisor_watch(mut state: watch::Receiver<SupervisorState>) {
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            match current {
                SupervisorState::Fatal => error!("poll supervisor stopped: FATAL"),
                other => info!("poll supervisor {}", other.as_str()),
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATE_PUBLISH_INTERVAL);
        loop {
            interval.tick().await;

            let payload = {
                let supervisor = app_state.supervisor.lock().await;
                serde_json::to_vec(&supervisor.status().await)
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;

    match topic {
        TOPIC_SENSOR_TEMP => {
            app_state
                .thermometer
                .ingest(&message)
                .context("bad sensor reading")?;
        }
        TOPIC_CMD_HVAC => {
            let Some(command) = HvacCommand::parse(&message) else {
                warn!("ignoring unknown hvac command '{}'", message.trim());
                return Ok(());
            };
            info!("manual hvac command over mqtt: {}", command.as_str());
            app_state.actuator.execute(command).await?;
        }
        _ => {}
    }

    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let supervisor = state.supervisor.lock().await;
    Json(supervisor.status().await)
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.supervisor.lock().await.config();
    Json((*config).clone())
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(config): Json<ThermostatConfig>,
) -> impl IntoResponse {
    match apply_thermostat_config(&state.supervisor, &state.store, config.clone()).await {
        Ok(()) => Json(config).into_response(),
        Err(ApplyConfigError::Invalid(err)) => violations_response(&err),
        Err(err) => {
            warn!("{err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist thermostat config; running config unchanged",
            )
        }
    }
}

/// Validates, stores, then applies `config`. A config that cannot be stored
/// never reaches the running supervisor.
async fn apply_thermostat_config(
    supervisor: &Mutex<PollSupervisor>,
    store: &AppStore,
    config: ThermostatConfig,
) -> Result<(), ApplyConfigError> {
    let mut supervisor = supervisor.lock().await;
    config.ensure_valid()?;
    persist_thermostat_config(store, &config)
        .await
        .map_err(ApplyConfigError::Persist)?;
    supervisor.reconfigure(config).await?;
    Ok(())
}

async fn handle_get_events(State(state): State<AppState>) -> impl IntoResponse {
    let events = state.supervisor.lock().await.events().await;
    Json(events)
}

async fn handle_hvac_command(
    State(state): State<AppState>,
    Path(command): Path<String>,
) -> impl IntoResponse {
    let Some(command) = HvacCommand::parse(&command) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid command. Use 'heat', 'cool', 'fan' or 'off'",
        );
    };

    info!("manual hvac command over http: {}", command.as_str());
    match state.actuator.execute(command).await {
        Ok(()) => {}
        Err(ActuatorError::ShutDown) => {
            return error_response(StatusCode::CONFLICT, "Actuator has been shut down");
        }
        Err(err) => {
            warn!("manual hvac command failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to drive outputs");
        }
    }

    handle_get_status(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HVAC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.hvac"));
        Self::at(data_dir)
    }

    fn at(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

async fn persist_thermostat_config(
    store: &AppStore,
    config: &ThermostatConfig,
) -> anyhow::Result<()> {
    let mut runtime = store.load_runtime_config().await?;
    runtime.thermostat = config.clone();
    store.save_runtime_config(&runtime).await
}

fn violations_response(err: &ConfigError) -> axum::response::Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ViolationsBody {
            error: "Invalid thermostat configuration".to_string(),
            violations: err.violations().iter().map(ToString::to_string).collect(),
        }),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvac_common::HardwareConfig;
    use pretty_assertions::assert_eq;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hvac-host-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_file(&dir);
        dir
    }

    fn supervisor() -> Mutex<PollSupervisor> {
        let outputs = SimGpio::default()
            .open_outputs(&HardwareConfig::default())
            .unwrap();
        let actuator = Actuator::new(outputs, Duration::from_secs(60));
        let thermometer = Arc::new(MqttThermometer::new(Duration::from_secs(300)));
        Mutex::new(PollSupervisor::new(
            ThermostatConfig::default(),
            actuator,
            thermometer,
        ))
    }

    fn edited_config() -> ThermostatConfig {
        ThermostatConfig {
            overshoot: 3.5,
            ..ThermostatConfig::default()
        }
    }

    #[tokio::test]
    async fn unstorable_config_is_not_applied() {
        // A regular file where the data directory's parent should be.
        let blocker = scratch_dir("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let store = AppStore::at(blocker.join("data"));
        let supervisor = supervisor();

        let result = apply_thermostat_config(&supervisor, &store, edited_config()).await;

        assert!(matches!(result, Err(ApplyConfigError::Persist(_))));
        assert_eq!(*supervisor.lock().await.config(), ThermostatConfig::default());
        std::fs::remove_file(&blocker).unwrap();
    }

    #[tokio::test]
    async fn stored_config_is_applied() {
        let dir = scratch_dir("store");
        let store = AppStore::at(dir.clone());
        let supervisor = supervisor();

        apply_thermostat_config(&supervisor, &store, edited_config())
            .await
            .unwrap();

        assert_eq!(*supervisor.lock().await.config(), edited_config());
        let stored = store.load_runtime_config().await.unwrap();
        assert_eq!(stored.thermostat, edited_config());

        supervisor.lock().await.cancel().await;
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_neither_stored_nor_applied() {
        let dir = scratch_dir("invalid");
        let store = AppStore::at(dir.clone());
        let supervisor = supervisor();
        let config = ThermostatConfig {
            default_mode: "gone".to_string(),
            ..ThermostatConfig::default()
        };

        let result = apply_thermostat_config(&supervisor, &store, config).await;

        assert!(matches!(result, Err(ApplyConfigError::Invalid(_))));
        assert!(!dir.join("runtime.json").exists());
        assert_eq!(*supervisor.lock().await.config(), ThermostatConfig::default());
    }
}
