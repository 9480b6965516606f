use std::{
    collections::HashMap, io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
};
use tracing::{debug, info, warn};

use dimmer_common::{
    boot_mode, BootMode, ChannelRegistry, ChannelSlot, DeviceConfig, PortalForm,
    PwmWrite, ResetCycleTracker, ResetMarker, VirtualDeviceId,
};

use crate::portal::{SetupRequest, PORTAL_HTML};

#[derive(Clone)]
struct ConfigStore {
    config_path: Arc<PathBuf>,
    marker_path: Arc<PathBuf>,
    wifi_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("DIMMER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.dimmer"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            marker_path: Arc::new(data_dir.join("reset_marker.json")),
            wifi_path: Arc::new(data_dir.join("wifi.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Loading never fails: anything unusable is logged and replaced with
    /// defaults, and an empty identity is resolved from the hardware id.
    async fn load_config(&self, chip_id: u32) -> DeviceConfig {
        let _guard = self.lock.lock().await;
        let mut config = match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => match DeviceConfig::from_json(&raw) {
                Ok(config) => config,
                Err(err) => {
                    warn!("stored config is unusable ({err}); using defaults");
                    DeviceConfig::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no stored config; using defaults");
                DeviceConfig::default()
            }
            Err(err) => {
                warn!("failed to read config file: {err}; using defaults");
                DeviceConfig::default()
            }
        };
        config.resolve_identity(chip_id);
        config
    }

    async fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = config.to_json()?;

        // Write-then-rename: a failed write leaves the previous file as the
        // readable current config instead of a truncated one.
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, &payload)
            .await
            .context("failed to write config staging file")?;
        tokio::fs::rename(&staging, path)
            .await
            .context("failed to move config into place")?;
        Ok(())
    }

    async fn load_marker(&self) -> Option<ResetMarker> {
        let raw = tokio::fs::read(self.marker_path.as_ref()).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn save_marker(&self, marker: ResetMarker) {
        let path = self.marker_path.as_ref();
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!("failed to create data dir for reset marker: {err}");
                return;
            }
        }
        match serde_json::to_vec(&marker) {
            Ok(payload) => {
                if let Err(err) = tokio::fs::write(path, payload).await {
                    warn!("failed to write reset marker: {err}");
                }
            }
            Err(err) => warn!("failed to encode reset marker: {err}"),
        }
    }

    async fn clear_marker(&self) {
        if let Err(err) = tokio::fs::remove_file(self.marker_path.as_ref()).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to clear reset marker: {err}");
            }
        }
    }
}

/// Stand-in for the station network interface: credentials live in a small
/// file and "joining" is a log line.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WifiCredentials {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    pass: String,
}

#[derive(Clone)]
struct HostNetwork {
    path: Arc<PathBuf>,
}

impl HostNetwork {
    fn new(store: &ConfigStore) -> Self {
        Self {
            path: store.wifi_path.clone(),
        }
    }

    async fn stored_ssid(&self) -> Option<String> {
        let raw = tokio::fs::read(self.path.as_ref()).await.ok()?;
        let credentials: WifiCredentials = serde_json::from_slice(&raw).ok()?;
        if credentials.ssid.is_empty() {
            None
        } else {
            Some(credentials.ssid)
        }
    }

    async fn store_credentials(&self, ssid: &str, pass: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec(&WifiCredentials {
            ssid: ssid.to_string(),
            pass: pass.to_string(),
        })?;
        tokio::fs::write(self.path.as_ref(), payload).await?;
        Ok(())
    }

    async fn join(&self) -> anyhow::Result<()> {
        match self.stored_ssid().await {
            Some(ssid) => {
                info!("joined network `{ssid}` (simulated)");
                Ok(())
            }
            None => anyhow::bail!("no stored network credentials"),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let network = HostNetwork::new(&store);
    let chip_id = host_chip_id();

    let mut config = store.load_config(chip_id).await;

    let mut tracker = ResetCycleTracker::new(store.load_marker().await, now_ms());
    store.save_marker(tracker.armed_marker()).await;
    let double_reset = tracker.take_double_reset();
    spawn_reset_window(store.clone(), tracker);

    let has_credentials = network.stored_ssid().await.is_some();
    let mode = boot_mode(has_credentials, double_reset);
    info!(
        "boot mode {} (credentials stored: {has_credentials}, double reset: {double_reset})",
        mode.as_str()
    );

    if mode == BootMode::Setup {
        run_setup(&store, &network, &mut config, chip_id).await?;
    }

    if let Err(err) = network.join().await {
        warn!("failed to join network: {err:#}; continuing startup");
    }

    serve_control(config).await
}

async fn run_setup(
    store: &ConfigStore,
    network: &HostNetwork,
    config: &mut DeviceConfig,
    chip_id: u32,
) -> anyhow::Result<()> {
    debug!("status led on (setup portal active)");

    let submission = serve_portal(PortalForm::from_config(config)).await?;
    submission.form.apply_to(config);
    config.resolve_identity(chip_id);

    if !submission.wifi_ssid.is_empty() {
        if let Err(err) = network
            .store_credentials(&submission.wifi_ssid, &submission.wifi_pass)
            .await
        {
            warn!("failed to store network credentials: {err:#}");
        }
    }

    // The config captured by the portal is saved even if the join fails.
    if let Err(err) = store.save_config(config).await {
        warn!("failed to save configuration: {err:#}");
    }

    debug!("status led off (setup portal closed)");
    Ok(())
}

#[derive(Clone)]
struct PortalState {
    initial: Arc<PortalForm>,
    submit: Arc<Mutex<Option<oneshot::Sender<SetupRequest>>>>,
}

/// Serves the captive portal and blocks until the form is submitted.
async fn serve_portal(initial: PortalForm) -> anyhow::Result<SetupRequest> {
    let (submit_tx, submit_rx) = oneshot::channel();
    let state = PortalState {
        initial: Arc::new(initial),
        submit: Arc::new(Mutex::new(Some(submit_tx))),
    };

    let app = Router::new()
        .route("/", get(portal_page))
        .route("/api/setup", get(portal_fields).post(portal_submit))
        .with_state(state);

    let port = env_port("DIMMER_SETUP_PORT", 8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind setup portal at {addr}"))?;
    info!("setup portal listening on http://{addr}");

    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    let submission = submit_rx
        .await
        .context("setup portal closed before submission")?;

    // Give the accepted response a moment to flush before tearing down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.abort();

    Ok(submission)
}

async fn portal_page() -> Html<&'static str> {
    Html(PORTAL_HTML)
}

async fn portal_fields(State(state): State<PortalState>) -> Json<PortalForm> {
    Json(state.initial.as_ref().clone())
}

async fn portal_submit(
    State(state): State<PortalState>,
    Json(request): Json<SetupRequest>,
) -> impl IntoResponse {
    match state.submit.lock().await.take() {
        Some(sender) => {
            let _ = sender.send(request);
            (
                StatusCode::OK,
                Json(serde_json::json!({ "accepted": true })),
            )
        }
        None => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "setup already submitted" })),
        ),
    }
}

/// Simulated PWM block: duty writes land in a table and a log line.
#[derive(Debug, Default)]
struct PwmOutputs {
    levels: HashMap<u8, u8>,
}

impl PwmOutputs {
    fn apply(&mut self, write: PwmWrite) {
        info!("pwm: pin {} duty {}", write.pin, write.duty);
        self.levels.insert(write.pin, write.duty);
    }
}

#[derive(Debug, Clone, Serialize)]
struct ConfigView {
    #[serde(rename = "deviceName")]
    device_name: String,
    #[serde(rename = "invertPwmOutput")]
    invert_pwm_output: bool,
    #[serde(rename = "otaUsernameSet")]
    ota_username_set: bool,
    #[serde(rename = "otaPasswordSet")]
    ota_password_set: bool,
    devices: Vec<ChannelSlot>,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<ChannelRegistry>,
    outputs: Arc<Mutex<PwmOutputs>>,
    config_view: Arc<ConfigView>,
}

#[derive(Debug, Deserialize)]
struct StateChangeRequest {
    id: VirtualDeviceId,
    state: bool,
    #[serde(default)]
    value: u8,
}

/// Normal operation: register the configured channels, park every output
/// off, and serve the discovery/control callback surface.
async fn serve_control(config: DeviceConfig) -> anyhow::Result<()> {
    info!("announcing mDNS hostname `{}`", config.device_name);
    if config.ota_auth_enabled() {
        info!(
            "update service authentication enabled for user `{}`",
            config.ota_username
        );
    } else {
        info!("update service authentication disabled");
    }

    let mut next_id: VirtualDeviceId = 0;
    let registry = ChannelRegistry::build(&config, |name| {
        let id = next_id;
        next_id += 1;
        info!("registered `{name}` with the discovery service as id {id}");
        id
    });

    let mut outputs = PwmOutputs::default();
    for binding in registry.bindings() {
        info!(
            "bound `{}` (id {}) to output pin {}",
            binding.name, binding.id, binding.pin
        );
    }
    for write in registry.initial_writes() {
        outputs.apply(write);
    }
    if registry.is_empty() {
        info!("no channels configured; nothing announced");
    }

    let app_state = AppState {
        registry: Arc::new(registry),
        outputs: Arc::new(Mutex::new(outputs)),
        config_view: Arc::new(ConfigView {
            device_name: config.device_name.clone(),
            invert_pwm_output: config.invert_pwm_output,
            ota_username_set: !config.ota_username.is_empty(),
            ota_password_set: !config.ota_password.is_empty(),
            devices: config.devices.clone(),
        }),
    };

    let app = Router::new()
        .route("/api/devices", get(handle_get_devices))
        .route("/api/state", post(handle_state_change))
        .route("/api/outputs", get(handle_get_outputs))
        .route("/api/config", get(handle_get_config))
        .with_state(app_state);

    let port = env_port("DIMMER_HTTP_PORT", 8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control server at {addr}"))?;

    info!("control surface listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_get_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.bindings().to_vec())
}

async fn handle_state_change(
    State(state): State<AppState>,
    Json(request): Json<StateChangeRequest>,
) -> impl IntoResponse {
    match state
        .registry
        .on_state_change(request.id, request.state, request.value)
    {
        Some(write) => {
            state.outputs.lock().await.apply(write);
            (
                StatusCode::OK,
                Json(serde_json::json!({ "pin": write.pin, "duty": write.duty })),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown virtual device id" })),
        ),
    }
}

async fn handle_get_outputs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.outputs.lock().await.levels.clone())
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config_view.as_ref().clone())
}

fn spawn_reset_window(store: ConfigStore, mut tracker: ResetCycleTracker) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if tracker.tick(now_ms()) {
                store.clear_marker().await;
                debug!("double-reset window elapsed; marker cleared");
                break;
            }
        }
    });
}

/// Host stand-in for the hardware-unique id the real board reads from its
/// efuse block.
fn host_chip_id() -> u32 {
    let seed = std::env::var("HOSTNAME").unwrap_or_else(|_| "dimmer-host".to_string());
    let digest = Sha256::digest(seed.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn env_port(name: &str, fallback: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(fallback)
}
