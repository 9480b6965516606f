use std::{
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::AnyOutputPin,
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, LEDC},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mdns::EspMdns,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use dimmer_common::{
    boot_mode, BootMode, ChannelRegistry, DeviceConfig, PortalForm, PwmWrite, ResetCycleTracker,
    ResetMarker, VirtualDeviceId, PWM_FREQUENCY_HZ,
};

use crate::portal::{SetupRequest, PORTAL_HTML};

const NVS_NAMESPACE: &str = "dimmer";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_MARKER_KEY: &str = "reset_marker";

const SETUP_AP_PASSWORD: &str = "DimmerSetup";
const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    /// Loading never fails: anything unusable is logged and replaced with
    /// defaults, and an empty identity is resolved from the efuse id.
    fn load_config(&self, chip_id: u32) -> DeviceConfig {
        let mut config = match self.read_key(NVS_CONFIG_KEY) {
            Ok(Some(raw)) => match DeviceConfig::from_json(raw.as_bytes()) {
                Ok(config) => config,
                Err(err) => {
                    warn!("stored config is unusable ({err}); using defaults");
                    DeviceConfig::default()
                }
            },
            Ok(None) => {
                info!("no stored config; using defaults");
                DeviceConfig::default()
            }
            Err(err) => {
                warn!("failed to read config from NVS: {err:#}; using defaults");
                DeviceConfig::default()
            }
        };
        config.resolve_identity(chip_id);
        config
    }

    fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let payload = String::from_utf8(config.to_json()?)
            .context("config serialized to non-utf8 payload")?;
        self.write_key(NVS_CONFIG_KEY, &payload)
    }

    fn load_marker(&self) -> Option<ResetMarker> {
        self.read_key(NVS_MARKER_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn save_marker(&self, marker: ResetMarker) {
        match serde_json::to_string(&marker) {
            Ok(payload) => {
                if let Err(err) = self.write_key(NVS_MARKER_KEY, &payload) {
                    warn!("failed to write reset marker: {err:#}");
                }
            }
            Err(err) => warn!("failed to encode reset marker: {err}"),
        }
    }

    fn clear_marker(&self) {
        let _guard = self.lock.lock().unwrap();
        match EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true) {
            Ok(mut nvs) => {
                if let Err(err) = nvs.remove(NVS_MARKER_KEY) {
                    warn!("failed to clear reset marker: {err:?}");
                }
            }
            Err(err) => warn!("failed to open NVS namespace: {err:?}"),
        }
    }

    fn read_key(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];
        Ok(nvs.get_str(key, &mut buffer)?.map(|value| value.to_string()))
    }

    fn write_key(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_str(key, value)?;
        Ok(())
    }
}

/// The LEDC channels actually bound to configured outputs.
struct PwmBank {
    channels: Vec<(u8, LedcDriver<'static>)>,
}

impl PwmBank {
    fn apply(&mut self, write: PwmWrite) {
        let Some((_, driver)) = self
            .channels
            .iter_mut()
            .find(|(pin, _)| *pin == write.pin)
        else {
            return;
        };

        let duty = u32::from(write.duty).min(driver.get_max_duty());
        if let Err(err) = driver.set_duty(duty) {
            warn!("failed to set duty on pin {}: {err}", write.pin);
        }
    }
}

#[derive(Debug, Deserialize)]
struct StateChangeRequest {
    id: VirtualDeviceId,
    state: bool,
    #[serde(default)]
    value: u8,
}

#[derive(Debug, Deserialize)]
struct UpdateCredentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let chip = chip_id();
    let mut config = store.load_config(chip);

    let mut tracker = ResetCycleTracker::new(store.load_marker(), now_ms());
    store.save_marker(tracker.armed_marker());
    let double_reset = tracker.take_double_reset();

    let peripherals = Peripherals::take()?;
    let mut status_led = esp_idf_hal::gpio::PinDriver::output(peripherals.pins.gpio2)?;

    let mut esp_wifi = EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs_partition))?;
    let has_credentials = stored_station_ssid(&esp_wifi).is_some();
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let mode = boot_mode(has_credentials, double_reset);
    info!(
        "boot mode {} (credentials stored: {has_credentials}, double reset: {double_reset})",
        mode.as_str()
    );

    let mut station_override: Option<(String, String)> = None;
    if let BootMode::Setup = mode {
        status_led.set_high()?;
        let submission = run_setup_portal(&mut wifi, &config)?;
        submission.form.apply_to(&mut config);
        config.resolve_identity(chip);

        if !submission.wifi_ssid.is_empty() {
            station_override = Some((submission.wifi_ssid, submission.wifi_pass));
        }

        // The config captured by the portal is saved even if the join fails.
        if let Err(err) = store.save_config(&config) {
            warn!("failed to save configuration: {err:#}");
        }
        status_led.set_low()?;
    }

    if let Err(err) = join_station(&mut wifi, station_override) {
        warn!("failed to join network: {err:#}; continuing startup");
    }

    let mut mdns = EspMdns::take()?;
    if let Err(err) = mdns.set_hostname(&config.device_name) {
        warn!("failed to announce mDNS hostname: {err:?}");
    }

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let mut next_id: VirtualDeviceId = 0;
    let registry = ChannelRegistry::build(&config, |name| {
        let id = next_id;
        next_id += 1;
        info!("registered `{name}` with the discovery service as id {id}");
        id
    });

    let mut bank = build_pwm_bank(peripherals.ledc, &registry)?;
    for binding in registry.bindings() {
        info!(
            "bound `{}` (id {}) to output pin {}",
            binding.name, binding.id, binding.pin
        );
    }
    for write in registry.initial_writes() {
        bank.apply(write);
    }

    let registry = Arc::new(registry);
    let bank = Arc::new(Mutex::new(bank));
    let server = create_control_server(registry, bank, &config)?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _mdns = mdns;
    let _server = server;

    loop {
        feed_watchdog();
        if tracker.tick(now_ms()) {
            store.clear_marker();
        }
        thread::sleep(Duration::from_millis(250));
    }
}

fn run_setup_portal(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    config: &DeviceConfig,
) -> anyhow::Result<SetupRequest> {
    start_setup_ap(wifi, &config.device_name)?;

    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;
    let (submit_tx, submit_rx) = mpsc::sync_channel::<SetupRequest>(1);

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let initial = PortalForm::from_config(config);
        server.fn_handler::<anyhow::Error, _>("/api/setup", Method::Get, move |req| {
            write_json(req, &initial)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/setup", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        match serde_json::from_slice::<SetupRequest>(&body) {
            Ok(submission) => {
                let _ = submit_tx.try_send(submission);
                write_json(req, &serde_json::json!({ "accepted": true }))
            }
            Err(err) => write_error(req, 400, &format!("invalid setup payload: {err}")),
        }
    })?;

    // SETUP owns the device until the user completes the flow.
    let submission = submit_rx
        .recv()
        .context("setup portal closed before submission")?;
    Ok(submission)
}

fn start_setup_ap(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    ssid: &str,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("setup AP SSID too long"))?,
        password: SETUP_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("setup AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("setup AP started on `{ssid}` (password: `{SETUP_AP_PASSWORD}`)");
    Ok(())
}

/// Joins the station network, using the portal-supplied credentials when
/// present and the stored ones otherwise.
fn join_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    credentials: Option<(String, String)>,
) -> anyhow::Result<()> {
    let _ = wifi.stop();

    if let Some((ssid, pass)) = credentials {
        let auth_method = if pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;
    }

    wifi.start()?;
    wifi.connect()?;
    wifi.wait_netif_up()?;
    info!("wifi connected");
    Ok(())
}

fn stored_station_ssid(wifi: &EspWifi<'_>) -> Option<String> {
    match wifi.get_configuration() {
        Ok(Configuration::Client(client)) if !client.ssid.is_empty() => {
            Some(client.ssid.as_str().to_string())
        }
        Ok(Configuration::Mixed(client, _)) if !client.ssid.is_empty() => {
            Some(client.ssid.as_str().to_string())
        }
        _ => None,
    }
}

fn build_pwm_bank(ledc: LEDC, registry: &ChannelRegistry) -> anyhow::Result<PwmBank> {
    let LEDC {
        timer0,
        channel0,
        channel1,
        channel2,
        channel3,
        channel4,
        channel5,
        channel6,
        channel7,
        ..
    } = ledc;

    let timer: &'static LedcTimerDriver<'static> = Box::leak(Box::new(LedcTimerDriver::new(
        timer0,
        &TimerConfig::default()
            .frequency(PWM_FREQUENCY_HZ.Hz())
            .resolution(Resolution::Bits8),
    )?));

    type ChannelTaker =
        Box<dyn FnOnce(AnyOutputPin) -> Result<LedcDriver<'static>, esp_idf_svc::sys::EspError>>;
    let mut takers: Vec<ChannelTaker> = vec![
        Box::new(move |pin| LedcDriver::new(channel0, timer, pin)),
        Box::new(move |pin| LedcDriver::new(channel1, timer, pin)),
        Box::new(move |pin| LedcDriver::new(channel2, timer, pin)),
        Box::new(move |pin| LedcDriver::new(channel3, timer, pin)),
        Box::new(move |pin| LedcDriver::new(channel4, timer, pin)),
        Box::new(move |pin| LedcDriver::new(channel5, timer, pin)),
        Box::new(move |pin| LedcDriver::new(channel6, timer, pin)),
        Box::new(move |pin| LedcDriver::new(channel7, timer, pin)),
    ];

    let mut channels = Vec::new();
    for binding in registry.bindings() {
        if takers.is_empty() {
            warn!("out of LEDC channels; `{}` not driven", binding.name);
            break;
        }
        let take = takers.remove(0);
        let pin = unsafe { AnyOutputPin::new(i32::from(binding.pin)) };
        let driver = take(pin)
            .map_err(|err| anyhow!("failed to attach pin {}: {err}", binding.pin))?;
        channels.push((binding.pin, driver));
    }

    Ok(PwmBank { channels })
}

/// The callback surface the discovery/control emulation drives; the
/// protocol itself lives outside this firmware core.
fn create_control_server(
    registry: Arc<ChannelRegistry>,
    bank: Arc<Mutex<PwmBank>>,
    config: &DeviceConfig,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let registry = registry.clone();
        server.fn_handler::<anyhow::Error, _>("/api/devices", Method::Get, move |req| {
            write_json(req, &registry.bindings())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/state", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let request: StateChangeRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return write_error(req, 400, &format!("invalid state payload: {err}")),
        };

        match registry.on_state_change(request.id, request.state, request.value) {
            Some(write) => {
                bank.lock().unwrap().apply(write);
                write_json(req, &serde_json::json!({ "pin": write.pin, "duty": write.duty }))
            }
            None => write_error(req, 404, "unknown virtual device id"),
        }
    })?;

    start_update_service(
        &mut server,
        config.ota_username.clone(),
        config.ota_password.clone(),
    )?;

    Ok(server)
}

/// Hands the credential pair to the updater boundary; the transfer protocol
/// itself is owned by the updater component.
fn start_update_service(
    server: &mut EspHttpServer<'static>,
    username: String,
    password: String,
) -> anyhow::Result<()> {
    if username.is_empty() && password.is_empty() {
        info!("update service authentication disabled");
    } else {
        info!("update service authentication enabled for user `{username}`");
    }

    server.fn_handler::<anyhow::Error, _>("/api/update/auth", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let supplied: UpdateCredentials = serde_json::from_slice(&body).unwrap_or(UpdateCredentials {
            username: String::new(),
            password: String::new(),
        });

        let authorized = (username.is_empty() && password.is_empty())
            || (supplied.username == username && supplied.password == password);
        write_json(req, &serde_json::json!({ "authorized": authorized }))
    })?;
    Ok(())
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn chip_id() -> u32 {
    let mut mac = [0_u8; 6];
    unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]])
}

/// Epoch milliseconds from the RTC-backed system clock, which survives a
/// soft reset; the reset marker only needs consistency within the brief
/// detection window.
fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
