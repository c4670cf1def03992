use core::convert::TryInto;
use std::{
    ffi::CStr,
    net::IpAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ping::{Configuration as PingConfiguration, EspPing},
    sntp::{EspSntp, SyncStatus},
    sys::{esp, esp_vfs_spiffs_conf_t, esp_vfs_spiffs_register, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use relay_common::{
    form::{parse_urlencoded, query_param},
    record, Clock, ConfigStore, ControllerConfig, Delay, HardwareProfile, Journal, JournalError,
    Level, LogEntry, LogSink, NetworkConfig, PowerManager, Prober, RadioLink, RelayController,
    RelayOutput, SettingsUpdate, StatusIndicator, StoreError, StoredConfig, SyslogForwarder,
    TickOutcome, ESP32, ESP32_S3, SYSLOG_PORT,
};

const NVS_NAMESPACE: &str = "relayctl";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_BUFFER_BYTES: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const LOOP_INTERVAL: Duration = Duration::from_millis(50);
const DEEP_SLEEP: Duration = Duration::from_secs(30);
const SYSLOG_TAG: &str = "RelayController";
const SPIFFS_BASE: &CStr = c"/spiffs";
const SPIFFS_MAX_FILES: usize = 4;
const LOG_FILE: &str = "/spiffs/log.txt";
// Anything earlier means SNTP has not set the clock yet.
const MIN_SYNCED_EPOCH: i64 = 1_000_000_000;

#[cfg(esp32s3)]
const PROFILE: HardwareProfile = ESP32_S3;
#[cfg(not(esp32s3))]
const PROFILE: HardwareProfile = ESP32;

const INDEX_HTML: &str = include_str!("../web/index.html");
const APP_JS: &str = include_str!("../web/app.js");
const STYLE_CSS: &str = include_str!("../web/style.css");

type HttpRequest<'a, 'b> = Request<&'a mut EspHttpConnection<'b>>;

#[derive(Clone)]
struct SharedState {
    controller: Arc<Mutex<RelayController>>,
    board: Arc<Mutex<EspBoard>>,
    store: NvsStore,
    timezone: Tz,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

struct EspBoard {
    relays: Vec<(u8, PinDriver<'static, AnyOutputPin, Output>)>,
    status_led: Option<StatusLed>,
    timezone: Tz,
    journal: Journal,
    ping: EspPing,
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

    let timezone = option_env!("RELAY_TIMEZONE")
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(chrono_tz::UTC);
    let config = ControllerConfig {
        suspend_when_off: option_env!("RELAY_SUSPEND_WHEN_OFF") == Some("1"),
        ..ControllerConfig::default()
    };

    // Without the partition the log lives only in RAM.
    let log_file = match mount_spiffs() {
        Ok(()) => Some(PathBuf::from(LOG_FILE)),
        Err(err) => {
            warn!("failed to mount SPIFFS, log will not persist: {err}");
            None
        }
    };
    let journal = Journal::new(log_file, config.log_tail_bytes);

    let mut board = EspBoard::new(PROFILE, timezone, journal)?;
    let mut controller = RelayController::new(config, PROFILE);
    controller.load(&store, &mut board);
    controller.drive_all(&mut board);
    record(
        &mut board,
        format!("Relay controller started ({})", PROFILE.name),
    );

    let network = with_wifi_defaults(controller.network());
    let Peripherals { modem, .. } = Peripherals::take()?;
    let _wifi = connect_wifi(modem, sys_loop, nvs_partition, &network)
        .context("wifi startup failed")?;

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");
    if sntp.get_sync_status() != SyncStatus::Completed {
        info!("waiting for network time in the background");
    }

    match SyslogForwarder::connect(&network.syslog_host, SYSLOG_PORT, SYSLOG_TAG) {
        Ok(forwarder) => board.journal.set_syslog(forwarder),
        Err(err) => warn!("failed to open syslog socket: {err}"),
    }

    let state = SharedState {
        controller: Arc::new(Mutex::new(controller)),
        board: Arc::new(Mutex::new(board)),
        store,
        timezone,
    };

    spawn_control_loop(state.clone())?;
    let server = create_http_server(state)?;

    // Keep services alive for the program lifetime.
    let _sntp = sntp;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn with_wifi_defaults(network: &NetworkConfig) -> NetworkConfig {
    let mut network = network.clone();
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
    network
}

fn spawn_control_loop(state: SharedState) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let now_ms = monotonic_ms();
            let outcome = {
                let mut controller = lock(&state.controller);
                let mut board = lock(&state.board);
                controller.tick(now_ms, &mut *board, &state.store)
            };

            if outcome == TickOutcome::Restart {
                thread::sleep(Duration::from_millis(100));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
            thread::sleep(LOOP_INTERVAL);
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/app.js", Method::Get, move |req| {
        req.into_response(200, None, &[("Content-Type", "text/javascript")])?
            .write_all(APP_JS.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, move |req| {
        req.into_response(200, None, &[("Content-Type", "text/css")])?
            .write_all(STYLE_CSS.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = {
                let controller = lock(&state.controller);
                controller.status(monotonic_ms(), local_now(state.timezone))
            };
            write_json(req, &status)
        })?;
    }

    for method in [Method::Get, Method::Post] {
        let state = state.clone();
        server.fn_handler("/toggle", method, move |req| {
            let uri = req.uri().to_string();
            let Some(index) =
                query_param(&uri, "id").and_then(|value| value.trim().parse::<usize>().ok())
            else {
                return write_error(req, 400, "Missing or invalid 'id' parameter");
            };

            let status = {
                let mut controller = lock(&state.controller);
                let mut board = lock(&state.board);
                if controller.toggle(index, &mut *board).is_some() {
                    controller.persist(&state.store, &mut *board);
                }
                controller.status(monotonic_ms(), local_now(state.timezone))
            };
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/settings", Method::Get, move |req| {
            let settings = lock(&state.controller).settings();
            write_json(req, &settings)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/settings", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: SettingsUpdate =
                serde_json::from_slice(&body).context("invalid settings payload")?;
            if let Err(message) = apply_settings(&state, &update) {
                return write_error(req, 400, message);
            }
            let settings = lock(&state.controller).settings();
            write_json(req, &settings)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = parse_urlencoded(&String::from_utf8_lossy(&body));
            let mut update = lock(&state.controller).settings();
            update.merge_form(&form);
            if let Err(message) = apply_settings(&state, &update) {
                return write_error(req, 400, message);
            }
            req.into_response(303, Some("See Other"), &[("Location", "/")])?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/log", Method::Get, move |req| {
            let tail = lock(&state.board).journal.tail().render();
            write_text(req, &tail)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/download_log", Method::Get, move |req| {
            let contents = lock(&state.board).journal.contents();
            match contents {
                Ok(body) => {
                    write_attachment(req, "log.txt", "text/plain; charset=utf-8", body.as_bytes())
                }
                Err(err) => {
                    warn!("failed to read log file: {err}");
                    write_error(req, 500, "Failed to read log")
                }
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/clearlog", Method::Post, move |req| {
            let cleared = {
                let mut board = lock(&state.board);
                let cleared = board.journal.clear();
                if cleared.is_ok() {
                    record(&mut *board, "Log cleared");
                }
                cleared
            };

            if let Err(err) = cleared {
                warn!("failed to clear log file: {err}");
                return write_error(req, 500, "Failed to clear log");
            }
            write_text(req, "Log cleared")
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/download_config", Method::Get, move |req| {
            let body = lock(&state.controller).stored_config().to_json()?;
            write_attachment(req, "config.json", "application/json", &body)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/upload_config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(stored) = StoredConfig::parse(&body) else {
                return write_error(req, 400, "Invalid config JSON");
            };

            let saved = {
                let mut controller = lock(&state.controller);
                let mut board = lock(&state.board);
                let installed =
                    controller.install_upload(&stored, monotonic_ms(), &state.store, &mut *board);
                match installed {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("failed to store uploaded config: {err}");
                        false
                    }
                }
            };

            if !saved {
                return write_error(req, 500, "Failed to store config");
            }
            write_text(req, "Config uploaded, rebooting")
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/reboot", Method::Post, move |req| {
            lock(&state.controller).request_restart(monotonic_ms());
            write_text(req, "Rebooting")
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/deepsleep", Method::Post, move |req| {
            write_text(req, "Entering deep sleep")?;
            let mut board = lock(&state.board);
            record(
                &mut *board,
                format!("Entering deep sleep for {}s", DEEP_SLEEP.as_secs()),
            );
            board.suspend_for(DEEP_SLEEP);
            Ok(())
        })?;
    }

    Ok(server)
}

fn apply_settings(state: &SharedState, update: &SettingsUpdate) -> Result<(), &'static str> {
    update.validate()?;

    let mut controller = lock(&state.controller);
    let mut board = lock(&state.board);
    controller.apply_settings(update);
    if !controller.persist(&state.store, &mut *board) {
        return Err("Failed to persist settings");
    }
    record(&mut *board, "Settings saved");
    Ok(())
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
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

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_text(req: HttpRequest<'_, '_>, body: &str) -> anyhow::Result<()> {
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(body.as_bytes())?;
    Ok(())
}

fn write_attachment(
    req: HttpRequest<'_, '_>,
    filename: &str,
    content_type: &str,
    body: &[u8],
) -> anyhow::Result<()> {
    let disposition = format!("attachment; filename=\"{filename}\"");
    req.into_response(
        200,
        Some("OK"),
        &[
            ("Content-Type", content_type),
            ("Content-Disposition", disposition.as_str()),
        ],
    )?
    .write_all(body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
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

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<Box<EspWifi<'static>>> {
    let mut esp_wifi = Box::new(EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?);
    let mut wifi = BlockingWifi::wrap(esp_wifi.as_mut(), sys_loop)?;

    if network.wifi_ssid.is_empty() {
        warn!("wifi credentials missing; running offline");
        return Ok(esp_wifi);
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    // Relays keep their commanded state and the schedule fails open without time.
    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; running offline");
    drop(wifi);
    Ok(esp_wifi)
}

impl NvsStore {
    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(backend)
    }
}

impl ConfigStore for NvsStore {
    fn load(&self) -> Result<Option<StoredConfig>, StoreError> {
        let _guard = lock(&self.lock);
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer).map_err(backend)? {
            Some(value) => StoredConfig::parse(value.as_bytes()).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, config: &StoredConfig) -> Result<(), StoreError> {
        let _guard = lock(&self.lock);
        let mut nvs = self.open()?;
        let payload = serde_json::to_string(config)?;
        nvs.set_str(NVS_CONFIG_KEY, &payload).map_err(backend)?;
        Ok(())
    }
}

fn backend(err: EspError) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl EspBoard {
    fn new(profile: HardwareProfile, timezone: Tz, journal: Journal) -> anyhow::Result<Self> {
        let mut relays = Vec::with_capacity(profile.relay_pins.len());
        for pin in profile.relay_pins {
            let driver = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(pin))) }
                .with_context(|| format!("failed to claim relay GPIO{pin}"))?;
            relays.push((pin, driver));
        }

        Ok(Self {
            relays,
            status_led: init_status_led(i32::from(profile.status_led_pin)),
            timezone,
            journal,
            ping: EspPing::default(),
        })
    }
}

impl RelayOutput for EspBoard {
    fn write(&mut self, pin: u8, level: Level) {
        let Some((_, driver)) = self.relays.iter_mut().find(|(p, _)| *p == pin) else {
            warn!("no relay driver for GPIO{pin}");
            return;
        };
        let result = match level {
            Level::High => driver.set_high(),
            Level::Low => driver.set_low(),
        };
        if let Err(err) = result {
            warn!("failed to drive relay GPIO{pin}: {err}");
        }
    }
}

impl StatusIndicator for EspBoard {
    fn set_lit(&mut self, lit: bool) {
        let Some(led) = self.status_led.as_mut() else {
            return;
        };

        if lit == led.lit {
            return;
        }

        let result = if lit {
            led.pin.set_high()
        } else {
            led.pin.set_low()
        };

        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        } else {
            led.lit = lit;
        }
    }
}

impl Clock for EspBoard {
    fn local_time(&self) -> Option<NaiveDateTime> {
        local_now(self.timezone)
    }
}

impl Delay for EspBoard {
    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl PowerManager for EspBoard {
    fn suspend_for(&mut self, duration: Duration) {
        warn!("entering deep sleep for {}s", duration.as_secs());
        thread::sleep(Duration::from_millis(100));
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        unsafe { esp_idf_svc::sys::esp_deep_sleep(micros) };
    }
}

impl RadioLink for EspBoard {
    // No transceiver driver in this build.
    fn try_receive(&mut self) -> Option<String> {
        None
    }
}

impl LogSink for EspBoard {
    fn append(&mut self, entry: &LogEntry) {
        info!("{entry}");
        match self.journal.write(entry) {
            Ok(()) => {}
            Err(err @ JournalError::Syslog(_)) => debug!("{err}"),
            Err(err) => warn!("{err}"),
        }
    }
}

impl Prober for EspBoard {
    fn probe(&mut self, address: IpAddr, attempts: u8, timeout: Duration) -> u8 {
        let IpAddr::V4(address) = address else {
            warn!("IPv6 probes are not supported on this board: {address}");
            return 0;
        };

        let conf = PingConfiguration {
            count: u32::from(attempts),
            interval: Duration::from_millis(10),
            timeout,
            ..Default::default()
        };

        match self.ping.ping(address, &conf) {
            Ok(summary) => u8::try_from(summary.received).unwrap_or(attempts),
            Err(err) => {
                warn!("ping to {address} failed to run: {err}");
                0
            }
        }
    }
}

fn mount_spiffs() -> Result<(), EspError> {
    let conf = esp_vfs_spiffs_conf_t {
        base_path: SPIFFS_BASE.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: SPIFFS_MAX_FILES,
        format_if_mount_failed: true,
    };
    esp!(unsafe { esp_vfs_spiffs_register(&conf) })
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn local_now(timezone: Tz) -> Option<NaiveDateTime> {
    let now = Utc::now();
    if now.timestamp() < MIN_SYNCED_EPOCH {
        return None;
    }
    Some(now.with_timezone(&timezone).naive_local())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
