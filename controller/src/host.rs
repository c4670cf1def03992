use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, Mutex,
    },
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use relay_common::{
    record, Clock, ConfigStore, ControllerConfig, ControllerStatus, Delay, HardwareProfile,
    Journal, JournalError, Level, LogEntry, LogSink, PowerManager, Prober, RadioLink,
    RelayController, RelayOutput, SettingsUpdate, StatusIndicator, StoreError, StoredConfig,
    SyslogForwarder, TickOutcome, ESP32_S3, SYSLOG_PORT,
};

const SYSLOG_TAG: &str = "RelayController";
const TICK_INTERVAL: Duration = Duration::from_millis(50);
const PROBE_GAP: Duration = Duration::from_millis(10);
const DEEP_SLEEP: Duration = Duration::from_secs(30);
const MAX_RADIO_MESSAGE_BYTES: usize = 256;
// Anything earlier means the wall clock was never set.
const MIN_SYNCED_EPOCH: i64 = 1_600_000_000;

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<RelayController>>,
    board: Arc<Mutex<HostBoard>>,
    store: JsonFileStore,
    timezone: Tz,
    radio: UnboundedSender<String>,
}

#[derive(Clone)]
struct JsonFileStore {
    path: Arc<PathBuf>,
    lock: Arc<std::sync::Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    monotonic_ms();

    let data_dir = std::env::var("RELAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.relay"));
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let profile = match std::env::var("RELAY_PROFILE") {
        Ok(name) => HardwareProfile::by_name(&name).unwrap_or_else(|| {
            warn!("unknown hardware profile {name:?}, using {}", ESP32_S3.name);
            ESP32_S3
        }),
        Err(_) => ESP32_S3,
    };

    let timezone = match std::env::var("RELAY_TIMEZONE") {
        Ok(name) => name.parse::<Tz>().unwrap_or_else(|_| {
            warn!("unknown timezone {name:?}, using UTC");
            chrono_tz::UTC
        }),
        Err(_) => chrono_tz::UTC,
    };

    let config = ControllerConfig {
        suspend_when_off: env_flag("RELAY_SUSPEND_WHEN_OFF"),
        ..ControllerConfig::default()
    };

    let store = JsonFileStore::new(data_dir.join("config.json"));
    let (radio_tx, radio_rx) = mpsc::unbounded_channel();
    let mut board = HostBoard::new(
        timezone,
        Journal::new(Some(data_dir.join("log.txt")), config.log_tail_bytes),
        radio_rx,
    );

    let mut controller = RelayController::new(config, profile);
    controller.load(&store, &mut board);
    board
        .journal
        .set_syslog(connect_syslog(&controller.network().syslog_host));
    controller.drive_all(&mut board);
    record(
        &mut board,
        format!("Relay controller started ({})", profile.name),
    );

    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        board: Arc::new(Mutex::new(board)),
        store,
        timezone,
        radio: radio_tx,
    };

    let (restart_tx, restart_rx) = oneshot::channel();
    spawn_control_loop(app_state.clone(), restart_tx)?;

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/toggle", get(handle_toggle).post(handle_toggle))
        .route(
            "/api/settings",
            get(handle_get_settings).put(handle_put_settings),
        )
        .route("/save", post(handle_save_form))
        .route("/api/log", get(handle_get_log))
        .route("/download_log", get(handle_download_log))
        .route("/clearlog", post(handle_clear_log))
        .route("/download_config", get(handle_download_config))
        .route("/upload_config", post(handle_upload_config))
        .route("/reboot", post(handle_reboot))
        .route("/deepsleep", post(handle_deep_sleep))
        .route("/api/radio", post(handle_post_radio))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("RELAY_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay controller server at {addr}"))?;

    info!("relay controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = restart_rx.await;
            info!("restart requested, shutting down");
        })
        .await?;
    Ok(())
}

/// Runs the control loop on its own thread; recovery cool-downs block it.
fn spawn_control_loop(app_state: AppState, restart: oneshot::Sender<()>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || loop {
            let now_ms = monotonic_ms();
            let outcome = {
                let mut controller = app_state.controller.blocking_lock();
                let mut board = app_state.board.blocking_lock();
                controller.tick(now_ms, &mut *board, &app_state.store)
            };

            if outcome == TickOutcome::Restart {
                let _ = restart.send(());
                return;
            }
            thread::sleep(TICK_INTERVAL);
        })
        .context("failed to spawn control loop")?;
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> Json<ControllerStatus> {
    let controller = state.controller.lock().await;
    Json(controller.status(monotonic_ms(), local_now(state.timezone)))
}

async fn handle_toggle(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("id") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'id' parameter");
    };
    let Ok(index) = id.trim().parse::<usize>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid relay id");
    };

    {
        let mut controller = state.controller.lock().await;
        let mut board = state.board.lock().await;
        if controller.toggle(index, &mut *board).is_some() {
            controller.persist(&state.store, &mut *board);
        }
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_settings(State(state): State<AppState>) -> Json<SettingsUpdate> {
    Json(state.controller.lock().await.settings())
}

async fn handle_put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    if let Err(response) = apply_settings(&state, &update).await {
        return response;
    }
    handle_get_settings(State(state)).await.into_response()
}

async fn handle_save_form(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let mut update = state.controller.lock().await.settings();
    update.merge_form(&form);
    match apply_settings(&state, &update).await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(response) => response,
    }
}

async fn apply_settings(state: &AppState, update: &SettingsUpdate) -> Result<(), Response> {
    update.validate().map_err(|message| error_response(StatusCode::BAD_REQUEST, message))?;

    let mut controller = state.controller.lock().await;
    let mut board = state.board.lock().await;
    controller.apply_settings(update);
    if !controller.persist(&state.store, &mut *board) {
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist settings",
        ));
    }
    record(&mut *board, "Settings saved");
    Ok(())
}

async fn handle_get_log(State(state): State<AppState>) -> Response {
    let tail = state.board.lock().await.journal.tail().render();
    text_response(tail)
}

async fn handle_download_log(State(state): State<AppState>) -> Response {
    let contents = state.board.lock().await.journal.contents();
    match contents {
        Ok(body) => attachment("log.txt", "text/plain; charset=utf-8", body.into_bytes()),
        Err(err) => {
            warn!("failed to read log file: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read log")
        }
    }
}

async fn handle_clear_log(State(state): State<AppState>) -> Response {
    let mut board = state.board.lock().await;
    if let Err(err) = board.journal.clear() {
        warn!("failed to clear log file: {err}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to clear log");
    }
    record(&mut *board, "Log cleared");
    text_response("Log cleared")
}

async fn handle_download_config(State(state): State<AppState>) -> Response {
    let stored = state.controller.lock().await.stored_config();
    match stored.to_json() {
        Ok(body) => attachment("config.json", "application/json", body),
        Err(err) => {
            warn!("failed to serialize config: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to export config")
        }
    }
}

async fn handle_upload_config(State(state): State<AppState>, body: Bytes) -> Response {
    let stored = match StoredConfig::parse(&body) {
        Ok(stored) => stored,
        Err(err) => {
            warn!("rejected uploaded config: {err}");
            return error_response(StatusCode::BAD_REQUEST, "Invalid config JSON");
        }
    };

    let mut controller = state.controller.lock().await;
    let mut board = state.board.lock().await;
    let installed = controller.install_upload(&stored, monotonic_ms(), &state.store, &mut *board);
    if let Err(err) = installed {
        warn!("failed to store uploaded config: {err}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store config");
    }
    text_response("Config uploaded, rebooting")
}

async fn handle_reboot(State(state): State<AppState>) -> Response {
    state
        .controller
        .lock()
        .await
        .request_restart(monotonic_ms());
    text_response("Rebooting")
}

async fn handle_deep_sleep(State(state): State<AppState>) -> Response {
    let mut board = state.board.lock().await;
    record(
        &mut *board,
        format!("Entering deep sleep for {}s", DEEP_SLEEP.as_secs()),
    );
    board.suspend_for(DEEP_SLEEP);
    text_response("Entering deep sleep")
}

async fn handle_post_radio(State(state): State<AppState>, body: String) -> Response {
    let message = body.trim();
    if message.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Empty radio message");
    }
    if message.len() > MAX_RADIO_MESSAGE_BYTES {
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Radio message too long");
    }
    if state.radio.send(message.to_string()).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Radio link closed");
    }
    StatusCode::ACCEPTED.into_response()
}

impl JsonFileStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock
            .lock()
            .map_err(|_| StoreError::Backend("config store lock poisoned".to_string()))
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<Option<StoredConfig>, StoreError> {
        let _guard = self.guard()?;
        match fs::read(self.path.as_ref()) {
            Ok(raw) => StoredConfig::parse(&raw).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, config: &StoredConfig) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(self.path.as_ref(), config.to_json()?)?;
        Ok(())
    }
}

fn connect_syslog(host: &str) -> Option<SyslogForwarder> {
    match SyslogForwarder::connect(host, SYSLOG_PORT, SYSLOG_TAG) {
        Ok(Some(forwarder)) => {
            info!("forwarding log to syslog at {}:{SYSLOG_PORT}", forwarder.host());
            Some(forwarder)
        }
        Ok(None) => None,
        Err(err) => {
            warn!("failed to open syslog socket: {err}");
            None
        }
    }
}

/// Simulated board: outputs are recorded, probes go through the system `ping`.
struct HostBoard {
    timezone: Tz,
    outputs: BTreeMap<u8, Level>,
    led_lit: bool,
    journal: Journal,
    radio: UnboundedReceiver<String>,
}

impl HostBoard {
    fn new(timezone: Tz, journal: Journal, radio: UnboundedReceiver<String>) -> Self {
        Self {
            timezone,
            outputs: BTreeMap::new(),
            led_lit: false,
            journal,
            radio,
        }
    }
}

impl RelayOutput for HostBoard {
    fn write(&mut self, pin: u8, level: Level) {
        debug!("pin {pin} -> {level:?}");
        self.outputs.insert(pin, level);
    }
}

impl StatusIndicator for HostBoard {
    fn set_lit(&mut self, lit: bool) {
        if self.led_lit != lit {
            debug!("status led {}", if lit { "on" } else { "off" });
        }
        self.led_lit = lit;
    }
}

impl Clock for HostBoard {
    fn local_time(&self) -> Option<NaiveDateTime> {
        local_now(self.timezone)
    }
}

impl Delay for HostBoard {
    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl PowerManager for HostBoard {
    fn suspend_for(&mut self, duration: Duration) {
        warn!(
            "suspend for {}s requested; host runtime stays awake",
            duration.as_secs()
        );
    }
}

impl RadioLink for HostBoard {
    fn try_receive(&mut self) -> Option<String> {
        self.radio.try_recv().ok()
    }
}

impl LogSink for HostBoard {
    fn append(&mut self, entry: &LogEntry) {
        info!(target: "journal", "{}", entry.message);
        match self.journal.write(entry) {
            Ok(()) => {}
            Err(err @ JournalError::Syslog(_)) => debug!("{err}"),
            Err(err) => warn!("{err}"),
        }
    }
}

impl Prober for HostBoard {
    fn probe(&mut self, address: IpAddr, attempts: u8, timeout: Duration) -> u8 {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let mut successes = 0;

        for attempt in 0..attempts {
            if attempt > 0 {
                thread::sleep(PROBE_GAP);
            }
            let status = Command::new("ping")
                .args(["-c", "1", "-W", &wait_secs])
                .arg(address.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(status) if status.success() => successes += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!("failed to run ping: {err}");
                    break;
                }
            }
        }
        successes
    }
}

fn local_now(timezone: Tz) -> Option<NaiveDateTime> {
    let now = Utc::now();
    if now.timestamp() < MIN_SYNCED_EPOCH {
        return None;
    }
    Some(now.with_timezone(&timezone).naive_local())
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).map(|value| value.trim().to_ascii_lowercase()).as_deref(),
        Ok("1" | "true" | "yes" | "on")
    )
}

fn text_response(body: impl Into<String>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body.into(),
    )
        .into_response()
}

fn attachment(filename: &str, content_type: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "relay-controller-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn file_store_treats_missing_file_as_empty() {
        let dir = scratch_dir("store");
        let store = JsonFileStore::new(dir.join("config.json"));
        assert!(store.load().unwrap().is_none());

        let mut controller = RelayController::new(ControllerConfig::default(), ESP32_S3);
        let (_tx, rx) = mpsc::unbounded_channel();
        let journal = Journal::new(Some(dir.join("log.txt")), 512);
        let mut board = HostBoard::new(chrono_tz::UTC, journal, rx);
        controller.toggle(0, &mut board);
        assert!(controller.persist(&store, &mut board));

        let stored = store.load().unwrap().unwrap();
        assert_eq!(stored.relay_states[0], Some(true));

        fs::write(dir.join("config.json"), b"{ broken").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn board_records_output_levels_and_radio() {
        let dir = scratch_dir("board");
        let (tx, rx) = mpsc::unbounded_channel();
        let journal = Journal::new(Some(dir.join("log.txt")), 512);
        let mut board = HostBoard::new(chrono_tz::UTC, journal, rx);
        let mut controller = RelayController::new(ControllerConfig::default(), ESP32_S3);

        controller.drive_all(&mut board);
        controller.toggle(3, &mut board);
        assert_eq!(board.outputs.get(&48), Some(&Level::Low));
        assert_eq!(board.outputs.get(&19), Some(&Level::High));
        let log = fs::read_to_string(dir.join("log.txt")).unwrap();
        assert!(log.contains("Switch Pin:48 - Relay 4 0 >> 1"));

        tx.send("hello".to_string()).unwrap();
        assert_eq!(board.try_receive().as_deref(), Some("hello"));
        assert_eq!(board.try_receive(), None);
    }

    #[test]
    fn local_time_uses_configured_timezone() {
        let utc = local_now(chrono_tz::UTC).unwrap();
        let tokyo = local_now(chrono_tz::Asia::Tokyo).unwrap();
        let offset = (tokyo - utc).num_minutes();
        assert!((539..=541).contains(&offset));
    }
}
