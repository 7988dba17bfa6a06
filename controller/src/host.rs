//! Host-side harness: runs the full coordination fabric against simulated
//! peripherals. The actuator logs duty changes, the durable store is a
//! directory of framed blobs, the local commissioning channel is a TCP
//! socket carrying the same frames the radio attribute would, and the cloud
//! link is a plain MQTT broker (set `GROW_MQTT_HOST` to enable it).

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use rumqttc::{Client, Event, Incoming, MqttOptions, QoS};
use tracing::{info, warn};

use grow_common::store::keys;
use grow_common::{
    audit_channel, decode_job_document, links, safety_shutdown, topics, ActuatorDriver,
    ActuatorState, ArbiterConfig, AuditReceiver, AuditSender, CommandQueue, CommissioningArbiter,
    CommissioningSession, ControlPipeline, DeviceConfig, DeviceId, Error, Heartbeat, ImageFetcher,
    ImageSlot, JobDecision, LinkState, Manifest, NetworkSupervisor, ProvisioningFrame,
    ScheduleConfig, SessionEvent, ShadowReported, SharedActuatorState, Store,
    StoreBackend, SupervisorAction, TrustRoot, UpdateError, UpdatePipeline, UpdateStatus,
    WatchdogFeed, WifiEvent,
};

const LOCAL_CHANNEL_DEFAULT_PORT: u16 = 7878;
const SOFT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppContext {
    cfg: Arc<DeviceConfig>,
    store: Arc<Store>,
    links: LinkState,
    queue: CommandQueue,
    snapshot: SharedActuatorState,
    audit: AuditSender,
    supervisor: Arc<Mutex<NetworkSupervisor>>,
    arbiter: Arc<Mutex<CommissioningArbiter>>,
    update_tx: Sender<Manifest>,
    last_update_status: Arc<Mutex<UpdateStatus>>,
    last_commissioned: Arc<Mutex<Option<i64>>>,
    device_id: DeviceId,
    data_dir: PathBuf,
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = Arc::new(DeviceConfig::default());
    let data_dir = std::env::var("GROW_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.grow"));
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let store = Arc::new(Store::new(Box::new(FileBackend::new(data_dir.clone()))));
    let links = LinkState::new();
    let queue = CommandQueue::new();
    let snapshot = SharedActuatorState::new();
    let (audit_tx, audit_rx) = audit_channel();

    let device_id = host_device_id();
    info!(
        "grow controller (host) starting, device id {} ({})",
        device_id.hex(),
        device_id.short_name(&cfg.adv_name_prefix)
    );

    let last_update_status = Arc::new(Mutex::new(confirm_pending_slot(&data_dir, &store)));

    // Schedule defaults are materialized and written back on first boot.
    let schedule: ScheduleConfig = store
        .load_json_or_default(keys::SCHEDULE)
        .context("loading schedule")?;
    info!(
        "schedule: on {:02}:{:02} off {:02}:{:02} tz {}",
        schedule.on_hour, schedule.on_min, schedule.off_hour, schedule.off_min, schedule.tz
    );

    let trust = load_trust_root();
    let supervisor = Arc::new(Mutex::new(NetworkSupervisor::new(
        store.clone(),
        cfg.wifi_max_retry,
        false,
    )));
    let arbiter = Arc::new(Mutex::new(CommissioningArbiter::new(
        ArbiterConfig::from_seconds(cfg.ble_fallback_s, cfg.wifi_stable_min, cfg.reprovision_window_s),
        monotonic_ms(),
    )));

    let (update_tx, update_rx) = channel::<Manifest>();
    let ctx = AppContext {
        cfg: cfg.clone(),
        store: store.clone(),
        links: links.clone(),
        queue: queue.clone(),
        snapshot: snapshot.clone(),
        audit: audit_tx.clone(),
        supervisor: supervisor.clone(),
        arbiter: arbiter.clone(),
        update_tx,
        last_update_status,
        last_commissioned: Arc::new(Mutex::new(None)),
        device_id,
        data_dir: data_dir.clone(),
    };

    // Bring the network up. On the host the station is the machine's own
    // NIC, so a connect request succeeds immediately.
    {
        let mut sup = supervisor.lock().unwrap();
        match sup.init() {
            SupervisorAction::Connect => {
                sup.on_event(WifiEvent::Connected, monotonic_ms(), &links);
            }
            SupervisorAction::None => {
                arbiter.lock().unwrap().note_missing_credentials(&links);
            }
        }
    }

    let watchdog = Arc::new(SoftWatchdog::new());
    spawn_control_pipeline(&ctx, watchdog.clone());
    spawn_safety_task(&ctx, watchdog);
    spawn_schedule_task(&ctx);
    spawn_arbiter_task(&ctx);
    spawn_local_channel(&ctx)?;
    spawn_update_task(&ctx, update_rx, trust);

    if let Ok(mqtt_host) = std::env::var("GROW_MQTT_HOST") {
        let mqtt_port = std::env::var("GROW_MQTT_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(1883);
        spawn_cloud_link(&ctx, audit_rx, mqtt_host, mqtt_port);
    } else {
        info!("GROW_MQTT_HOST not set; cloud link disabled");
        spawn_audit_logger(audit_rx);
    }

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

// --- durable store backend -------------------------------------------------

/// One file per key under the data directory. `Store` adds the CRC framing
/// and hot-spare logic on top.
struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.blob"))
    }
}

impl StoreBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Backend(err.to_string())),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        fs::write(self.path_for(key), value).map_err(|err| Error::Backend(err.to_string()))
    }

    fn commit(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

// --- actuator + watchdog ---------------------------------------------------

/// Stands in for the PWM peripheral: logs every applied duty.
struct LoggingActuator;

impl ActuatorDriver for LoggingActuator {
    fn apply(&mut self, light_pct: u8, pump_pct: u8, ramp_ms: u32) -> Result<(), Error> {
        info!("actuator: light={light_pct}% pump={pump_pct}% ramp={ramp_ms}ms");
        Ok(())
    }
}

/// Software stand-in for the hardware task watchdog: the safety task trips
/// when the control pipeline stops petting.
struct SoftWatchdog {
    last_pet: Mutex<Instant>,
}

impl SoftWatchdog {
    fn new() -> Self {
        Self {
            last_pet: Mutex::new(Instant::now()),
        }
    }

    fn starved(&self) -> bool {
        self.last_pet.lock().unwrap().elapsed() > SOFT_WATCHDOG_TIMEOUT
    }
}

impl WatchdogFeed for SoftWatchdog {
    fn pet(&self) {
        *self.last_pet.lock().unwrap() = Instant::now();
    }
}

fn spawn_control_pipeline(ctx: &AppContext, watchdog: Arc<SoftWatchdog>) {
    let pipeline = ControlPipeline::new(
        ctx.queue.clone(),
        Arc::new(Mutex::new(LoggingActuator)),
        ctx.snapshot.clone(),
        watchdog,
        Some(ctx.audit.clone()),
    );
    let links = ctx.links.clone();
    thread::Builder::new()
        .name("control".into())
        .spawn(move || pipeline.run(&links, monotonic_ms))
        .expect("failed to spawn control thread");
}

fn spawn_safety_task(ctx: &AppContext, watchdog: Arc<SoftWatchdog>) {
    let queue = ctx.queue.clone();
    let links = ctx.links.clone();
    let audit = ctx.audit.clone();
    thread::Builder::new()
        .name("safety".into())
        .spawn(move || {
            while !links.is_set(links::SHUTDOWN) {
                if watchdog.starved() {
                    warn!("safety: control pipeline stalled, forcing actuators off");
                    let _ = audit.send("safety shutdown: control pipeline stalled".into());
                    safety_shutdown(&queue, Utc::now().timestamp());
                    // On hardware the task watchdog resets the device here.
                    watchdog.pet();
                }
                thread::sleep(Duration::from_millis(500));
            }
        })
        .expect("failed to spawn safety thread");
}

// --- schedule --------------------------------------------------------------

fn spawn_schedule_task(ctx: &AppContext) {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("schedule".into())
        .spawn(move || {
            grow_common::schedule::run_schedule_task(
                &ctx.store,
                &ctx.queue,
                &ctx.links,
                &ctx.snapshot,
                &ctx.cfg.pump,
                ctx.cfg.schedule_light_on_pct,
                || Utc::now().timestamp(),
            );
        })
        .expect("failed to spawn schedule thread");
}

fn spawn_arbiter_task(ctx: &AppContext) {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("arbiter".into())
        .spawn(move || {
            while !ctx.links.is_set(links::SHUTDOWN) {
                let up_since = ctx.supervisor.lock().unwrap().up_since_ms();
                ctx.arbiter
                    .lock()
                    .unwrap()
                    .tick(monotonic_ms(), &ctx.links, up_since);
                thread::sleep(Duration::from_secs(1));
            }
        })
        .expect("failed to spawn arbiter thread");
}

// --- local commissioning channel -------------------------------------------

/// TCP stand-in for the radio attribute: each frame is a 2-byte big-endian
/// length followed by at most 256 bytes of payload, exactly what a single
/// characteristic write would carry.
fn spawn_local_channel(ctx: &AppContext) -> anyhow::Result<()> {
    let port = std::env::var("GROW_LOCAL_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(LOCAL_CHANNEL_DEFAULT_PORT);
    let listener = TcpListener::bind(("127.0.0.1", port))
        .with_context(|| format!("binding local channel on port {port}"))?;
    info!("local channel listening on 127.0.0.1:{port}");

    let ctx = ctx.clone();
    thread::Builder::new()
        .name("local-channel".into())
        .spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                // The arbiter owns the bit; a closed window means no service.
                if !ctx.links.is_set(links::LOCAL_CHANNEL_ACTIVE) {
                    info!("local channel inactive, dropping connection");
                    continue;
                }
                let ctx = ctx.clone();
                thread::Builder::new()
                    .name("local-peer".into())
                    .spawn(move || {
                        if let Err(err) = serve_local_peer(stream, &ctx) {
                            info!("local peer closed: {err:#}");
                        }
                    })
                    .expect("failed to spawn local peer thread");
            }
        })
        .expect("failed to spawn local channel thread");
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> anyhow::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 2];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = usize::from(u16::from_be_bytes(header));
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> anyhow::Result<()> {
    stream.write_all(&(payload.len() as u16).to_be_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}

fn serve_local_peer(mut stream: TcpStream, ctx: &AppContext) -> anyhow::Result<()> {
    let mut session = CommissioningSession::new(ctx.store.clone());
    while let Some(frame) = read_frame(&mut stream)? {
        if ctx.links.is_set(links::SHUTDOWN) {
            break;
        }
        match session.handle_frame(&frame, Utc::now().timestamp()) {
            Ok(SessionEvent::Provisioned(frame)) => {
                let response = match apply_provisioning(ctx, &frame) {
                    Ok(()) => br#"{"ok":true}"#.to_vec(),
                    Err(err) => {
                        warn!("provisioning rejected: {err}");
                        format!(r#"{{"error":"{err}"}}"#).into_bytes()
                    }
                };
                write_frame(&mut stream, &response)?;
            }
            Ok(SessionEvent::HandshakeComplete { device_pub }) => {
                write_frame(&mut stream, &device_pub)?;
            }
            Ok(SessionEvent::Command(cmd)) => {
                // Replay state is already persisted; only now may the
                // command become visible.
                ctx.queue.send(cmd);
            }
            Ok(SessionEvent::Dropped) => {}
            Err(err) => {
                write_frame(&mut stream, format!(r#"{{"error":"{err}"}}"#).as_bytes())?;
            }
        }
    }
    session.disconnect();
    Ok(())
}

fn apply_provisioning(ctx: &AppContext, frame: &ProvisioningFrame) -> Result<(), Error> {
    let psk = frame.psk.as_deref().unwrap_or("");
    let action = ctx
        .supervisor
        .lock()
        .unwrap()
        .set_credentials(&frame.ssid, psk)?;

    if let Some(tz) = frame.tz.as_deref().filter(|tz| !tz.is_empty()) {
        let mut schedule: ScheduleConfig = ctx.store.load_json_or_default(keys::SCHEDULE)?;
        schedule.tz = tz.to_string();
        schedule.sanitize();
        ctx.store.save_json(keys::SCHEDULE, &schedule)?;
    }

    let now_ms = monotonic_ms();
    ctx.arbiter.lock().unwrap().note_provisioned(now_ms, &ctx.links);
    *ctx.last_commissioned.lock().unwrap() = Some(Utc::now().timestamp());
    let _ = ctx.audit.send(format!("provisioned ssid={}", frame.ssid));

    if action == SupervisorAction::Connect {
        // Host "station" comes straight up.
        ctx.supervisor
            .lock()
            .unwrap()
            .on_event(WifiEvent::Connected, now_ms, &ctx.links);
    }
    Ok(())
}

// --- update pipeline wiring ------------------------------------------------

/// Reads `file://` URLs, the host stand-in for the streamed HTTPS fetch.
struct FileFetcher;

impl ImageFetcher for FileFetcher {
    fn fetch(
        &mut self,
        url: &str,
        _ca_pem: Option<&[u8]>,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), Error>,
    ) -> Result<u64, Error> {
        let path = url
            .strip_prefix("file://")
            .ok_or(Error::InvalidArgument("host fetcher needs a file:// url"))?;
        let image = fs::read(path).map_err(|err| Error::Io(err.to_string()))?;
        for chunk in image.chunks(4096) {
            sink(chunk)?;
        }
        Ok(image.len() as u64)
    }
}

/// The alternate slot as a file plus a pending-boot marker.
struct FileSlot {
    image_path: PathBuf,
    marker_path: PathBuf,
    written: Vec<u8>,
}

impl FileSlot {
    fn new(data_dir: &Path) -> Self {
        Self {
            image_path: data_dir.join("slot_b.bin"),
            marker_path: data_dir.join("pending_boot"),
            written: Vec::new(),
        }
    }
}

impl ImageSlot for FileSlot {
    fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.written.extend_from_slice(chunk);
        Ok(())
    }

    fn set_pending(&mut self) -> Result<(), Error> {
        fs::write(&self.image_path, &self.written).map_err(|err| Error::Io(err.to_string()))?;
        fs::write(&self.marker_path, b"pending").map_err(|err| Error::Io(err.to_string()))
    }

    fn invalidate(&mut self) {
        self.written.clear();
        let _ = fs::remove_file(&self.image_path);
        let _ = fs::remove_file(&self.marker_path);
    }
}

/// First-boot confirmation: a surviving pending marker means the new image
/// booted and gets confirmed, cancelling rollback.
fn confirm_pending_slot(data_dir: &Path, store: &Store) -> UpdateStatus {
    let reverted = data_dir.join("reverted");
    if reverted.exists() {
        let _ = fs::remove_file(&reverted);
        warn!("update: boot loader reverted to the previous slot");
        return UpdateStatus::Reverted;
    }
    let marker = data_dir.join("pending_boot");
    if marker.exists() {
        let _ = fs::remove_file(&marker);
        let version = store.load_u32(keys::OTA_VERSION).unwrap_or(0);
        info!("update: slot confirmed after first boot (version {version})");
        return UpdateStatus::Applied;
    }
    UpdateStatus::Idle
}

fn spawn_update_task(ctx: &AppContext, update_rx: Receiver<Manifest>, trust: TrustRoot) {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("update".into())
        .spawn(move || {
            let pipeline = UpdatePipeline::new(ctx.store.clone(), trust);
            while let Ok(manifest) = update_rx.recv() {
                info!("update: manifest received, version {}", manifest.version);
                let mut fetcher = FileFetcher;
                let mut slot = FileSlot::new(&ctx.data_dir);
                match pipeline.apply(&manifest, &mut fetcher, &mut slot) {
                    Ok(committed) => {
                        let _ = ctx.audit.send(format!(
                            "update committed: version {}, reset requested",
                            committed.version
                        ));
                        // On hardware this is the reset; the host harness
                        // just reports it.
                        info!("update: commit complete, device reset requested");
                    }
                    Err(err) => {
                        warn!("update failed: {err}");
                        *ctx.last_update_status.lock().unwrap() = UpdateStatus::Failed;
                        let _ = ctx.audit.send(format!("update failed: {}", err.audit_label()));
                    }
                }
            }
        })
        .expect("failed to spawn update thread");
}

// --- cloud link ------------------------------------------------------------

fn spawn_cloud_link(ctx: &AppContext, audit_rx: AuditReceiver, host: String, port: u16) {
    let mut options = MqttOptions::new(ctx.cfg.device_name.clone(), host, port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut connection) = Client::new(options, 64);

    // Receiver half: job documents and connection state.
    {
        let ctx = ctx.clone();
        let client = client.clone();
        thread::Builder::new()
            .name("mqtt-rx".into())
            .spawn(move || {
                let jobs_topic = topics::jobs_notify_next(&ctx.cfg.device_name);
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("cloud session up");
                            ctx.links.set(links::CLOUD_UP);
                            if let Err(err) = client.subscribe(jobs_topic.as_str(), QoS::AtLeastOnce) {
                                warn!("job subscribe failed: {err}");
                            }
                            publish_shadow(&client, &ctx);
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let Ok(body) = std::str::from_utf8(&publish.payload) else {
                                continue;
                            };
                            handle_job_document(&ctx, body);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            ctx.links.clear(links::CLOUD_UP);
                            warn!("mqtt connection error: {err}");
                            thread::sleep(Duration::from_secs(2));
                        }
                    }
                }
            })
            .expect("failed to spawn mqtt rx thread");
    }

    // Publisher half: heartbeat plus audit drain.
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("telemetry".into())
        .spawn(move || {
            let start = Instant::now();
            let interval = Duration::from_secs(u64::from(ctx.cfg.heartbeat_interval_s));
            let mut next_heartbeat = Instant::now() + interval;
            loop {
                let timeout = next_heartbeat.saturating_duration_since(Instant::now());
                if let Some(line) = audit_rx.recv_timeout(timeout.max(Duration::from_millis(10))) {
                    if ctx.links.is_set(links::CLOUD_UP) {
                        if let Err(err) =
                            client.publish(topics::TOPIC_AUDIT, QoS::AtLeastOnce, false, line)
                        {
                            warn!("audit publish failed: {err}");
                        }
                    }
                    continue;
                }

                next_heartbeat = Instant::now() + interval;
                // Dropped silently while the cloud session is down.
                if !ctx.links.is_set(links::CLOUD_UP) {
                    continue;
                }
                let mut heartbeat = Heartbeat::new(
                    Utc::now().timestamp(),
                    start.elapsed().as_secs(),
                    "POWERON",
                );
                if let Ok(schedule) = ctx.store.load_json::<ScheduleConfig>(keys::SCHEDULE) {
                    if let Ok(next) = schedule.next_events(Utc::now().timestamp()) {
                        heartbeat = heartbeat.with_next_events(next);
                    }
                }
                match serde_json::to_vec(&heartbeat) {
                    Ok(body) => {
                        if let Err(err) =
                            client.publish(topics::TOPIC_HEARTBEAT, QoS::AtLeastOnce, false, body)
                        {
                            warn!("heartbeat publish failed: {err}");
                        }
                    }
                    Err(err) => warn!("heartbeat serialization failed: {err}"),
                }
            }
        })
        .expect("failed to spawn telemetry thread");
}

fn handle_job_document(ctx: &AppContext, body: &str) {
    match decode_job_document(body, ctx.cfg.accept_legacy_jobs) {
        Ok(JobDecision::Manifest(manifest)) => {
            if ctx.update_tx.send(*manifest).is_err() {
                warn!("update task gone, dropping job");
            }
        }
        Ok(JobDecision::Ignored) => {}
        Err(err @ UpdateError::Unauthorized) => {
            warn!("legacy ota_url job rejected");
            let _ = ctx.audit.send(format!("job rejected: {}", err.audit_label()));
        }
        Err(err) => {
            let _ = ctx.audit.send(format!("job rejected: {}", err.audit_label()));
        }
    }
}

fn publish_shadow(client: &Client, ctx: &AppContext) {
    let snapshot: ActuatorState = ctx.snapshot.get();
    let shadow = ShadowReported {
        light_pct: snapshot.light_pct,
        pump_pct: snapshot.pump_pct,
        firmware_version: ctx.store.load_u32(keys::OTA_VERSION).unwrap_or(0),
        last_update_status: *ctx.last_update_status.lock().unwrap(),
        last_commissioned_utc: *ctx.last_commissioned.lock().unwrap(),
    };
    let topic = topics::shadow_update(&ctx.cfg.device_name);
    match serde_json::to_vec(&shadow.to_update_document()) {
        Ok(body) => {
            if let Err(err) = client.publish(topic, QoS::AtLeastOnce, false, body) {
                warn!("shadow publish failed: {err}");
            }
        }
        Err(err) => warn!("shadow serialization failed: {err}"),
    }
}

fn spawn_audit_logger(audit_rx: AuditReceiver) {
    thread::Builder::new()
        .name("audit-log".into())
        .spawn(move || loop {
            if let Some(line) = audit_rx.recv_timeout(Duration::from_secs(5)) {
                info!("audit: {line}");
            }
        })
        .expect("failed to spawn audit logger thread");
}

// --- misc ------------------------------------------------------------------

fn load_trust_root() -> TrustRoot {
    let Ok(path) = std::env::var("GROW_TRUST_ROOT") else {
        info!("GROW_TRUST_ROOT not set; trust root empty");
        return TrustRoot::default();
    };
    match fs::read(&path).map_err(anyhow::Error::from).and_then(|blob| {
        TrustRoot::parse(&blob).map_err(anyhow::Error::from)
    }) {
        Ok(root) => {
            info!("trust root loaded from {path}");
            root
        }
        Err(err) => {
            warn!("trust root unreadable ({err:#}); continuing with empty trust root");
            TrustRoot::default()
        }
    }
}

/// Stable-but-fake station identifier for the host harness.
fn host_device_id() -> DeviceId {
    DeviceId([0x02, 0x00, 0x5e, 0x7a, 0x11, 0x42])
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
