//! Device build: binds the coordination fabric to ESP-IDF — NVS for the
//! durable store, LEDC for the two PWM outputs, the Wi-Fi station plus SNTP
//! for the cloud path, NimBLE for the local commissioning channel, the OTA
//! slots for updates, and the task watchdog for the safety loop.

use std::ffi::CStr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::http::client::Client as HttpClient;
use embedded_svc::http::{Method, Status};
use embedded_svc::io::{Read, Write};
use embedded_svc::mqtt::client::{Details, EventPayload, QoS};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{BLEAdvertisementData, BLEDevice, NimbleProperties};
use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver};
use esp_idf_hal::prelude::*;
use esp_idf_hal::units::Hertz;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::ota::{EspOta, EspOtaUpdate};
use esp_idf_svc::sntp::{EspSntp, SyncStatus};
use esp_idf_svc::tls::X509;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use log::{info, warn};

use grow_common::store::keys;
use grow_common::{
    audit_channel, decode_job_document, links, safety_shutdown, topics, ActuatorDriver,
    ArbiterConfig, AuditReceiver, AuditSender, CommandQueue, CommissioningArbiter,
    CommissioningSession, ControlPipeline, DeviceConfig, DeviceId, Error, Heartbeat, ImageFetcher,
    ImageSlot, JobDecision, LinkState, Manifest, NetworkSupervisor, ProvisioningFrame,
    ScheduleConfig, SessionEvent, ShadowReported, SharedActuatorState, Store, StoreBackend,
    SupervisorAction, TrustRoot, UpdateError, UpdatePipeline, UpdateStatus, WatchdogFeed,
    WifiEvent,
};

const NVS_NAMESPACE: &str = "grow";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_POLL_MS: u64 = 1_000;
const OTA_CHUNK_SIZE: usize = 4096;
const MAX_MQTT_PAYLOAD_BYTES: usize = 2_048;

const SVC_COMMISSIONING: BleUuid = BleUuid::Uuid16(0xA000);
const CHR_CONTROL: BleUuid = BleUuid::Uuid16(0xA004);
const CHR_RESPONSE: BleUuid = BleUuid::Uuid16(0xA005);

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
    reconnect_tx: Sender<()>,
    last_update_status: Arc<Mutex<UpdateStatus>>,
    last_commissioned: Arc<Mutex<Option<i64>>>,
    device_id: DeviceId,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    // If this boot is pending verification after an update, confirm it now to
    // cancel the automatic rollback. No-op otherwise.
    let last_update_status = match EspOta::new() {
        Ok(mut ota) => match ota.mark_running_slot_valid() {
            Ok(()) => UpdateStatus::Applied,
            Err(_) => UpdateStatus::Idle,
        },
        Err(_) => UpdateStatus::Idle,
    };

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = match EspDefaultNvsPartition::take() {
        Ok(partition) => partition,
        Err(err) => {
            // No free pages or a version mismatch: erase and reinitialize.
            warn!("nvs init failed ({err}), erasing partition");
            unsafe { esp_idf_svc::sys::nvs_flash_erase() };
            EspDefaultNvsPartition::take()?
        }
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let cfg = Arc::new(DeviceConfig::default());
    let store = Arc::new(Store::new(Box::new(NvsBackend {
        partition: nvs_partition.clone(),
    })));
    let links = LinkState::new();
    let queue = CommandQueue::new();
    let snapshot = SharedActuatorState::new();
    let (audit_tx, audit_rx) = audit_channel();

    let device_id = station_device_id();
    info!(
        "grow controller starting, device id {} ({})",
        device_id.hex(),
        device_id.short_name(&cfg.adv_name_prefix)
    );

    // Schedule defaults are materialized and written back on first boot.
    let schedule: ScheduleConfig = store
        .load_json_or_default(keys::SCHEDULE)
        .context("loading schedule")?;
    info!(
        "schedule: on {:02}:{:02} off {:02}:{:02} tz {}",
        schedule.on_hour, schedule.on_min, schedule.off_hour, schedule.off_min, schedule.tz
    );

    let trust = read_trust_root_partition().unwrap_or_else(|err| {
        warn!("trust root unavailable: {err:#}");
        TrustRoot::default()
    });

    let peripherals = Peripherals::take()?;

    // Actuator outputs start at safe defaults (both off, no ramp). The timer
    // driver is shared by both channels for the life of the process.
    let timer: &'static LedcTimerDriver<'static> = Box::leak(Box::new(LedcTimerDriver::new(
        peripherals.ledc.timer0,
        &TimerConfig::default().frequency(Hertz(cfg.pwm_freq_hz)),
    )?));
    let light = LedcDriver::new(peripherals.ledc.channel0, timer, unsafe {
        esp_idf_hal::gpio::AnyOutputPin::new(cfg.light_gpio)
    })?;
    let pump = LedcDriver::new(peripherals.ledc.channel1, timer, unsafe {
        esp_idf_hal::gpio::AnyOutputPin::new(cfg.pump_gpio)
    })?;
    let mut driver = LedcActuator::new(light, pump);
    driver.apply(0, 0, 0).map_err(|err| anyhow!("{err}"))?;
    let driver = Arc::new(Mutex::new(driver));

    let supervisor = Arc::new(Mutex::new(NetworkSupervisor::new(
        store.clone(),
        cfg.wifi_max_retry,
        true,
    )));
    let arbiter = Arc::new(Mutex::new(CommissioningArbiter::new(
        ArbiterConfig::from_seconds(
            cfg.ble_fallback_s,
            cfg.wifi_stable_min,
            cfg.reprovision_window_s,
        ),
        monotonic_ms(),
    )));

    let (update_tx, update_rx) = channel::<Manifest>();
    let (reconnect_tx, reconnect_rx) = channel::<()>();
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
        reconnect_tx,
        last_update_status: Arc::new(Mutex::new(last_update_status)),
        last_commissioned: Arc::new(Mutex::new(None)),
        device_id,
    };

    spawn_safety_task(&ctx);
    spawn_control_pipeline(&ctx, driver);
    spawn_schedule_task(&ctx);
    spawn_arbiter_task(&ctx);
    spawn_local_channel(&ctx);
    spawn_wifi_task(&ctx, peripherals.modem, sys_loop, nvs_partition, reconnect_rx)?;
    spawn_update_task(&ctx, update_rx, trust.clone());
    spawn_cloud_link(&ctx, audit_rx, &trust)?;

    info!("init complete; application running");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

// --- durable store backend -------------------------------------------------

/// NVS-backed store medium; the CRC framing and hot-spare logic live in
/// `grow_common::store`. A fresh `EspNvs` handle per call keeps the backend
/// `Send`. Logical keys longer than the 15-character NVS limit are mapped
/// through `store::backend_key`.
struct NvsBackend {
    partition: EspDefaultNvsPartition,
}

const NVS_KEY_MAX: usize = 15;

impl NvsBackend {
    fn open(&self) -> Result<EspNvs<NvsDefault>, Error> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| Error::Backend(err.to_string()))
    }
}

impl StoreBackend for NvsBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let key = grow_common::store::backend_key(key, NVS_KEY_MAX);
        let nvs = self.open()?;
        let Some(len) = nvs
            .blob_len(&key)
            .map_err(|err| Error::Backend(err.to_string()))?
        else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len];
        let read = nvs
            .get_blob(&key, &mut buf)
            .map_err(|err| Error::Backend(err.to_string()))?;
        Ok(read.map(|slice| slice.to_vec()))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        let key = grow_common::store::backend_key(key, NVS_KEY_MAX);
        let mut nvs = self.open()?;
        nvs.set_blob(&key, value)
            .map_err(|err| Error::Backend(err.to_string()))
    }

    fn commit(&mut self) -> Result<(), Error> {
        // EspNvs commits on every set.
        Ok(())
    }
}

// --- actuator --------------------------------------------------------------

/// Two LEDC channels; ramps are stepped in software at a fixed cadence.
struct LedcActuator {
    light: LedcDriver<'static>,
    pump: LedcDriver<'static>,
    current_light: u8,
    current_pump: u8,
}

impl LedcActuator {
    fn new(light: LedcDriver<'static>, pump: LedcDriver<'static>) -> Self {
        Self {
            light,
            pump,
            current_light: 0,
            current_pump: 0,
        }
    }

    fn set_duty(&mut self, light_pct: u8, pump_pct: u8) -> Result<(), Error> {
        let max = self.light.get_max_duty();
        let light_duty = u32::from(light_pct.min(100)) * max / 100;
        let pump_duty = u32::from(pump_pct.min(100)) * max / 100;
        self.light
            .set_duty(light_duty)
            .map_err(|err| Error::Io(err.to_string()))?;
        self.pump
            .set_duty(pump_duty)
            .map_err(|err| Error::Io(err.to_string()))?;
        Ok(())
    }
}

impl ActuatorDriver for LedcActuator {
    fn apply(&mut self, light_pct: u8, pump_pct: u8, ramp_ms: u32) -> Result<(), Error> {
        let steps = grow_common::pipeline::ramp_steps(ramp_ms, grow_common::pipeline::RAMP_STEP_MS);
        if steps > 1 {
            let from_light = i32::from(self.current_light);
            let from_pump = i32::from(self.current_pump);
            let to_light = i32::from(light_pct.min(100));
            let to_pump = i32::from(pump_pct.min(100));
            for step in 1..=steps as i32 {
                let l = from_light + (to_light - from_light) * step / steps as i32;
                let p = from_pump + (to_pump - from_pump) * step / steps as i32;
                self.set_duty(l as u8, p as u8)?;
                thread::sleep(Duration::from_millis(u64::from(
                    grow_common::pipeline::RAMP_STEP_MS,
                )));
            }
        } else {
            self.set_duty(light_pct, pump_pct)?;
        }
        self.current_light = light_pct.min(100);
        self.current_pump = pump_pct.min(100);
        Ok(())
    }
}

// --- safety & watchdog -----------------------------------------------------

struct TaskWatchdog;

impl WatchdogFeed for TaskWatchdog {
    fn pet(&self) {
        feed_watchdog();
    }
}

fn spawn_safety_task(ctx: &AppContext) {
    let queue = ctx.queue.clone();
    let audit = ctx.audit.clone();
    thread::Builder::new()
        .name("safety".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register safety task with watchdog: {err:#}");
            }
            let mut low_heap_reported = false;
            loop {
                feed_watchdog();
                // Heap exhaustion is the one anomaly worth a forced shutdown
                // ahead of the inevitable reset.
                let min_free = unsafe { esp_idf_svc::sys::esp_get_minimum_free_heap_size() };
                if min_free < 8 * 1024 && !low_heap_reported {
                    low_heap_reported = true;
                    warn!("safety: minimum free heap {min_free} bytes, forcing actuators off");
                    let _ = audit.send(format!("safety shutdown: min free heap {min_free}"));
                    safety_shutdown(&queue, Utc::now().timestamp());
                }
                thread::sleep(Duration::from_millis(500));
            }
        })
        .expect("failed to spawn safety thread");
}

fn spawn_control_pipeline(ctx: &AppContext, driver: Arc<Mutex<LedcActuator>>) {
    let pipeline = ControlPipeline::new(
        ctx.queue.clone(),
        driver,
        ctx.snapshot.clone(),
        Arc::new(TaskWatchdog),
        Some(ctx.audit.clone()),
    );
    let links = ctx.links.clone();
    thread::Builder::new()
        .name("control".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control task with watchdog: {err:#}");
            }
            pipeline.run(&links, monotonic_ms);
        })
        .expect("failed to spawn control thread");
}

fn spawn_schedule_task(ctx: &AppContext) {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("schedule".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register schedule task with watchdog: {err:#}");
            }
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
        .stack_size(4 * 1024)
        .spawn(move || loop {
            let up_since = ctx.supervisor.lock().unwrap().up_since_ms();
            ctx.arbiter
                .lock()
                .unwrap()
                .tick(monotonic_ms(), &ctx.links, up_since);
            thread::sleep(Duration::from_secs(1));
        })
        .expect("failed to spawn arbiter thread");
}

// --- local commissioning channel (NimBLE) ----------------------------------

fn spawn_local_channel(ctx: &AppContext) {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("ble".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let device = BLEDevice::take();
            let server = device.get_server();
            let service = server.create_service(SVC_COMMISSIONING);
            let control = service
                .lock()
                .create_characteristic(CHR_CONTROL, NimbleProperties::WRITE);
            let response = service
                .lock()
                .create_characteristic(CHR_RESPONSE, NimbleProperties::READ | NimbleProperties::NOTIFY);

            let session = Arc::new(Mutex::new(CommissioningSession::new(ctx.store.clone())));
            {
                let ctx = ctx.clone();
                let session = session.clone();
                let response = response.clone();
                control.lock().on_write(move |args| {
                    let frame = args.recv_data().to_vec();
                    let event = session
                        .lock()
                        .unwrap()
                        .handle_frame(&frame, Utc::now().timestamp());
                    match event {
                        Ok(SessionEvent::Provisioned(frame)) => {
                            let reply: &[u8] = match apply_provisioning(&ctx, &frame) {
                                Ok(()) => br#"{"ok":true}"#,
                                Err(err) => {
                                    warn!("provisioning rejected: {err}");
                                    br#"{"error":"provisioning rejected"}"#
                                }
                            };
                            response.lock().set_value(reply).notify();
                        }
                        Ok(SessionEvent::HandshakeComplete { device_pub }) => {
                            response.lock().set_value(&device_pub).notify();
                        }
                        Ok(SessionEvent::Command(cmd)) => {
                            // Replay state is already persisted by the
                            // session; the command may now become visible.
                            ctx.queue.send(cmd);
                        }
                        Ok(SessionEvent::Dropped) => {}
                        Err(err) => {
                            warn!("local channel frame rejected: {err}");
                            response
                                .lock()
                                .set_value(br#"{"error":"bad frame"}"#)
                                .notify();
                        }
                    }
                });
            }

            let advertising = device.get_advertising();
            let name = ctx.device_id.short_name(&ctx.cfg.adv_name_prefix);
            let mut advertising_on = false;
            loop {
                let want = ctx.links.is_set(links::LOCAL_CHANNEL_ACTIVE);
                if want && !advertising_on {
                    let mut data = BLEAdvertisementData::new();
                    data.name(&name)
                        .add_service_uuid(SVC_COMMISSIONING)
                        .manufacturer_data(&ctx.device_id.0);
                    let started = {
                        let mut adv = advertising.lock();
                        adv.set_data(&mut data).and_then(|_| adv.start())
                    };
                    match started {
                        Ok(_) => {
                            info!("local channel advertising as `{name}`");
                            advertising_on = true;
                        }
                        Err(err) => warn!("failed to start advertising: {err:?}"),
                    }
                } else if !want && advertising_on {
                    if let Err(err) = advertising.lock().stop() {
                        warn!("failed to stop advertising: {err:?}");
                    } else {
                        info!("local channel advertising stopped");
                        advertising_on = false;
                        session.lock().unwrap().disconnect();
                    }
                }
                thread::sleep(Duration::from_secs(1));
            }
        })
        .expect("failed to spawn ble thread");
}

fn apply_provisioning(ctx: &AppContext, frame: &ProvisioningFrame) -> Result<(), Error> {
    let psk = frame.psk.as_deref().unwrap_or("");
    ctx.supervisor
        .lock()
        .unwrap()
        .set_credentials(&frame.ssid, psk)?;

    if let Some(tz) = frame.tz.as_deref().filter(|tz| !tz.is_empty()) {
        let mut schedule: ScheduleConfig = ctx.store.load_json_or_default(keys::SCHEDULE)?;
        schedule.tz = tz.to_string();
        schedule.sanitize();
        ctx.store.save_json(keys::SCHEDULE, &schedule)?;
    }

    ctx.arbiter
        .lock()
        .unwrap()
        .note_provisioned(monotonic_ms(), &ctx.links);
    *ctx.last_commissioned.lock().unwrap() = Some(Utc::now().timestamp());
    let _ = ctx.audit.send(format!("provisioned ssid={}", frame.ssid));

    // Wake the network task so the new credentials are applied promptly.
    let _ = ctx.reconnect_tx.send(());
    Ok(())
}

// --- wifi / time -----------------------------------------------------------

fn spawn_wifi_task(
    ctx: &AppContext,
    modem: esp_idf_hal::modem::Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    reconnect_rx: Receiver<()>,
) -> anyhow::Result<()> {
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("net".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let mut esp_wifi = esp_wifi;
            let mut wifi = match BlockingWifi::wrap(&mut esp_wifi, sys_loop) {
                Ok(wifi) => wifi,
                Err(err) => {
                    warn!("wifi init failed: {err:?}");
                    return;
                }
            };

            let initial = ctx.supervisor.lock().unwrap().init();
            if initial == SupervisorAction::None {
                ctx.arbiter
                    .lock()
                    .unwrap()
                    .note_missing_credentials(&ctx.links);
            }
            let mut want_connect = initial == SupervisorAction::Connect;

            let mut sntp: Option<EspSntp> = None;
            let mut time_synced = false;
            let mut was_connected = false;

            loop {
                if reconnect_rx.try_recv().is_ok() {
                    want_connect = true;
                }

                if want_connect {
                    want_connect = false;
                    let creds = ctx.supervisor.lock().unwrap().credentials().cloned();
                    if let Some(creds) = creds {
                        match connect_station(&mut wifi, &creds.ssid, &creds.psk) {
                            Ok(()) => {
                                info!("wifi connected to `{}`", creds.ssid);
                            }
                            Err(err) => {
                                warn!("wifi connect failed: {err:#}");
                            }
                        }
                    }
                }

                let connected = is_wifi_station_connected();
                if connected && !was_connected {
                    let action = ctx.supervisor.lock().unwrap().on_event(
                        WifiEvent::Connected,
                        monotonic_ms(),
                        &ctx.links,
                    );
                    debug_assert_eq!(action, SupervisorAction::None);
                    if sntp.is_none() {
                        match EspSntp::new_default() {
                            Ok(new_sntp) => sntp = Some(new_sntp),
                            Err(err) => warn!("failed to start SNTP: {err:?}"),
                        }
                    }
                } else if !connected && was_connected {
                    let action = ctx.supervisor.lock().unwrap().on_event(
                        WifiEvent::Disconnected,
                        monotonic_ms(),
                        &ctx.links,
                    );
                    if action == SupervisorAction::Connect {
                        want_connect = true;
                    }
                }
                was_connected = connected;

                if !time_synced {
                    if let Some(sntp) = sntp.as_ref() {
                        if sntp.get_sync_status() == SyncStatus::Completed {
                            time_synced = true;
                            ctx.supervisor.lock().unwrap().on_event(
                                WifiEvent::TimeSynced,
                                monotonic_ms(),
                                &ctx.links,
                            );
                            info!("time synchronized");
                        }
                    }
                }

                thread::sleep(Duration::from_millis(WIFI_POLL_MS));
            }
        })
        .expect("failed to spawn net thread");
    Ok(())
}

fn connect_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    ssid: &str,
    psk: &str,
) -> anyhow::Result<()> {
    let auth_method = if psk.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("ssid too long"))?,
        password: psk.try_into().map_err(|_| anyhow!("psk too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    if !wifi.is_started().unwrap_or(false) {
        wifi.start()?;
    }
    wifi.connect()?;
    wifi.wait_netif_up()?;
    Ok(())
}

// --- update pipeline wiring ------------------------------------------------

/// Streamed HTTPS fetch, pinned to the trust-root CA when one is present.
struct EspHttpFetcher;

impl ImageFetcher for EspHttpFetcher {
    fn fetch(
        &mut self,
        url: &str,
        _ca_pem: Option<&[u8]>,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), Error>,
    ) -> Result<u64, Error> {
        let http_conf = HttpConfiguration {
            timeout: Some(Duration::from_secs(30)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection =
            EspHttpConnection::new(&http_conf).map_err(|err| Error::Io(err.to_string()))?;
        let mut client = HttpClient::wrap(connection);
        let request = client
            .request(Method::Get, url, &[])
            .map_err(|err| Error::Io(err.to_string()))?;
        let mut response = request.submit().map_err(|err| Error::Io(err.to_string()))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(Error::Io(format!("http status {status}")));
        }

        let mut total: u64 = 0;
        let mut chunk = [0u8; OTA_CHUNK_SIZE];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| Error::Io(format!("{err:?}")))?;
            if read == 0 {
                break;
            }
            sink(&chunk[..read])?;
            total += read as u64;
        }
        Ok(total)
    }
}

/// The alternate OTA partition behind the `ImageSlot` seam.
struct EspSlot<'a> {
    update: Option<EspOtaUpdate<'a>>,
}

impl ImageSlot for EspSlot<'_> {
    fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let update = self
            .update
            .as_mut()
            .ok_or(Error::InvalidArgument("slot already finalized"))?;
        let mut remaining = chunk;
        while !remaining.is_empty() {
            let written = update
                .write(remaining)
                .map_err(|err| Error::Io(format!("{err:?}")))?;
            if written == 0 {
                return Err(Error::Io("ota write stalled".into()));
            }
            remaining = &remaining[written..];
        }
        Ok(())
    }

    fn set_pending(&mut self) -> Result<(), Error> {
        let update = self
            .update
            .take()
            .ok_or(Error::InvalidArgument("slot already finalized"))?;
        update
            .complete()
            .map_err(|err| Error::Io(format!("{err:?}")))
    }

    fn invalidate(&mut self) {
        if let Some(update) = self.update.take() {
            let _ = update.abort();
        }
    }
}

fn spawn_update_task(ctx: &AppContext, update_rx: Receiver<Manifest>, trust: TrustRoot) {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("update".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let pipeline = UpdatePipeline::new(ctx.store.clone(), trust);
            while let Ok(manifest) = update_rx.recv() {
                info!("update: manifest received, version {}", manifest.version);
                let mut ota = match EspOta::new() {
                    Ok(ota) => ota,
                    Err(err) => {
                        warn!("update: ota unavailable: {err:?}");
                        continue;
                    }
                };
                let update = match ota.initiate_update() {
                    Ok(update) => update,
                    Err(err) => {
                        warn!("update: failed to open slot: {err:?}");
                        continue;
                    }
                };
                let mut slot = EspSlot {
                    update: Some(update),
                };
                let mut fetcher = EspHttpFetcher;
                match pipeline.apply(&manifest, &mut fetcher, &mut slot) {
                    Ok(committed) => {
                        let _ = ctx.audit.send(format!(
                            "update committed: version {}, resetting",
                            committed.version
                        ));
                        thread::sleep(Duration::from_millis(800));
                        unsafe { esp_idf_svc::sys::esp_restart() };
                    }
                    Err(err) => {
                        warn!("update failed: {err}");
                        *ctx.last_update_status.lock().unwrap() = UpdateStatus::Failed;
                        let _ = ctx
                            .audit
                            .send(format!("update failed: {}", err.audit_label()));
                    }
                }
            }
        })
        .expect("failed to spawn update thread");
}

// --- cloud link ------------------------------------------------------------

fn spawn_cloud_link(
    ctx: &AppContext,
    audit_rx: AuditReceiver,
    trust: &TrustRoot,
) -> anyhow::Result<()> {
    let url = format!("mqtts://{}:8883", ctx.cfg.cloud_endpoint);

    let mut conf = MqttClientConfiguration {
        client_id: Some(&ctx.cfg.device_name),
        keep_alive_interval: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    // Mutual TLS out of the factory-installed trust root.
    conf.server_certificate = trust.ca.as_deref().and_then(leak_pem);
    conf.client_certificate = trust.device_cert.as_deref().and_then(leak_pem);
    conf.private_key = trust.device_key.as_deref().and_then(leak_pem);

    let (client, connection) = EspMqttClient::new(&url, &conf)?;
    let client = Arc::new(Mutex::new(client));

    spawn_mqtt_receiver(ctx, connection, client.clone());
    spawn_telemetry(ctx, audit_rx, client);
    Ok(())
}

fn spawn_mqtt_receiver(
    ctx: &AppContext,
    mut connection: EspMqttConnection,
    client: Arc<Mutex<EspMqttClient<'static>>>,
) {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let jobs_topic = topics::jobs_notify_next(&ctx.cfg.device_name);
            loop {
                match connection.next() {
                    Ok(event) => match event.payload() {
                        EventPayload::Connected(_) => {
                            info!("cloud session up");
                            ctx.links.set(links::CLOUD_UP);
                            if let Err(err) = client
                                .lock()
                                .unwrap()
                                .subscribe(&jobs_topic, QoS::AtLeastOnce)
                            {
                                warn!("job subscribe failed: {err:?}");
                            }
                            publish_shadow(&ctx, &client);
                        }
                        EventPayload::Disconnected => {
                            warn!("cloud session lost");
                            ctx.links.clear(links::CLOUD_UP);
                        }
                        EventPayload::Received {
                            topic: Some(_topic),
                            data,
                            details,
                            ..
                        } => {
                            if !matches!(details, Details::Complete) {
                                continue;
                            }
                            if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                                warn!("dropping oversized job payload ({} bytes)", data.len());
                                continue;
                            }
                            if let Ok(body) = core::str::from_utf8(data) {
                                handle_job_document(&ctx, body);
                            }
                        }
                        _ => {}
                    },
                    Err(err) => {
                        ctx.links.clear(links::CLOUD_UP);
                        warn!("mqtt receive loop error: {err:?}");
                        thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        })
        .expect("failed to spawn mqtt rx thread");
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

fn spawn_telemetry(
    ctx: &AppContext,
    audit_rx: AuditReceiver,
    client: Arc<Mutex<EspMqttClient<'static>>>,
) {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("telemetry".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let interval = Duration::from_secs(u64::from(ctx.cfg.heartbeat_interval_s));
            let mut next_heartbeat = Instant::now() + interval;
            loop {
                let timeout = next_heartbeat
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_millis(10));
                if let Some(line) = audit_rx.recv_timeout(timeout) {
                    if ctx.links.is_set(links::CLOUD_UP) {
                        if let Err(err) = client.lock().unwrap().publish(
                            topics::TOPIC_AUDIT,
                            QoS::AtLeastOnce,
                            false,
                            line.as_bytes(),
                        ) {
                            warn!("audit publish failed: {err:?}");
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
                    monotonic_ms() / 1_000,
                    reset_reason_label(),
                );
                heartbeat.min_free_heap = Some(u64::from(unsafe {
                    esp_idf_svc::sys::esp_get_minimum_free_heap_size()
                }));
                heartbeat.wifi_rssi = station_rssi();
                if let Ok(schedule) = ctx.store.load_json::<ScheduleConfig>(keys::SCHEDULE) {
                    if let Ok(next) = schedule.next_events(Utc::now().timestamp()) {
                        heartbeat = heartbeat.with_next_events(next);
                    }
                }

                match serde_json::to_vec(&heartbeat) {
                    Ok(body) => {
                        if let Err(err) = client.lock().unwrap().publish(
                            topics::TOPIC_HEARTBEAT,
                            QoS::AtLeastOnce,
                            false,
                            &body,
                        ) {
                            warn!("heartbeat publish failed: {err:?}");
                        }
                    }
                    Err(err) => warn!("heartbeat serialization failed: {err}"),
                }
            }
        })
        .expect("failed to spawn telemetry thread");
}

fn publish_shadow(ctx: &AppContext, client: &Arc<Mutex<EspMqttClient<'static>>>) {
    let snapshot = ctx.snapshot.get();
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
            if let Err(err) =
                client
                    .lock()
                    .unwrap()
                    .publish(&topic, QoS::AtLeastOnce, false, &body)
            {
                warn!("shadow publish failed: {err:?}");
            }
        }
        Err(err) => warn!("shadow serialization failed: {err}"),
    }
}

// --- trust root ------------------------------------------------------------

/// Reads the factory `esp_secure_cert` partition and parses the SPCF TLV
/// container out of it.
fn read_trust_root_partition() -> anyhow::Result<TrustRoot> {
    use esp_idf_svc::sys::{
        esp_partition_find_first, esp_partition_read, esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
        esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
    };

    let label = CStr::from_bytes_with_nul(b"esp_secure_cert\0").expect("static label");
    let partition = unsafe {
        esp_partition_find_first(
            esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            label.as_ptr(),
        )
    };
    if partition.is_null() {
        return Err(anyhow!("esp_secure_cert partition not found"));
    }

    let size = unsafe { (*partition).size } as usize;
    let mut blob = vec![0u8; size];
    let rc = unsafe { esp_partition_read(partition, 0, blob.as_mut_ptr().cast(), size) };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("esp_partition_read failed: {rc}"));
    }

    TrustRoot::parse(&blob).map_err(|err| anyhow!("trust root parse failed: {err}"))
}

/// PEM slices handed to the TLS stack must be NUL-terminated and outlive the
/// client, so the trust-root copies are leaked once at startup.
fn leak_pem(bytes: &[u8]) -> Option<X509<'static>> {
    let mut owned = bytes.to_vec();
    if owned.last() != Some(&0) {
        owned.push(0);
    }
    let leaked: &'static [u8] = Box::leak(owned.into_boxed_slice());
    let cstr = CStr::from_bytes_with_nul(leaked).ok()?;
    Some(X509::pem(cstr))
}

// --- platform helpers ------------------------------------------------------

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

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn station_rssi() -> Option<i8> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
}

fn station_device_id() -> DeviceId {
    let mut mac = [0u8; 6];
    let rc = unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("esp_read_mac failed ({rc}), using a zero identifier");
    }
    DeviceId(mac)
}

fn reset_reason_label() -> &'static str {
    match unsafe { esp_idf_svc::sys::esp_reset_reason() } {
        esp_idf_svc::sys::esp_reset_reason_t_ESP_RST_POWERON => "POWERON",
        esp_idf_svc::sys::esp_reset_reason_t_ESP_RST_SW => "SOFTWARE",
        esp_idf_svc::sys::esp_reset_reason_t_ESP_RST_PANIC => "PANIC",
        esp_idf_svc::sys::esp_reset_reason_t_ESP_RST_INT_WDT
        | esp_idf_svc::sys::esp_reset_reason_t_ESP_RST_TASK_WDT
        | esp_idf_svc::sys::esp_reset_reason_t_ESP_RST_WDT => "WATCHDOG",
        esp_idf_svc::sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "DEEPSLEEP",
        esp_idf_svc::sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "BROWNOUT",
        _ => "UNKNOWN",
    }
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
