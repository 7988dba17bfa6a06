//! Cross-component scenarios: commissioning, link-loss recovery, and the
//! schedule-to-actuator path, wired together the way the controller binary
//! wires them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::arbiter::{ArbiterConfig, CommissioningArbiter};
use crate::config::{PumpCycleConfig, WifiCredentials};
use crate::links::{LinkState, LOCAL_CHANNEL_ACTIVE, TIME_SYNCED, WIFI_UP};
use crate::pipeline::{ActuatorDriver, CommandQueue, ControlPipeline, NullWatchdog};
use crate::schedule::{ScheduleConfig, ScheduleEngine};
use crate::session::{CommissioningSession, SessionEvent};
use crate::store::{keys, MemoryBackend, Store};
use crate::supervisor::{NetworkSupervisor, SupervisorAction, SupervisorState, WifiEvent};
use crate::types::{Actor, SharedActuatorState};
use crate::Result;

const ARBITER_CFG: ArbiterConfig = ArbiterConfig {
    ble_fallback_ms: 60_000,
    wifi_stable_ms: 300_000,
    reprovision_ms: 180_000,
};

struct CountingDriver {
    applied: Vec<(u8, u8)>,
}

impl ActuatorDriver for CountingDriver {
    fn apply(&mut self, light_pct: u8, pump_pct: u8, _ramp_ms: u32) -> Result<()> {
        self.applied.push((light_pct, pump_pct));
        Ok(())
    }
}

#[test]
fn fresh_boot_with_no_credentials_commissions_over_the_local_channel() {
    let store = Arc::new(Store::new(Box::new(MemoryBackend::new())));
    let links = LinkState::new();
    let mut supervisor = NetworkSupervisor::new(store.clone(), 6, false);
    let mut arbiter = CommissioningArbiter::new(ARBITER_CFG, 0);

    // Boot: nothing stored, so the channel opens immediately.
    assert_eq!(supervisor.init(), SupervisorAction::None);
    arbiter.note_missing_credentials(&links);
    assert!(links.is_set(LOCAL_CHANNEL_ACTIVE));

    // A provisioning frame arrives on the channel.
    let mut session = CommissioningSession::new(store.clone());
    let event = session
        .handle_frame(br#"{"ssid":"Lab","psk":"secret","tz":"UTC"}"#, 0)
        .unwrap();
    let SessionEvent::Provisioned(frame) = event else {
        panic!("expected provisioning event");
    };

    // The controller applies it: credentials persist, timezone persists,
    // the channel closes, the supervisor starts connecting.
    let action = supervisor
        .set_credentials(&frame.ssid, frame.psk.as_deref().unwrap_or(""))
        .unwrap();
    assert_eq!(action, SupervisorAction::Connect);
    let mut schedule: ScheduleConfig = store.load_json_or_default(keys::SCHEDULE).unwrap();
    schedule.tz = frame.tz.unwrap();
    schedule.sanitize();
    store.save_json(keys::SCHEDULE, &schedule).unwrap();
    arbiter.note_provisioned(10_000, &links);

    assert!(!links.is_set(LOCAL_CHANNEL_ACTIVE));
    assert_eq!(supervisor.state(), SupervisorState::Connecting);

    let stored: WifiCredentials = store.load_json(keys::WIFI_CREDS).unwrap();
    assert_eq!(stored.ssid, "Lab");
    assert_eq!(stored.psk, "secret");
    let stored_schedule: ScheduleConfig = store.load_json(keys::SCHEDULE).unwrap();
    assert_eq!(stored_schedule.tz, "UTC");
}

#[test]
fn exhausted_retries_reopen_the_commissioning_window() {
    let store = Arc::new(Store::new(Box::new(MemoryBackend::new())));
    let links = LinkState::new();
    let mut supervisor = NetworkSupervisor::new(store, 6, false);
    let mut arbiter = CommissioningArbiter::new(ARBITER_CFG, 0);

    assert_eq!(supervisor.init(), SupervisorAction::None);
    arbiter.note_missing_credentials(&links);
    supervisor.set_credentials("Lab", "secret").unwrap();
    arbiter.note_provisioned(20_000, &links);

    // Six consecutive failures exhaust the budget, the seventh fails hard.
    for n in 0..6 {
        assert_eq!(
            supervisor.on_event(WifiEvent::Disconnected, 21_000 + n, &links),
            SupervisorAction::Connect
        );
    }
    supervisor.on_event(WifiEvent::Disconnected, 30_000, &links);
    assert_eq!(supervisor.state(), SupervisorState::Failed);
    assert!(!links.is_set(WIFI_UP));

    // 180 s after the provisioning event with Wi-Fi still down, the window
    // re-opens.
    arbiter.tick(199_000, &links, supervisor.up_since_ms());
    assert!(!links.is_set(LOCAL_CHANNEL_ACTIVE));
    arbiter.tick(200_000, &links, supervisor.up_since_ms());
    assert!(links.is_set(LOCAL_CHANNEL_ACTIVE));
}

#[test]
fn scheduled_transition_flows_through_the_pipeline_to_the_actuator() {
    let links = LinkState::new();
    links.set(TIME_SYNCED | WIFI_UP);
    let queue = CommandQueue::new();
    let snapshot = SharedActuatorState::new();
    let driver = Arc::new(Mutex::new(CountingDriver {
        applied: Vec::new(),
    }));
    let pipeline = ControlPipeline::new(
        queue.clone(),
        driver.clone(),
        snapshot.clone(),
        Arc::new(NullWatchdog),
        None,
    );

    let schedule = ScheduleConfig::default(); // 07:00–21:00 UTC
    let pump = PumpCycleConfig {
        on_minutes: 1,
        period_minutes: 1,
        intensity_pct: 40,
    };
    let mut engine = ScheduleEngine::new(100);

    // 06:58 — initial state emission (light off, pump on).
    let cmd = engine
        .evaluate(&schedule, &pump, 6 * 3600 + 58 * 60)
        .unwrap()
        .unwrap();
    queue.send(cmd);

    // 06:59:59 — nothing new this minute.
    assert!(engine
        .evaluate(&schedule, &pump, 7 * 3600 - 1)
        .unwrap()
        .is_none());

    // 07:00:00 — exactly one command, attributed to the schedule.
    let cmd = engine.evaluate(&schedule, &pump, 7 * 3600).unwrap().unwrap();
    assert_eq!(cmd.actor, Actor::Schedule);
    queue.send(cmd);
    assert!(engine.evaluate(&schedule, &pump, 7 * 3600 + 59).unwrap().is_none());

    while pipeline.poll_one(Duration::from_millis(10), 0) {}

    let applied = driver.lock().unwrap().applied.clone();
    assert_eq!(applied, vec![(0, 40), (100, 40)]);
    assert_eq!(snapshot.get().light_pct, 100);
    assert_eq!(snapshot.get().pump_pct, 40);
}
