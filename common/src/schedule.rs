use chrono::{Duration, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::PumpCycleConfig;
use crate::error::{Error, Result};
use crate::types::{Actor, Command};

/// Ramp used for ordinary scheduled transitions.
const SCHEDULE_RAMP_MS: u32 = 1_000;
/// Ramp used for the single correction emitted after missed transitions.
const RECONCILE_RAMP_MS: u32 = 500;

/// Local on/off wall-clock times plus the IANA timezone they are expressed
/// in. Stored under [`crate::store::keys::SCHEDULE`]; defaults are
/// materialized and written back on first load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub on_hour: u8,
    pub on_min: u8,
    pub off_hour: u8,
    pub off_min: u8,
    /// IANA timezone identifier, e.g. "America/Los_Angeles".
    pub tz: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            on_hour: 7,
            on_min: 0,
            off_hour: 21,
            off_min: 0,
            tz: "UTC".to_string(),
        }
    }
}

/// Next on/off transitions, both in UTC seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextEvents {
    pub next_on_utc: i64,
    pub next_off_utc: i64,
}

impl ScheduleConfig {
    pub fn sanitize(&mut self) {
        self.on_hour = self.on_hour.min(23);
        self.on_min = self.on_min.min(59);
        self.off_hour = self.off_hour.min(23);
        self.off_min = self.off_min.min(59);
        if self.tz.is_empty() || self.tz.len() > 64 || self.timezone().is_err() {
            self.tz = "UTC".to_string();
        }
    }

    fn timezone(&self) -> Result<Tz> {
        self.tz
            .parse()
            .map_err(|_| Error::InvalidArgument("timezone"))
    }

    /// Whether the light should currently be on. The on minute is inclusive,
    /// the off minute exclusive; an on time later than the off time means an
    /// overnight window.
    pub fn is_on_at(&self, now_utc: i64) -> Result<bool> {
        let tz = self.timezone()?;
        let now = Utc
            .timestamp_opt(now_utc, 0)
            .single()
            .ok_or(Error::InvalidArgument("timestamp"))?;
        let local = now.with_timezone(&tz);

        let now_min = local.hour() * 60 + local.minute();
        let on_min = u32::from(self.on_hour) * 60 + u32::from(self.on_min);
        let off_min = u32::from(self.off_hour) * 60 + u32::from(self.off_min);

        Ok(if on_min < off_min {
            now_min >= on_min && now_min < off_min
        } else {
            now_min >= on_min || now_min < off_min
        })
    }

    /// Next on and off transitions after `now_utc`, computed independently.
    pub fn next_events(&self, now_utc: i64) -> Result<NextEvents> {
        let tz = self.timezone()?;
        let now = Utc
            .timestamp_opt(now_utc, 0)
            .single()
            .ok_or(Error::InvalidArgument("timestamp"))?;

        let next_on = next_occurrence(tz, now, self.on_hour, self.on_min)
            .ok_or(Error::InvalidArgument("on time"))?;
        let next_off = next_occurrence(tz, now, self.off_hour, self.off_min)
            .ok_or(Error::InvalidArgument("off time"))?;
        Ok(NextEvents {
            next_on_utc: next_on,
            next_off_utc: next_off,
        })
    }

    /// Compares the desired light state at `last_seen_utc` and `now_utc` and
    /// collapses any number of missed transitions into at most one
    /// correction. Returns the target light state, or `None` when nothing
    /// was missed.
    pub fn reconcile(&self, last_seen_utc: i64, now_utc: i64) -> Result<Option<bool>> {
        if last_seen_utc >= now_utc {
            return Ok(None);
        }
        let was_on = self.is_on_at(last_seen_utc)?;
        let should_be_on = self.is_on_at(now_utc)?;
        Ok((was_on != should_be_on).then_some(should_be_on))
    }
}

fn next_occurrence(tz: Tz, now: chrono::DateTime<Utc>, hour: u8, minute: u8) -> Option<i64> {
    let local_now = now.with_timezone(&tz);
    let mut date = local_now.date_naive();
    // Today, else tomorrow; one extra day covers DST gaps on the boundary.
    for _ in 0..3 {
        if let Some(naive) = date.and_hms_opt(u32::from(hour), u32::from(minute), 0) {
            if let Some(candidate) = resolve_local(tz, naive) {
                if candidate.timestamp() > now.timestamp() {
                    return Some(candidate.timestamp());
                }
            }
        }
        date = date.succ_opt()?;
    }
    None
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<chrono::DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        // Repeated local hour when clocks fall back: take the first pass.
        LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        // Nonexistent local time when clocks spring forward.
        LocalResult::None => match tz.from_local_datetime(&(naive + Duration::hours(1))) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
            LocalResult::None => None,
        },
    }
}

impl PumpCycleConfig {
    /// Pump superimposition: anchored at the epoch minute, the pump is on for
    /// the first `on_minutes` of every `period_minutes` cycle, independent of
    /// the light schedule.
    pub fn is_on_at(&self, now_utc: i64) -> bool {
        let period = i64::from(self.period_minutes.max(self.on_minutes).max(1));
        let minutes = now_utc.div_euclid(60);
        minutes.rem_euclid(period) < i64::from(self.on_minutes)
    }
}

/// Minute-tick evaluator. Re-derives the desired light and pump duty on every
/// call and emits a command only when either changed since the last emission.
pub struct ScheduleEngine {
    light_on_pct: u8,
    seq: u32,
    last_emitted: Option<(u8, u8)>,
}

impl ScheduleEngine {
    pub fn new(light_on_pct: u8) -> Self {
        Self {
            light_on_pct: light_on_pct.min(100),
            seq: 0,
            last_emitted: None,
        }
    }

    pub fn evaluate(
        &mut self,
        schedule: &ScheduleConfig,
        pump: &PumpCycleConfig,
        now_utc: i64,
    ) -> Result<Option<Command>> {
        let light_pct = if schedule.is_on_at(now_utc)? {
            self.light_on_pct
        } else {
            0
        };
        let pump_pct = if pump.is_on_at(now_utc) {
            pump.intensity_pct.min(100)
        } else {
            0
        };

        if self.last_emitted == Some((light_pct, pump_pct)) {
            return Ok(None);
        }
        self.last_emitted = Some((light_pct, pump_pct));
        self.seq = self.seq.wrapping_add(1);
        Ok(Some(Command::new(
            Actor::Schedule,
            self.seq,
            now_utc,
            light_pct,
            pump_pct,
            SCHEDULE_RAMP_MS,
        )))
    }

    /// Builds the single correction command for missed transitions. The pump
    /// duty is preserved from the current snapshot; only the light is
    /// corrected.
    pub fn reconciliation_command(
        &mut self,
        target_light_on: bool,
        preserved_pump_pct: u8,
        now_utc: i64,
    ) -> Command {
        let light_pct = if target_light_on { self.light_on_pct } else { 0 };
        self.last_emitted = Some((light_pct, preserved_pump_pct.min(100)));
        self.seq = self.seq.wrapping_add(1);
        Command::new(
            Actor::Schedule,
            self.seq,
            now_utc,
            light_pct,
            preserved_pump_pct,
            RECONCILE_RAMP_MS,
        )
    }
}

/// Task body shared by the host harness and the device build: waits for time
/// sync, reconciles transitions missed while powered off, then re-evaluates
/// the schedule on every minute boundary. Sleeps in short chunks so shutdown
/// stays responsive and the watchdog keeps getting fed.
pub fn run_schedule_task(
    store: &crate::store::Store,
    queue: &crate::pipeline::CommandQueue,
    links: &crate::links::LinkState,
    snapshot: &crate::types::SharedActuatorState,
    pump: &PumpCycleConfig,
    light_on_pct: u8,
    now_utc: impl Fn() -> i64,
) {
    use crate::links::{SHUTDOWN, TIME_SYNCED};
    use crate::store::keys;
    use log::warn;
    use std::time::Duration;

    loop {
        let bits = links.wait_all(TIME_SYNCED, Duration::from_secs(1));
        if bits & TIME_SYNCED != 0 {
            break;
        }
        if bits & SHUTDOWN != 0 {
            return;
        }
    }

    let mut engine = ScheduleEngine::new(light_on_pct);

    let now = now_utc();
    if let Ok(last_seen) = store.load_u64(keys::LAST_SEEN_UTC) {
        if let Ok(schedule) = store.load_json::<ScheduleConfig>(keys::SCHEDULE) {
            match schedule.reconcile(last_seen as i64, now) {
                Ok(Some(target_on)) => {
                    // The correction touches only the light; the pump keeps
                    // whatever was last applied.
                    let preserved = snapshot.get().pump_pct;
                    log::info!(
                        "schedule: reconciling missed transition, light {}",
                        if target_on { "on" } else { "off" }
                    );
                    queue.send(engine.reconciliation_command(target_on, preserved, now));
                }
                Ok(None) => {}
                Err(err) => warn!("schedule: reconcile failed: {err}"),
            }
        }
    }

    let mut last_minute = i64::MIN;
    while !links.is_set(SHUTDOWN) {
        std::thread::sleep(Duration::from_millis(500));
        let now = now_utc();
        let minute = now.div_euclid(60);
        if minute == last_minute {
            continue;
        }
        last_minute = minute;

        // Reload on every evaluation: cloud or local-channel updates may
        // have replaced the configuration.
        let mut schedule: ScheduleConfig = match store.load_json_or_default(keys::SCHEDULE) {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!("schedule: load failed: {err}");
                continue;
            }
        };
        schedule.sanitize();

        match engine.evaluate(&schedule, pump, now) {
            Ok(Some(cmd)) => queue.send(cmd),
            Ok(None) => {}
            Err(err) => warn!("schedule: evaluation failed: {err}"),
        }
        let _ = store.save_u64(keys::LAST_SEEN_UTC, now as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc_schedule(on: (u8, u8), off: (u8, u8)) -> ScheduleConfig {
        ScheduleConfig {
            on_hour: on.0,
            on_min: on.1,
            off_hour: off.0,
            off_min: off.1,
            tz: "UTC".to_string(),
        }
    }

    #[test]
    fn next_events_from_epoch() {
        let cfg = utc_schedule((7, 0), (21, 0));
        let next = cfg.next_events(0).unwrap();
        assert_eq!(next.next_on_utc, 7 * 3600);
        assert_eq!(next.next_off_utc, 21 * 3600);
    }

    #[test]
    fn next_event_rolls_to_the_following_day() {
        let cfg = utc_schedule((7, 0), (21, 0));
        // 08:00: today's on time has passed.
        let next = cfg.next_events(8 * 3600).unwrap();
        assert_eq!(next.next_on_utc, (24 + 7) * 3600);
        assert_eq!(next.next_off_utc, 21 * 3600);
    }

    #[test]
    fn exact_event_time_advances_a_day() {
        let cfg = utc_schedule((7, 0), (21, 0));
        let next = cfg.next_events(7 * 3600).unwrap();
        assert_eq!(next.next_on_utc, (24 + 7) * 3600);
    }

    #[test]
    fn overnight_window_is_on_across_midnight() {
        let cfg = utc_schedule((22, 0), (6, 0));
        assert!(cfg.is_on_at(23 * 3600).unwrap());
        assert!(!cfg.is_on_at(7 * 3600).unwrap());
        assert!(cfg.is_on_at(5 * 3600 + 59 * 60).unwrap());
    }

    #[test]
    fn on_minute_inclusive_off_minute_exclusive() {
        let cfg = utc_schedule((7, 0), (21, 0));
        assert!(cfg.is_on_at(7 * 3600).unwrap());
        assert!(!cfg.is_on_at(21 * 3600).unwrap());
        assert!(cfg.is_on_at(21 * 3600 - 60).unwrap());
    }

    #[test]
    fn named_timezone_shifts_the_window() {
        let cfg = ScheduleConfig {
            tz: "America/New_York".to_string(),
            ..utc_schedule((7, 0), (21, 0))
        };
        // 2026-01-15 00:00:00 UTC is the evening of Jan 14 in New York.
        let now = 1_768_435_200;
        let next = cfg.next_events(now).unwrap();
        // Next on: Jan 15 07:00 EST == 12:00 UTC.
        assert_eq!(next.next_on_utc, now + 12 * 3600);
    }

    #[test]
    fn reconcile_detects_a_missed_transition() {
        let cfg = utc_schedule((7, 0), (21, 0));
        // Asleep from 06:00 to 08:00: the 07:00 turn-on was missed.
        assert_eq!(
            cfg.reconcile(6 * 3600, 8 * 3600).unwrap(),
            Some(true)
        );
        // Asleep across both edges of the window: net state unchanged.
        assert_eq!(cfg.reconcile(6 * 3600, 22 * 3600).unwrap(), None);
    }

    #[test]
    fn reconcile_is_idempotent_and_ignores_backward_time() {
        let cfg = utc_schedule((7, 0), (21, 0));
        let first = cfg.reconcile(6 * 3600, 8 * 3600).unwrap();
        let second = cfg.reconcile(6 * 3600, 8 * 3600).unwrap();
        assert_eq!(first, second);
        assert_eq!(cfg.reconcile(9 * 3600, 8 * 3600).unwrap(), None);
    }

    #[test]
    fn pump_cycle_is_epoch_anchored() {
        let pump = PumpCycleConfig {
            on_minutes: 5,
            period_minutes: 30,
            intensity_pct: 60,
        };
        assert!(pump.is_on_at(0));
        assert!(pump.is_on_at(4 * 60 + 59));
        assert!(!pump.is_on_at(5 * 60));
        assert!(!pump.is_on_at(29 * 60));
        assert!(pump.is_on_at(30 * 60));
    }

    #[test]
    fn engine_emits_exactly_one_command_per_transition() {
        let cfg = utc_schedule((7, 0), (21, 0));
        let pump = PumpCycleConfig {
            on_minutes: 1,
            period_minutes: 1,
            intensity_pct: 40,
        };
        let mut engine = ScheduleEngine::new(100);

        // First evaluation always emits the current state.
        let initial = engine.evaluate(&cfg, &pump, 6 * 3600).unwrap().unwrap();
        assert_eq!(initial.light_pct, 0);
        assert_eq!(initial.pump_pct, 40);

        // One second before the on minute: nothing.
        assert!(engine
            .evaluate(&cfg, &pump, 7 * 3600 - 1)
            .unwrap()
            .is_none());

        // At 07:00:00: exactly one command, light on.
        let cmd = engine.evaluate(&cfg, &pump, 7 * 3600).unwrap().unwrap();
        assert_eq!(cmd.actor, Actor::Schedule);
        assert_eq!(cmd.light_pct, 100);
        assert_eq!(cmd.pump_pct, 40);

        // Still on later in the same state: nothing again.
        assert!(engine.evaluate(&cfg, &pump, 7 * 3600 + 30).unwrap().is_none());
    }

    #[test]
    fn sanitize_falls_back_to_utc_for_bad_timezones() {
        let mut cfg = ScheduleConfig {
            tz: "Not/AZone".to_string(),
            on_hour: 30,
            ..ScheduleConfig::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.tz, "UTC");
        assert_eq!(cfg.on_hour, 23);
    }

    #[test]
    fn reconciliation_command_preserves_pump() {
        let mut engine = ScheduleEngine::new(100);
        let cmd = engine.reconciliation_command(true, 35, 1000);
        assert_eq!(cmd.light_pct, 100);
        assert_eq!(cmd.pump_pct, 35);
        assert_eq!(cmd.ramp_ms, RECONCILE_RAMP_MS);
    }
}
