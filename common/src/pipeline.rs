use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::Result;
use crate::links::{LinkState, SHUTDOWN};
use crate::telemetry::AuditSender;
use crate::types::{Actor, Command, ActuatorState, SharedActuatorState};

/// Capacity of the non-urgent command queue. Overflow drops the oldest
/// non-urgent entry; urgent sends never drop.
pub const QUEUE_CAPACITY: usize = 8;

/// Granularity of software-stepped ramps.
pub const RAMP_STEP_MS: u32 = 50;

/// Longest the pipeline will block waiting out a ramp before rechecking the
/// queue, so the watchdog keeps getting fed.
const RAMP_WAIT_CHUNK: Duration = Duration::from_millis(500);

/// Number of uniform steps for a software ramp: `ceil(ramp_ms / step_ms)`.
pub fn ramp_steps(ramp_ms: u32, step_ms: u32) -> u32 {
    if step_ms == 0 {
        return 0;
    }
    ramp_ms.div_ceil(step_ms)
}

/// Sole writer of the actuator peripheral. The driver applies both duties and
/// starts the ramp; hardware-assisted fades return immediately.
pub trait ActuatorDriver: Send {
    fn apply(&mut self, light_pct: u8, pump_pct: u8, ramp_ms: u32) -> Result<()>;
}

/// Fed by the pipeline once per processed command and once per wait chunk.
pub trait WatchdogFeed: Send + Sync {
    fn pet(&self);
}

/// No-op feed for hosts without a hardware watchdog.
pub struct NullWatchdog;

impl WatchdogFeed for NullWatchdog {
    fn pet(&self) {}
}

struct QueueInner {
    urgent: VecDeque<Command>,
    normal: VecDeque<Command>,
}

/// Bounded MPSC command queue with priority preemption: urgent commands
/// (actor = Safety) are delivered before any queued non-urgent command and
/// are never dropped or coalesced.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<(Mutex<QueueInner>, Condvar)>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(QueueInner {
                    urgent: VecDeque::new(),
                    normal: VecDeque::with_capacity(QUEUE_CAPACITY),
                }),
                Condvar::new(),
            )),
        }
    }

    /// Enqueues a command. Non-urgent sends displace the oldest queued
    /// non-urgent command when full.
    pub fn send(&self, cmd: Command) {
        let (lock, cond) = &*self.inner;
        let mut queue = lock.lock().unwrap();
        if cmd.is_urgent() {
            queue.urgent.push_back(cmd);
        } else {
            if queue.normal.len() >= QUEUE_CAPACITY {
                let dropped = queue.normal.pop_front();
                if let Some(dropped) = dropped {
                    warn!(
                        "command queue full, dropping oldest entry from {}",
                        dropped.actor.as_str()
                    );
                }
            }
            queue.normal.push_back(cmd);
        }
        cond.notify_one();
    }

    /// Blocks until a command is available or the timeout elapses. Urgent
    /// entries always win.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Command> {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &*self.inner;
        let mut queue = lock.lock().unwrap();
        loop {
            if let Some(cmd) = queue.urgent.pop_front() {
                return Some(cmd);
            }
            if let Some(cmd) = queue.normal.pop_front() {
                return Some(cmd);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = cond.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }

    pub fn len(&self) -> usize {
        let queue = self.inner.0.lock().unwrap();
        queue.urgent.len() + queue.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Safety preemption entrypoint: forces both actuators to zero ahead of all
/// queued work. Callable from any task, including the safety loop.
pub fn safety_shutdown(queue: &CommandQueue, now_utc: i64) {
    queue.send(Command::new(Actor::Safety, 0, now_utc, 0, 0, 0));
}

/// Single consumer of the command queue and single writer of the peripheral.
pub struct ControlPipeline<D: ActuatorDriver> {
    queue: CommandQueue,
    driver: Arc<Mutex<D>>,
    snapshot: SharedActuatorState,
    watchdog: Arc<dyn WatchdogFeed>,
    audit: Option<AuditSender>,
}

impl<D: ActuatorDriver> ControlPipeline<D> {
    pub fn new(
        queue: CommandQueue,
        driver: Arc<Mutex<D>>,
        snapshot: SharedActuatorState,
        watchdog: Arc<dyn WatchdogFeed>,
        audit: Option<AuditSender>,
    ) -> Self {
        Self {
            queue,
            driver,
            snapshot,
            watchdog,
            audit,
        }
    }

    /// Processes one command if one arrives within `timeout`. Returns whether
    /// a command was consumed. The run loop calls this repeatedly; tests call
    /// it directly.
    pub fn poll_one(&self, timeout: Duration, now_ms: u64) -> bool {
        let Some(cmd) = self.queue.recv_timeout(timeout) else {
            self.watchdog.pet();
            return false;
        };
        self.apply(cmd, now_ms);
        true
    }

    fn apply(&self, cmd: Command, now_ms: u64) {
        let light = cmd.light_pct.min(100);
        let pump = cmd.pump_pct.min(100);

        info!(
            "control: actor={} seq={} light={}% pump={}% ramp={}ms",
            cmd.actor.as_str(),
            cmd.seq,
            light,
            pump,
            cmd.ramp_ms
        );

        let applied = {
            let mut driver = self.driver.lock().unwrap();
            driver.apply(light, pump, cmd.ramp_ms)
        };

        match applied {
            Ok(()) => {
                self.snapshot.set(ActuatorState {
                    light_pct: light,
                    pump_pct: pump,
                    applied_at_ms: now_ms,
                });
                self.wait_out_ramp(cmd.ramp_ms);
            }
            Err(err) => {
                // Snapshot stays on the last applied state; the next command
                // retries the peripheral.
                warn!("control: peripheral rejected command: {err}");
                if let Some(audit) = &self.audit {
                    let _ = audit.send(format!(
                        "actuator apply failed: actor={} err={err}",
                        cmd.actor.as_str()
                    ));
                }
            }
        }
        self.watchdog.pet();
    }

    /// Blocks for the ramp duration in chunks, feeding the watchdog. Urgent
    /// commands interrupt the wait so safety preemption is never delayed by a
    /// long ramp.
    fn wait_out_ramp(&self, ramp_ms: u32) {
        let mut remaining = Duration::from_millis(u64::from(ramp_ms));
        while !remaining.is_zero() {
            if self.urgent_pending() {
                return;
            }
            let chunk = remaining.min(RAMP_WAIT_CHUNK);
            std::thread::sleep(chunk);
            self.watchdog.pet();
            remaining -= chunk;
        }
    }

    fn urgent_pending(&self) -> bool {
        !self.inner_urgent_is_empty()
    }

    fn inner_urgent_is_empty(&self) -> bool {
        self.queue.inner.0.lock().unwrap().urgent.is_empty()
    }

    /// Consumer loop: runs until the shutdown bit is raised. Any queued work
    /// remaining at shutdown is discarded.
    pub fn run(&self, links: &LinkState, now_ms: impl Fn() -> u64) {
        info!("control pipeline running");
        while !links.is_set(SHUTDOWN) {
            self.poll_one(Duration::from_millis(500), now_ms());
        }
        info!("control pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct RecordingDriver {
        applied: Vec<(u8, u8, u32)>,
        fail_next: bool,
    }

    impl RecordingDriver {
        fn new() -> Self {
            Self {
                applied: Vec::new(),
                fail_next: false,
            }
        }
    }

    impl ActuatorDriver for RecordingDriver {
        fn apply(&mut self, light_pct: u8, pump_pct: u8, ramp_ms: u32) -> Result<()> {
            if self.fail_next {
                self.fail_next = false;
                return Err(Error::Io("pwm fault".into()));
            }
            self.applied.push((light_pct, pump_pct, ramp_ms));
            Ok(())
        }
    }

    fn pipeline() -> (
        ControlPipeline<RecordingDriver>,
        CommandQueue,
        Arc<Mutex<RecordingDriver>>,
        SharedActuatorState,
    ) {
        let queue = CommandQueue::new();
        let driver = Arc::new(Mutex::new(RecordingDriver::new()));
        let snapshot = SharedActuatorState::new();
        let p = ControlPipeline::new(
            queue.clone(),
            driver.clone(),
            snapshot.clone(),
            Arc::new(NullWatchdog),
            None,
        );
        (p, queue, driver, snapshot)
    }

    #[test]
    fn ramp_step_counts() {
        assert_eq!(ramp_steps(1000, 50), 20);
        assert_eq!(ramp_steps(0, 50), 0);
        assert_eq!(ramp_steps(10, 50), 1);
        assert_eq!(ramp_steps(1000, 0), 0);
    }

    #[test]
    fn percents_are_clamped_on_the_way_to_the_driver() {
        let (p, queue, driver, snapshot) = pipeline();
        queue.send(Command {
            actor: Actor::Cloud,
            seq: 1,
            ts_utc: 0,
            light_pct: 150,
            pump_pct: 250,
            ramp_ms: 0,
        });
        assert!(p.poll_one(Duration::from_millis(10), 42));
        assert_eq!(driver.lock().unwrap().applied, vec![(100, 100, 0)]);
        assert_eq!(snapshot.get().light_pct, 100);
        assert_eq!(snapshot.get().applied_at_ms, 42);
    }

    #[test]
    fn urgent_command_preempts_queued_work() {
        let (p, queue, driver, _) = pipeline();
        queue.send(Command::new(Actor::Cloud, 1, 0, 80, 0, 0));
        queue.send(Command::new(Actor::Schedule, 2, 0, 60, 0, 0));
        safety_shutdown(&queue, 0);

        assert!(p.poll_one(Duration::from_millis(10), 0));
        assert_eq!(driver.lock().unwrap().applied[0], (0, 0, 0));

        // Non-urgent work survives in order behind it.
        assert!(p.poll_one(Duration::from_millis(10), 0));
        assert!(p.poll_one(Duration::from_millis(10), 0));
        let applied = driver.lock().unwrap().applied.clone();
        assert_eq!(applied, vec![(0, 0, 0), (80, 0, 0), (60, 0, 0)]);
    }

    #[test]
    fn overflow_drops_oldest_non_urgent_only() {
        let (_, queue, _, _) = pipeline();
        for seq in 0..(QUEUE_CAPACITY as u32 + 3) {
            queue.send(Command::new(Actor::Cloud, seq, 0, 10, 0, 0));
        }
        safety_shutdown(&queue, 0);
        assert_eq!(queue.len(), QUEUE_CAPACITY + 1);

        // The first delivered command is the urgent one, then the survivors
        // starting from the dropped-forward sequence.
        let first = queue.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(first.actor, Actor::Safety);
        let second = queue.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(second.seq, 3);
    }

    #[test]
    fn driver_failure_leaves_snapshot_untouched() {
        let (p, queue, driver, snapshot) = pipeline();
        queue.send(Command::new(Actor::Cloud, 1, 0, 70, 30, 0));
        assert!(p.poll_one(Duration::from_millis(10), 1));
        assert_eq!(snapshot.get().light_pct, 70);

        driver.lock().unwrap().fail_next = true;
        queue.send(Command::new(Actor::Cloud, 2, 0, 20, 20, 0));
        assert!(p.poll_one(Duration::from_millis(10), 2));
        // Unchanged after the failed apply.
        assert_eq!(snapshot.get().light_pct, 70);
        assert_eq!(snapshot.get().applied_at_ms, 1);

        // Next command goes through again.
        queue.send(Command::new(Actor::Cloud, 3, 0, 25, 25, 0));
        assert!(p.poll_one(Duration::from_millis(10), 3));
        assert_eq!(snapshot.get().light_pct, 25);
    }

    #[test]
    fn recv_times_out_on_an_empty_queue() {
        let (_, queue, _, _) = pipeline();
        assert!(queue.recv_timeout(Duration::from_millis(10)).is_none());
    }
}
