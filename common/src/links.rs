use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Wi-Fi station has an IP.
pub const WIFI_UP: u32 = 1 << 0;
/// Authenticated cloud session (MQTT over mTLS) is established.
pub const CLOUD_UP: u32 = 1 << 1;
/// Wall clock has been synchronized.
pub const TIME_SYNCED: u32 = 1 << 2;
/// Local commissioning channel should be advertising.
pub const LOCAL_CHANNEL_ACTIVE: u32 = 1 << 3;
/// Orderly shutdown requested; tasks return from their top-level loops.
pub const SHUTDOWN: u32 = 1 << 4;

/// Process-wide link-state bit group.
///
/// Each bit has exactly one owning component that sets and clears it; any
/// task may read or block on a mask. Modelled on a FreeRTOS event group:
/// lock-free for readers is not required, only bounded waits.
#[derive(Clone, Default)]
pub struct LinkState {
    inner: Arc<LinkStateInner>,
}

#[derive(Default)]
struct LinkStateInner {
    bits: Mutex<u32>,
    cond: Condvar,
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, mask: u32) {
        let mut bits = self.inner.bits.lock().unwrap();
        *bits |= mask;
        self.inner.cond.notify_all();
    }

    pub fn clear(&self, mask: u32) {
        let mut bits = self.inner.bits.lock().unwrap();
        *bits &= !mask;
        self.inner.cond.notify_all();
    }

    pub fn get(&self) -> u32 {
        *self.inner.bits.lock().unwrap()
    }

    pub fn is_set(&self, mask: u32) -> bool {
        self.get() & mask == mask
    }

    /// Blocks until every bit in `mask` is set or the timeout elapses.
    /// Returns the bit snapshot observed when the wait ended.
    pub fn wait_all(&self, mask: u32, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut bits = self.inner.bits.lock().unwrap();
        loop {
            if *bits & mask == mask {
                return *bits;
            }
            let now = Instant::now();
            if now >= deadline {
                return *bits;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(bits, deadline - now)
                .unwrap();
            bits = guard;
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.is_set(SHUTDOWN)
    }
}
