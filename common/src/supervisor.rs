//! Network supervisor: credential application, link lifecycle, and the
//! stability timestamp the commissioning arbiter reads. The state machine is
//! explicit so the retry budget and bit ownership are testable without a
//! radio; the platform layer drives it with [`WifiEvent`]s and executes the
//! returned [`SupervisorAction`]s.

use std::sync::Arc;

use log::{info, warn};

use crate::config::WifiCredentials;
use crate::error::{Error, Result};
use crate::links::{LinkState, TIME_SYNCED, WIFI_UP};
use crate::store::{keys, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Uninitialized,
    /// No credentials stored; waiting for commissioning.
    Idle,
    /// Credentials applied, link not yet up.
    Connecting,
    Up,
    /// Link lost after having been up; retries remain.
    Degraded,
    /// Retry budget exhausted; only new credentials or a reset recover.
    Failed,
}

/// Events reported by the platform Wi-Fi layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    Connected,
    Disconnected,
    TimeSynced,
}

/// What the platform layer should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    None,
    /// Start or restart a station connection with the current credentials.
    Connect,
}

pub struct NetworkSupervisor {
    state: SupervisorState,
    creds: Option<WifiCredentials>,
    retry_count: u32,
    max_retry: u32,
    /// Monotonic timestamp of the most recent down→up transition; cleared on
    /// every loss. The arbiter reads this as the stability anchor.
    up_since_ms: Option<u64>,
    /// Whether an SNTP-style time transport is wired in. Without one, the
    /// clock is trusted as soon as the link is up.
    has_time_transport: bool,
    store: Arc<Store>,
}

impl NetworkSupervisor {
    pub fn new(store: Arc<Store>, max_retry: u32, has_time_transport: bool) -> Self {
        Self {
            state: SupervisorState::Uninitialized,
            creds: None,
            retry_count: 0,
            max_retry,
            up_since_ms: None,
            has_time_transport,
            store,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn credentials(&self) -> Option<&WifiCredentials> {
        self.creds.as_ref()
    }

    pub fn up_since_ms(&self) -> Option<u64> {
        self.up_since_ms
    }

    /// Loads stored credentials and decides the initial state. Returns
    /// `Connect` when stored credentials exist.
    pub fn init(&mut self) -> SupervisorAction {
        match self.store.load_json::<WifiCredentials>(keys::WIFI_CREDS) {
            Ok(creds) if creds.is_valid() => {
                info!("supervisor: stored credentials found, connecting");
                self.creds = Some(creds);
                self.state = SupervisorState::Connecting;
                SupervisorAction::Connect
            }
            Ok(_) | Err(Error::NotFound) => {
                info!("supervisor: no credentials stored, idle until commissioned");
                self.state = SupervisorState::Idle;
                SupervisorAction::None
            }
            Err(err) => {
                warn!("supervisor: credential load failed ({err}), idle");
                self.state = SupervisorState::Idle;
                SupervisorAction::None
            }
        }
    }

    /// Validates and persists new credentials, resets the retry budget, and
    /// asks the platform to (re)connect.
    pub fn set_credentials(&mut self, ssid: &str, psk: &str) -> Result<SupervisorAction> {
        let creds = WifiCredentials {
            ssid: ssid.trim().to_string(),
            psk: psk.to_string(),
        };
        if !creds.is_valid() {
            return Err(Error::InvalidArgument("wifi credentials"));
        }
        self.store.save_json(keys::WIFI_CREDS, &creds)?;
        info!("supervisor: credentials replaced, reconnecting");
        self.creds = Some(creds);
        self.retry_count = 0;
        self.state = SupervisorState::Connecting;
        Ok(SupervisorAction::Connect)
    }

    /// Advances the state machine on a link event, maintaining the bits this
    /// component owns (`WIFI_UP`, `TIME_SYNCED`).
    pub fn on_event(
        &mut self,
        event: WifiEvent,
        now_ms: u64,
        links: &LinkState,
    ) -> SupervisorAction {
        match event {
            WifiEvent::Connected => {
                self.state = SupervisorState::Up;
                self.retry_count = 0;
                self.up_since_ms = Some(now_ms);
                links.set(WIFI_UP);
                if !self.has_time_transport {
                    links.set(TIME_SYNCED);
                }
                SupervisorAction::None
            }
            WifiEvent::TimeSynced => {
                links.set(TIME_SYNCED);
                SupervisorAction::None
            }
            WifiEvent::Disconnected => {
                let was_up = self.state == SupervisorState::Up;
                links.clear(WIFI_UP);
                self.up_since_ms = None;

                if self.state == SupervisorState::Idle || self.creds.is_none() {
                    return SupervisorAction::None;
                }
                if self.retry_count >= self.max_retry {
                    warn!(
                        "supervisor: link lost and retry budget ({}) exhausted",
                        self.max_retry
                    );
                    self.state = SupervisorState::Failed;
                    return SupervisorAction::None;
                }
                self.retry_count += 1;
                self.state = if was_up {
                    SupervisorState::Degraded
                } else {
                    SupervisorState::Connecting
                };
                info!(
                    "supervisor: reconnect attempt {}/{}",
                    self.retry_count, self.max_retry
                );
                SupervisorAction::Connect
            }
        }
    }
}
