//! Commissioning arbiter: the timer-driven state machine that owns the
//! `LOCAL_CHANNEL_ACTIVE` bit. It never touches the radio; the local-channel
//! server watches the bit and starts or stops advertising accordingly.

use log::info;

use crate::links::{LinkState, LOCAL_CHANNEL_ACTIVE, TIME_SYNCED, WIFI_UP};

#[derive(Debug, Clone, Copy)]
pub struct ArbiterConfig {
    /// Delay after boot before the channel opens when the cloud path is not
    /// fully up.
    pub ble_fallback_ms: u64,
    /// Continuous Wi-Fi uptime after which the channel closes.
    pub wifi_stable_ms: u64,
    /// Delay after a provisioning event before the channel re-opens if Wi-Fi
    /// never came up.
    pub reprovision_ms: u64,
}

impl ArbiterConfig {
    pub fn from_seconds(ble_fallback_s: u32, wifi_stable_min: u32, reprovision_s: u32) -> Self {
        Self {
            ble_fallback_ms: u64::from(ble_fallback_s) * 1_000,
            wifi_stable_ms: u64::from(wifi_stable_min) * 60_000,
            reprovision_ms: u64::from(reprovision_s) * 1_000,
        }
    }
}

pub struct CommissioningArbiter {
    cfg: ArbiterConfig,
    boot_ms: u64,
    opened_once: bool,
    provisioned_at_ms: Option<u64>,
}

impl CommissioningArbiter {
    pub fn new(cfg: ArbiterConfig, boot_ms: u64) -> Self {
        Self {
            cfg,
            boot_ms,
            opened_once: false,
            provisioned_at_ms: None,
        }
    }

    /// Fast path when the supervisor found no stored credentials at boot:
    /// commissioning is the only way forward, so the window opens at once.
    pub fn note_missing_credentials(&mut self, links: &LinkState) {
        self.open(links, "no stored credentials");
    }

    /// Called when a provisioning frame was accepted. Closes the channel and
    /// arms the re-open window in case Wi-Fi never comes up.
    pub fn note_provisioned(&mut self, now_ms: u64, links: &LinkState) {
        self.provisioned_at_ms = Some(now_ms);
        if links.is_set(LOCAL_CHANNEL_ACTIVE) {
            info!("arbiter: provisioning received, closing local channel");
            links.clear(LOCAL_CHANNEL_ACTIVE);
        }
    }

    /// Periodic evaluation of the timing windows. `wifi_up_since_ms` is the
    /// supervisor's stability anchor.
    pub fn tick(&mut self, now_ms: u64, links: &LinkState, wifi_up_since_ms: Option<u64>) {
        let bits = links.get();
        let wifi_up = bits & WIFI_UP != 0;
        let time_synced = bits & TIME_SYNCED != 0;
        let channel_open = bits & LOCAL_CHANNEL_ACTIVE != 0;

        // Boot fallback: one-shot opening when the cloud path did not come up
        // on its own.
        if !self.opened_once
            && now_ms.saturating_sub(self.boot_ms) >= self.cfg.ble_fallback_ms
            && (!wifi_up || !time_synced)
        {
            self.open(links, "cloud path not up after boot fallback window");
            return;
        }

        // Stability: Wi-Fi held long enough closes the window.
        if channel_open {
            if let Some(up_since) = wifi_up_since_ms {
                if wifi_up && now_ms.saturating_sub(up_since) >= self.cfg.wifi_stable_ms {
                    info!("arbiter: wifi stable, closing local channel");
                    links.clear(LOCAL_CHANNEL_ACTIVE);
                    return;
                }
            }
        }

        // Post-provisioning re-open: credentials were delivered but the link
        // never materialized.
        if !channel_open {
            if let Some(provisioned) = self.provisioned_at_ms {
                if !wifi_up && now_ms.saturating_sub(provisioned) >= self.cfg.reprovision_ms {
                    self.open(links, "wifi never came up after provisioning");
                }
            }
        }
    }

    fn open(&mut self, links: &LinkState, reason: &str) {
        if !links.is_set(LOCAL_CHANNEL_ACTIVE) {
            info!("arbiter: opening local channel ({reason})");
        }
        self.opened_once = true;
        links.set(LOCAL_CHANNEL_ACTIVE);
    }
}
