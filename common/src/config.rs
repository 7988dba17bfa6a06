use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleConfig;

/// Pump duty-cycle parameters, superimposed on the light schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpCycleConfig {
    /// Minutes the pump runs at the start of each cycle.
    pub on_minutes: u32,
    /// Full cycle period in minutes. Clamped up to at least `on_minutes`.
    pub period_minutes: u32,
    /// Duty percent while the pump is on.
    pub intensity_pct: u8,
}

impl Default for PumpCycleConfig {
    fn default() -> Self {
        Self {
            on_minutes: 5,
            period_minutes: 30,
            intensity_pct: 60,
        }
    }
}

impl PumpCycleConfig {
    pub fn sanitize(&mut self) {
        if self.on_minutes == 0 {
            self.on_minutes = 1;
        }
        if self.period_minutes < self.on_minutes {
            self.period_minutes = self.on_minutes;
        }
        self.intensity_pct = self.intensity_pct.min(100);
    }
}

/// Wi-Fi station credentials, stored under [`crate::store::keys::WIFI_CREDS`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub psk: String,
}

impl WifiCredentials {
    pub fn is_valid(&self) -> bool {
        let ssid = self.ssid.trim();
        !ssid.is_empty() && ssid.len() <= 32 && self.psk.len() <= 64
    }
}

/// Device-provisioned configuration. These are compile-time or first-boot
/// values; nothing here changes at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Cloud endpoint host name.
    pub cloud_endpoint: String,
    /// Thing name / MQTT client identity.
    pub device_name: String,
    /// Advertised name prefix for the local channel.
    pub adv_name_prefix: String,
    pub heartbeat_interval_s: u32,
    /// Seconds after boot before the local channel opens when the cloud path
    /// is not up.
    pub ble_fallback_s: u32,
    /// Minutes of continuous Wi-Fi before the local channel closes.
    pub wifi_stable_min: u32,
    /// Seconds after provisioning before the local channel re-opens if Wi-Fi
    /// never came up.
    pub reprovision_window_s: u32,
    pub wifi_max_retry: u32,
    /// Light duty applied when the schedule says "on".
    pub schedule_light_on_pct: u8,
    pub schedule: ScheduleConfig,
    pub pump: PumpCycleConfig,
    pub pwm_freq_hz: u32,
    pub light_gpio: i32,
    pub pump_gpio: i32,
    /// Accept the legacy `{jobId, ota_url, signature}` cloud-job shape.
    /// Off by default; the manifest path is the enforced invariant.
    #[serde(default)]
    pub accept_legacy_jobs: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cloud_endpoint: "example-ats.iot.us-east-1.amazonaws.com".to_string(),
            device_name: "grow-controller".to_string(),
            adv_name_prefix: "GROW".to_string(),
            heartbeat_interval_s: 60,
            ble_fallback_s: 60,
            wifi_stable_min: 5,
            reprovision_window_s: 180,
            wifi_max_retry: 6,
            schedule_light_on_pct: 100,
            schedule: ScheduleConfig::default(),
            pump: PumpCycleConfig::default(),
            pwm_freq_hz: 5_000,
            light_gpio: 18,
            pump_gpio: 19,
            accept_legacy_jobs: false,
        }
    }
}
