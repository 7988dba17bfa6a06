use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Logical origin of a command. Determines audit attribution and whether the
/// command takes the urgent path through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Unknown,
    LocalRadio,
    Schedule,
    Safety,
    Cloud,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::LocalRadio => "local_radio",
            Self::Schedule => "schedule",
            Self::Safety => "safety",
            Self::Cloud => "cloud",
        }
    }
}

/// Immutable actuator command record. Percent fields are clamped at
/// construction; a ramp of 0 means a hard transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub actor: Actor,
    pub seq: u32,
    pub ts_utc: i64,
    pub light_pct: u8,
    pub pump_pct: u8,
    pub ramp_ms: u32,
}

impl Command {
    pub fn new(
        actor: Actor,
        seq: u32,
        ts_utc: i64,
        light_pct: u8,
        pump_pct: u8,
        ramp_ms: u32,
    ) -> Self {
        Self {
            actor,
            seq,
            ts_utc,
            light_pct: light_pct.min(100),
            pump_pct: pump_pct.min(100),
            ramp_ms,
        }
    }

    pub fn is_urgent(&self) -> bool {
        self.actor == Actor::Safety
    }
}

/// Last-applied actuator duty, written only by the control pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub light_pct: u8,
    pub pump_pct: u8,
    #[serde(rename = "appliedAtMs")]
    pub applied_at_ms: u64,
}

/// Mutex-protected snapshot of the last applied state. The pipeline is the
/// single writer; everyone else reads.
#[derive(Clone, Default)]
pub struct SharedActuatorState {
    inner: Arc<Mutex<ActuatorState>>,
}

impl SharedActuatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ActuatorState {
        *self.inner.lock().unwrap()
    }

    pub fn set(&self, state: ActuatorState) {
        *self.inner.lock().unwrap() = state;
    }
}

/// Six-byte device identifier (typically the station MAC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub [u8; 6]);

impl DeviceId {
    /// Hex form of the full identifier, e.g. `a4cf12451e30`.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short advertised name: the configured prefix plus the last three bytes
    /// of the identifier in hex.
    pub fn short_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, hex::encode(&self.0[3..]))
    }
}

/// Outcome of the most recent firmware update attempt, reported through the
/// cloud shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    Idle,
    Applied,
    Reverted,
    Failed,
}

impl UpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Applied => "APPLIED",
            Self::Reverted => "REVERTED",
            Self::Failed => "FAILED",
        }
    }
}

/// Long-lived state published in the cloud shadow `reported` block.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowReported {
    #[serde(rename = "lightPct")]
    pub light_pct: u8,
    #[serde(rename = "pumpPct")]
    pub pump_pct: u8,
    #[serde(rename = "firmwareVersion")]
    pub firmware_version: u32,
    #[serde(rename = "lastUpdateStatus")]
    pub last_update_status: UpdateStatus,
    #[serde(rename = "lastCommissionedUtc", skip_serializing_if = "Option::is_none")]
    pub last_commissioned_utc: Option<i64>,
}

impl ShadowReported {
    /// Wraps the reported block in the shadow update envelope.
    pub fn to_update_document(&self) -> serde_json::Value {
        serde_json::json!({ "state": { "reported": self } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_clamps_percent_fields() {
        let cmd = Command::new(Actor::Cloud, 1, 0, 150, 200, 0);
        assert_eq!(cmd.light_pct, 100);
        assert_eq!(cmd.pump_pct, 100);
    }

    #[test]
    fn short_name_uses_last_three_bytes() {
        let id = DeviceId([0xa4, 0xcf, 0x12, 0x45, 0x1e, 0x30]);
        assert_eq!(id.short_name("GROW"), "GROW-451e30");
        assert_eq!(id.hex(), "a4cf12451e30");
    }

    #[test]
    fn shadow_document_nests_reported_block() {
        let shadow = ShadowReported {
            light_pct: 100,
            pump_pct: 40,
            firmware_version: 4,
            last_update_status: UpdateStatus::Applied,
            last_commissioned_utc: None,
        };
        let doc = shadow.to_update_document();
        assert_eq!(doc["state"]["reported"]["lightPct"], 100);
        assert_eq!(doc["state"]["reported"]["lastUpdateStatus"], "APPLIED");
    }
}
