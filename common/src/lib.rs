pub mod arbiter;
pub mod config;
pub mod crypto;
pub mod error;
pub mod links;
pub mod manifest;
pub mod pipeline;
pub mod schedule;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod topics;
pub mod trust;
pub mod types;
pub mod update;

#[cfg(test)]
mod scenarios;

pub use arbiter::{ArbiterConfig, CommissioningArbiter};
pub use config::{DeviceConfig, PumpCycleConfig, WifiCredentials};
pub use error::{Error, Result};
pub use links::LinkState;
pub use manifest::Manifest;
pub use pipeline::{
    safety_shutdown, ActuatorDriver, CommandQueue, ControlPipeline, NullWatchdog, WatchdogFeed,
};
pub use schedule::{NextEvents, ScheduleConfig, ScheduleEngine};
pub use session::{CommissioningSession, ProvisioningFrame, ReplayWindow, SessionEvent};
pub use store::{MemoryBackend, Store, StoreBackend};
pub use supervisor::{NetworkSupervisor, SupervisorAction, SupervisorState, WifiEvent};
pub use telemetry::{audit_channel, AuditReceiver, AuditSender, Heartbeat};
pub use trust::TrustRoot;
pub use types::{
    Actor, ActuatorState, Command, DeviceId, ShadowReported, SharedActuatorState, UpdateStatus,
};
pub use update::{decode_job_document, ImageFetcher, ImageSlot, JobDecision, UpdateError, UpdatePipeline};
