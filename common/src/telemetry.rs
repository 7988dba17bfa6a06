use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::schedule::NextEvents;

/// Bounded audit queue depth.
pub const AUDIT_QUEUE_LEN: usize = 16;
/// Audit lines longer than this are cut and marked.
pub const MAX_AUDIT_LINE: usize = 256;
const TRUNCATION_MARK: &str = "...";

/// Periodic heartbeat payload. Emitted only while the cloud session is up;
/// optional fields are omitted when the platform cannot supply them.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub ts: i64,
    pub uptime_s: u64,
    pub reset_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_free_heap: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<i8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_on_utc: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_off_utc: Option<i64>,
}

impl Heartbeat {
    pub fn new(ts: i64, uptime_s: u64, reset_reason: impl Into<String>) -> Self {
        Self {
            ts,
            uptime_s,
            reset_reason: reset_reason.into(),
            min_free_heap: None,
            wifi_rssi: None,
            next_on_utc: None,
            next_off_utc: None,
        }
    }

    pub fn with_next_events(mut self, next: NextEvents) -> Self {
        self.next_on_utc = Some(next.next_on_utc);
        self.next_off_utc = Some(next.next_off_utc);
        self
    }
}

/// Producer half of the audit stream. Cheap to clone into every component.
#[derive(Clone)]
pub struct AuditSender {
    tx: SyncSender<String>,
}

impl AuditSender {
    /// Queues one audit line. Oversized lines are truncated and marked;
    /// a full queue surfaces as [`Error::Timeout`] to the caller.
    pub fn send(&self, mut line: String) -> Result<()> {
        if line.len() > MAX_AUDIT_LINE {
            let cut = MAX_AUDIT_LINE - TRUNCATION_MARK.len();
            // Back off to a character boundary before cutting.
            let mut end = cut;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            line.truncate(end);
            line.push_str(TRUNCATION_MARK);
        }
        match self.tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Timeout),
            Err(TrySendError::Disconnected(_)) => Err(Error::Backend("audit drained".into())),
        }
    }
}

/// Consumer half: exactly one drainer owns this.
pub struct AuditReceiver {
    rx: Receiver<String>,
}

impl AuditReceiver {
    /// Waits up to `timeout` for the next line; `None` on a quiet queue.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Builds the bounded MPSC audit channel.
pub fn audit_channel() -> (AuditSender, AuditReceiver) {
    let (tx, rx) = sync_channel(AUDIT_QUEUE_LEN);
    (AuditSender { tx }, AuditReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_lines_flow_through() {
        let (tx, rx) = audit_channel();
        tx.send("boot complete".into()).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)).as_deref(),
            Some("boot complete")
        );
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn full_queue_reports_timeout() {
        let (tx, _rx) = audit_channel();
        for i in 0..AUDIT_QUEUE_LEN {
            tx.send(format!("line {i}")).unwrap();
        }
        assert!(matches!(tx.send("overflow".into()), Err(Error::Timeout)));
    }

    #[test]
    fn oversized_lines_are_truncated_and_marked() {
        let (tx, rx) = audit_channel();
        tx.send("x".repeat(400)).unwrap();
        let line = rx.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(line.len(), MAX_AUDIT_LINE);
        assert!(line.ends_with(TRUNCATION_MARK));
    }

    #[test]
    fn heartbeat_serializes_only_known_fields() {
        let hb = Heartbeat::new(1000, 60, "POWERON").with_next_events(NextEvents {
            next_on_utc: 7 * 3600,
            next_off_utc: 21 * 3600,
        });
        let json = serde_json::to_value(&hb).unwrap();
        assert_eq!(json["uptime_s"], 60);
        assert_eq!(json["next_on_utc"], 7 * 3600);
        assert!(json.get("wifi_rssi").is_none());
    }
}
