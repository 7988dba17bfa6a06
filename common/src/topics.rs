//! Cloud topic construction. The jobs and shadow topics follow the AWS IoT
//! reserved namespace; telemetry topics are deployment-configurable and these
//! are only the defaults.

pub const TOPIC_HEARTBEAT: &str = "grow/telemetry/heartbeat";
pub const TOPIC_AUDIT: &str = "grow/telemetry/audit";

/// Job notifications for this device: `$aws/things/<id>/jobs/+/notify-next`.
pub fn jobs_notify_next(device: &str) -> String {
    format!("$aws/things/{device}/jobs/+/notify-next")
}

/// Shadow update publish topic for this device.
pub fn shadow_update(device: &str) -> String {
    format!("$aws/things/{device}/shadow/update")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_embed_the_device_name() {
        assert_eq!(
            jobs_notify_next("grow-0001"),
            "$aws/things/grow-0001/jobs/+/notify-next"
        );
        assert_eq!(
            shadow_update("grow-0001"),
            "$aws/things/grow-0001/shadow/update"
        );
    }
}
