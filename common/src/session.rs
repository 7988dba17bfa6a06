//! Local-channel secure session: plaintext JSON provisioning frames, an
//! ECDH + PoP handshake, and AEAD-sealed control frames with a persistent
//! anti-replay window.

use std::sync::Arc;

use log::{info, warn};
use serde::Deserialize;

use crate::crypto::{
    aes256_gcm_open, hkdf_sha256, EcdhKeypair, AEAD_IV_LEN, AEAD_KEY_LEN, AEAD_TAG_LEN,
    P256_POINT_LEN,
};
use crate::error::{Error, Result};
use crate::store::{keys, Store};
use crate::types::{Actor, Command};

/// Frames beyond this are rejected before any parsing.
pub const MAX_FRAME_LEN: usize = 256;

const HKDF_SALT: &[u8] = b"BLE-POP";
const SESSION_KEY_LEN: usize = AEAD_KEY_LEN;

/// Anti-replay state: highest accepted counter plus a 64-bit sliding window.
/// Bit `i` of the window set means counter `C − i` was accepted; bit 0 is the
/// highest accepted counter itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    pub counter: u32,
    pub window: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the acceptance rules and mutates the window on accept.
    pub fn accept(&mut self, ctr: u32) -> bool {
        if ctr > self.counter {
            let delta = ctr - self.counter;
            if delta >= 64 {
                self.window = 1;
            } else {
                self.window = (self.window << delta) | 1;
            }
            self.counter = ctr;
            return true;
        }

        let back = self.counter - ctr;
        if back >= 64 {
            return false;
        }
        let mask = 1u64 << back;
        if self.window & mask != 0 {
            return false;
        }
        self.window |= mask;
        true
    }
}

/// Plaintext provisioning frame, accepted pre-session.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProvisioningFrame {
    pub ssid: String,
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default)]
    pub tz: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HandshakeFrame {
    cmd: String,
    client_pub: String,
    pop: String,
}

#[derive(Debug, Deserialize)]
struct ControlPlaintext {
    ctr: u32,
    #[serde(default)]
    ramp_ms: Option<u32>,
    #[serde(default)]
    light: Option<u32>,
    #[serde(default)]
    pump: Option<u32>,
}

/// What the transport should do with a processed frame.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Valid provisioning frame; the caller applies credentials/timezone and
    /// notifies the arbiter.
    Provisioned(ProvisioningFrame),
    /// Handshake succeeded; the device public key goes back to the peer.
    HandshakeComplete { device_pub: [u8; P256_POINT_LEN] },
    /// Authenticated, replay-checked command, replay state already persisted.
    /// The caller enqueues it.
    Command(Command),
    /// Sealed frame dropped silently (bad tag, replay, malformed plaintext).
    Dropped,
}

/// Device side of the commissioning channel.
///
/// Replay state is persisted on every acceptance and reloaded at
/// construction, so a reboot never re-admits a counter. The session key is
/// ephemeral and dies with the session.
pub struct CommissioningSession {
    store: Arc<Store>,
    session_key: Option<[u8; SESSION_KEY_LEN]>,
    replay: ReplayWindow,
    dropped_frames: u64,
}

impl CommissioningSession {
    /// Creates a session manager with no established key, restoring the
    /// persisted replay window.
    pub fn new(store: Arc<Store>) -> Self {
        let counter = store.load_u32(keys::BLE_PEER_COUNTER).unwrap_or(0);
        let window = store.load_u64(keys::BLE_PEER_WINDOW).unwrap_or(0);
        Self {
            store,
            session_key: None,
            replay: ReplayWindow { counter, window },
            dropped_frames: 0,
        }
    }

    pub fn is_established(&self) -> bool {
        self.session_key.is_some()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Tears the session down (peer disconnect or explicit teardown). The
    /// persisted replay state stays behind.
    pub fn disconnect(&mut self) {
        self.session_key = None;
    }

    /// Single entrypoint for every write to the channel attribute. JSON
    /// frames (first byte `{`) are provisioning or handshake; anything else
    /// is a sealed control frame.
    pub fn handle_frame(&mut self, frame: &[u8], now_utc: i64) -> Result<SessionEvent> {
        if frame.is_empty() {
            return Err(Error::InvalidArgument("empty frame"));
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::InvalidArgument("frame too long"));
        }

        if frame[0] == b'{' {
            return self.handle_json_frame(frame);
        }

        if self.session_key.is_none() {
            // Binary data before a handshake is a malformed handshake attempt.
            return Err(Error::Auth);
        }
        Ok(self.handle_sealed_frame(frame, now_utc))
    }

    fn handle_json_frame(&mut self, frame: &[u8]) -> Result<SessionEvent> {
        let value: serde_json::Value =
            serde_json::from_slice(frame).map_err(|_| Error::InvalidArgument("bad json"))?;

        if value.get("cmd").is_some() {
            let handshake: HandshakeFrame = serde_json::from_value(value)
                .map_err(|_| Error::InvalidArgument("bad handshake"))?;
            return self.handle_handshake(&handshake);
        }

        let frame: ProvisioningFrame =
            serde_json::from_value(value).map_err(|_| Error::InvalidArgument("bad provisioning"))?;
        if frame.ssid.trim().is_empty() {
            return Err(Error::InvalidArgument("ssid"));
        }
        Ok(SessionEvent::Provisioned(frame))
    }

    fn handle_handshake(&mut self, handshake: &HandshakeFrame) -> Result<SessionEvent> {
        if handshake.cmd != "handshake" {
            return Err(Error::InvalidArgument("unknown cmd"));
        }
        if handshake.client_pub.len() != P256_POINT_LEN * 2 {
            return Err(Error::InvalidArgument("client pub length"));
        }
        let peer_pub =
            hex::decode(&handshake.client_pub).map_err(|_| Error::InvalidArgument("client pub hex"))?;

        let keypair = EcdhKeypair::generate();
        let device_pub = *keypair.public_bytes();
        let shared = keypair.shared_secret(&peer_pub)?;

        // Binding the PoP into the KDF ties the session to the printed
        // secret; a passive radio capture of the ECDH alone is useless.
        let derived = hkdf_sha256(HKDF_SALT, &shared, handshake.pop.as_bytes(), SESSION_KEY_LEN)?;
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&derived);
        self.session_key = Some(key);

        self.replay = ReplayWindow::new();
        self.persist_replay()?;

        info!("local channel: secure session established");
        Ok(SessionEvent::HandshakeComplete { device_pub })
    }

    /// Wire layout: `iv[12] ‖ ciphertext ‖ tag[16]`. Failures drop silently.
    fn handle_sealed_frame(&mut self, frame: &[u8], now_utc: i64) -> SessionEvent {
        let Some(key) = self.session_key else {
            return self.drop_frame("no session");
        };
        if frame.len() < AEAD_IV_LEN + AEAD_TAG_LEN {
            return self.drop_frame("frame too short");
        }

        let mut iv = [0u8; AEAD_IV_LEN];
        iv.copy_from_slice(&frame[..AEAD_IV_LEN]);
        let plaintext = match aes256_gcm_open(&key, &iv, &[], &frame[AEAD_IV_LEN..]) {
            Ok(pt) => pt,
            Err(_) => return self.drop_frame("bad tag"),
        };

        let control: ControlPlaintext = match serde_json::from_slice(&plaintext) {
            Ok(control) => control,
            Err(_) => return self.drop_frame("bad plaintext"),
        };

        if !self.replay.accept(control.ctr) {
            return self.drop_frame("replay");
        }
        // Persist before the command becomes visible: a crash here loses a
        // command but never re-admits a counter.
        if self.persist_replay().is_err() {
            return self.drop_frame("replay persist");
        }

        SessionEvent::Command(Command::new(
            Actor::LocalRadio,
            control.ctr,
            now_utc,
            control.light.unwrap_or(0).min(100) as u8,
            control.pump.unwrap_or(0).min(100) as u8,
            control.ramp_ms.unwrap_or(0),
        ))
    }

    fn drop_frame(&mut self, reason: &str) -> SessionEvent {
        self.dropped_frames += 1;
        warn!("local channel: dropping control frame ({reason})");
        SessionEvent::Dropped
    }

    fn persist_replay(&self) -> Result<()> {
        self.store
            .save_u32(keys::BLE_PEER_COUNTER, self.replay.counter)?;
        self.store.save_u64(keys::BLE_PEER_WINDOW, self.replay.window)
    }

    #[cfg(test)]
    fn install_key_for_tests(&mut self, key: [u8; SESSION_KEY_LEN]) {
        self.session_key = Some(key);
    }

    #[cfg(test)]
    fn session_key_for_tests(&self) -> Option<[u8; SESSION_KEY_LEN]> {
        self.session_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes256_gcm_seal;
    use crate::store::MemoryBackend;

    fn fresh_store() -> Arc<Store> {
        Arc::new(Store::new(Box::new(MemoryBackend::new())))
    }

    /// Commissioner half of the handshake, as a phone app would run it.
    struct TestClient {
        keypair: Option<EcdhKeypair>,
        public_hex: String,
        key: Option<[u8; 32]>,
        pop: String,
    }

    impl TestClient {
        fn new(pop: &str) -> Self {
            let keypair = EcdhKeypair::generate();
            let public_hex = hex::encode(keypair.public_bytes());
            Self {
                keypair: Some(keypair),
                public_hex,
                key: None,
                pop: pop.to_string(),
            }
        }

        fn handshake_frame(&self) -> Vec<u8> {
            serde_json::to_vec(&serde_json::json!({
                "cmd": "handshake",
                "client_pub": self.public_hex,
                "pop": self.pop,
            }))
            .unwrap()
        }

        fn complete(&mut self, device_pub: &[u8]) {
            let shared = self
                .keypair
                .take()
                .unwrap()
                .shared_secret(device_pub)
                .unwrap();
            let derived = hkdf_sha256(HKDF_SALT, &shared, self.pop.as_bytes(), 32).unwrap();
            let mut key = [0u8; 32];
            key.copy_from_slice(&derived);
            self.key = Some(key);
        }

        fn seal_control(&self, ctr: u32, light: u32, pump: u32, iv_seed: u8) -> Vec<u8> {
            let plaintext = serde_json::to_vec(&serde_json::json!({
                "ctr": ctr,
                "ramp_ms": 250,
                "light": light,
                "pump": pump,
            }))
            .unwrap();
            let iv = [iv_seed; 12];
            let sealed = aes256_gcm_seal(self.key.as_ref().unwrap(), &iv, &[], &plaintext).unwrap();
            let mut frame = iv.to_vec();
            frame.extend_from_slice(&sealed);
            frame
        }
    }

    fn establish(session: &mut CommissioningSession, client: &mut TestClient) {
        let event = session.handle_frame(&client.handshake_frame(), 0).unwrap();
        let SessionEvent::HandshakeComplete { device_pub } = event else {
            panic!("expected handshake completion");
        };
        client.complete(&device_pub);
    }

    #[test]
    fn replay_window_acceptance_table() {
        // (counter, window, incoming) -> (accept?, counter', window')
        let cases: &[(u32, u64, u32, bool, u32, u64)] = &[
            (0, 0, 1, true, 1, 0b1),
            (1, 0b1, 1, false, 1, 0b1),
            (5, 0b1, 3, true, 5, 0b101),
            (5, 0b1, 1, true, 5, 0b10001),
            (100, 0b1, 30, false, 100, 0b1),
            (5, 0b1, 80, true, 80, 0b1),
            (5, 0b1, 7, true, 7, 0b101),
        ];
        for &(counter, window, incoming, accept, counter_after, window_after) in cases {
            let mut w = ReplayWindow { counter, window };
            assert_eq!(
                w.accept(incoming),
                accept,
                "incoming {incoming} on ({counter}, {window:#b})"
            );
            assert_eq!((w.counter, w.window), (counter_after, window_after));
        }
    }

    #[test]
    fn both_sides_derive_the_same_key_and_roundtrip_a_frame() {
        let mut session = CommissioningSession::new(fresh_store());
        let mut client = TestClient::new("pop-1234");
        establish(&mut session, &mut client);

        assert_eq!(session.session_key_for_tests().unwrap(), client.key.unwrap());

        let event = session
            .handle_frame(&client.seal_control(1, 100, 40, 1), 1_000)
            .unwrap();
        let SessionEvent::Command(cmd) = event else {
            panic!("expected command");
        };
        assert_eq!(cmd.actor, Actor::LocalRadio);
        assert_eq!(cmd.seq, 1);
        assert_eq!(cmd.light_pct, 100);
        assert_eq!(cmd.pump_pct, 40);
        assert_eq!(cmd.ramp_ms, 250);
    }

    #[test]
    fn different_pop_yields_undecryptable_frames() {
        let mut session = CommissioningSession::new(fresh_store());
        let mut client = TestClient::new("right-pop");
        establish(&mut session, &mut client);

        // The peer mis-derives with the wrong PoP: frames fail the tag check
        // and are dropped silently.
        let mut wrong = TestClient::new("wrong-pop");
        wrong.key = Some([0x42; 32]);
        let event = session
            .handle_frame(&wrong.seal_control(1, 10, 10, 9), 0)
            .unwrap();
        assert_eq!(event, SessionEvent::Dropped);
        assert_eq!(session.dropped_frames(), 1);
    }

    #[test]
    fn repeated_counter_is_dropped() {
        let mut session = CommissioningSession::new(fresh_store());
        let mut client = TestClient::new("pop");
        establish(&mut session, &mut client);

        let frame = client.seal_control(5, 50, 0, 2);
        assert!(matches!(
            session.handle_frame(&frame, 0).unwrap(),
            SessionEvent::Command(_)
        ));
        assert_eq!(session.handle_frame(&frame, 0).unwrap(), SessionEvent::Dropped);
    }

    #[test]
    fn replay_state_survives_a_power_cycle() {
        let store = fresh_store();
        let mut client = TestClient::new("pop");
        let frame = {
            let mut session = CommissioningSession::new(store.clone());
            establish(&mut session, &mut client);
            let frame = client.seal_control(5, 60, 0, 3);
            assert!(matches!(
                session.handle_frame(&frame, 0).unwrap(),
                SessionEvent::Command(_)
            ));
            frame
        };

        // The persisted window is reloaded on boot.
        assert_eq!(store.load_u32(keys::BLE_PEER_COUNTER).unwrap(), 5);
        assert_eq!(store.load_u64(keys::BLE_PEER_WINDOW).unwrap(), 1);

        // A replayed frame with no session is a failed handshake attempt.
        let mut rebooted = CommissioningSession::new(store.clone());
        assert!(rebooted.handle_frame(&frame, 0).is_err());

        // Even if the old session key leaked back in, the counter stays
        // burned.
        rebooted.install_key_for_tests(client.key.unwrap());
        assert_eq!(rebooted.handle_frame(&frame, 0).unwrap(), SessionEvent::Dropped);
    }

    #[test]
    fn handshake_resets_the_window_and_persists_it() {
        let store = fresh_store();
        let mut session = CommissioningSession::new(store.clone());
        let mut client = TestClient::new("pop");
        establish(&mut session, &mut client);

        let frame = client.seal_control(40, 0, 0, 4);
        assert!(matches!(
            session.handle_frame(&frame, 0).unwrap(),
            SessionEvent::Command(_)
        ));
        assert_eq!(store.load_u32(keys::BLE_PEER_COUNTER).unwrap(), 40);

        let mut second = TestClient::new("pop");
        establish(&mut session, &mut second);
        assert_eq!(store.load_u32(keys::BLE_PEER_COUNTER).unwrap(), 0);
        assert_eq!(store.load_u64(keys::BLE_PEER_WINDOW).unwrap(), 0);
    }

    #[test]
    fn provisioning_frame_is_parsed_and_validated() {
        let mut session = CommissioningSession::new(fresh_store());
        let event = session
            .handle_frame(br#"{"ssid":"Lab","psk":"secret","tz":"UTC"}"#, 0)
            .unwrap();
        assert_eq!(
            event,
            SessionEvent::Provisioned(ProvisioningFrame {
                ssid: "Lab".into(),
                psk: Some("secret".into()),
                tz: Some("UTC".into()),
            })
        );

        assert!(session.handle_frame(br#"{"ssid":""}"#, 0).is_err());
    }

    #[test]
    fn frame_length_limits_are_enforced() {
        let mut session = CommissioningSession::new(fresh_store());
        assert!(session.handle_frame(&[], 0).is_err());
        assert!(session.handle_frame(&vec![0u8; MAX_FRAME_LEN + 1], 0).is_err());
    }

    #[test]
    fn out_of_range_percent_is_clamped() {
        let mut session = CommissioningSession::new(fresh_store());
        let mut client = TestClient::new("pop");
        establish(&mut session, &mut client);

        let event = session
            .handle_frame(&client.seal_control(1, 400, 7, 5), 0)
            .unwrap();
        let SessionEvent::Command(cmd) = event else {
            panic!("expected command");
        };
        assert_eq!(cmd.light_pct, 100);
        assert_eq!(cmd.pump_pct, 7);
    }
}
