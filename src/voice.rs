//! Per-guild voice sessions.
//!
//! Joining a voice channel takes two sockets. On the main gateway we send
//! op 4 and wait for our own `VOICE_STATE_UPDATE` (session id) and the
//! guild's `VOICE_SERVER_UPDATE` (token + endpoint). With those we open the
//! voice signalling socket, identify, and wait for HELLO and READY. A spawned
//! keep-alive task then heartbeats that socket for as long as we stay.
//!
//! No audio is ever sent, so protocol selection and the UDP transport are
//! never started.
//!
//! When the voice socket closes without us asking (kick, channel deleted,
//! server timeout) the keep-alive task reports a [`VoiceDrop`]; the bot loop
//! decides whether it still refers to the current session.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::VoiceFlags;
use crate::error::{GatewayError, VoiceError};
use crate::events::VoiceSignal;
use crate::gateway::GatewaySender;
use crate::types::*;

/// Budget for op 4 → credentials, and again for the voice handshake.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Unacknowledged heartbeats tolerated before the socket counts as dead.
const MAX_MISSED_ACKS: u32 = 2;

/// The voice operations the controller needs.
#[async_trait]
pub trait VoiceBackend: Send {
    /// Whether we hold a voice session in `guild_id`.
    fn is_connected(&self, guild_id: &str) -> bool;

    /// Join `channel_id` and block until the voice session is up.
    async fn connect(&mut self, guild_id: &str, channel_id: &str) -> Result<(), VoiceError>;

    /// Leave the guild's voice channel. `force` skips the close handshake.
    /// A guild without a session is a no-op.
    async fn disconnect(&mut self, guild_id: &str, force: bool) -> Result<(), VoiceError>;

    /// Update self mute / deafen while staying in `channel_id`.
    async fn set_state(
        &mut self,
        guild_id: &str,
        channel_id: &str,
        flags: VoiceFlags,
    ) -> Result<(), VoiceError>;

    /// Forget the session named by `notice` if it is still the current one.
    /// Returns `false` for drops from sessions already replaced or closed.
    fn forget_dropped(&mut self, notice: &VoiceDrop) -> bool;
}

/// A voice socket that closed on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceDrop {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
    pub serial: u64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Credential collection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct VoiceCredentials {
    session_id: String,
    token: String,
    endpoint: String,
}

/// Collects the two dispatches a join waits for.
#[derive(Debug)]
struct PendingJoin<'a> {
    guild_id: &'a str,
    channel_id: &'a str,
    user_id: &'a str,
    session_id: Option<String>,
    server: Option<(String, String)>,
}

impl<'a> PendingJoin<'a> {
    fn new(guild_id: &'a str, channel_id: &'a str, user_id: &'a str) -> Self {
        Self {
            guild_id,
            channel_id,
            user_id,
            session_id: None,
            server: None,
        }
    }

    /// Feed one signal; returns the credentials once both halves arrived.
    fn offer(&mut self, signal: VoiceSignal) -> Option<VoiceCredentials> {
        match signal {
            VoiceSignal::State(state) => {
                let ours = state.user_id == self.user_id
                    && state.guild_id.as_deref() == Some(self.guild_id)
                    && state.channel_id.as_deref() == Some(self.channel_id);
                if ours {
                    self.session_id = Some(state.session_id);
                }
            }
            VoiceSignal::Server(server) if server.guild_id == self.guild_id => {
                // A null endpoint means "server going away, wait for the next".
                self.server = server.endpoint.map(|endpoint| (server.token, endpoint));
            }
            VoiceSignal::Server(_) => {}
        }

        let session_id = self.session_id.as_ref()?;
        let (token, endpoint) = self.server.as_ref()?;
        Some(VoiceCredentials {
            session_id: session_id.clone(),
            token: token.clone(),
            endpoint: endpoint.clone(),
        })
    }
}

async fn await_credentials(
    signals: &mut broadcast::Receiver<VoiceSignal>,
    pending: &mut PendingJoin<'_>,
) -> Result<VoiceCredentials, VoiceError> {
    loop {
        match signals.recv().await {
            Ok(signal) => {
                if let Some(creds) = pending.offer(signal) {
                    return Ok(creds);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "voice signal receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(VoiceError::Gateway(GatewayError::Closed));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Voice signalling socket
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn voice_url(endpoint: &str) -> String {
    let host = endpoint
        .trim_start_matches("wss://")
        .trim_end_matches('/');
    format!("wss://{host}/?v=4")
}

/// Identify on the voice socket and wait for HELLO + READY.
/// Returns the socket and its heartbeat period.
async fn open_voice_socket(
    creds: &VoiceCredentials,
    guild_id: &str,
    user_id: &str,
) -> Result<(WsStream, Duration), VoiceError> {
    let url = voice_url(&creds.endpoint);
    debug!(url = %url, "opening voice socket");
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

    let identify = VoiceOutbound {
        op: VoiceOp::Identify,
        d: VoiceIdentify {
            server_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            session_id: creds.session_id.clone(),
            token: creds.token.clone(),
        },
    };
    ws.send(WsMessage::Text(serde_json::to_string(&identify)?.into()))
        .await?;

    let mut heartbeat = None;
    let mut ready = false;
    while heartbeat.is_none() || !ready {
        let frame = ws
            .next()
            .await
            .ok_or_else(|| VoiceError::Signalling("voice socket ended during handshake".into()))??;
        match frame {
            WsMessage::Text(text) => {
                let payload: VoicePayload = serde_json::from_str(text.as_str())?;
                match payload.op {
                    voice_op::HELLO => {
                        heartbeat = payload
                            .d
                            .get("heartbeat_interval")
                            .and_then(|v| v.as_f64())
                            .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok());
                        if heartbeat.is_none() {
                            return Err(VoiceError::Signalling(
                                "HELLO missing heartbeat_interval".into(),
                            ));
                        }
                    }
                    voice_op::READY => ready = true,
                    op => debug!(op, "ignoring voice op during handshake"),
                }
            }
            WsMessage::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code));
                return Err(VoiceError::Signalling(format!(
                    "voice socket closed during handshake (code {code:?})"
                )));
            }
            _ => {}
        }
    }

    let period = heartbeat.unwrap_or(Duration::from_secs(5));
    Ok((ws, period))
}

/// Heartbeat the voice socket until told to close or the socket dies.
async fn keep_alive(
    mut ws: WsStream,
    period: Duration,
    mut close: oneshot::Receiver<()>,
    drops: mpsc::UnboundedSender<VoiceDrop>,
    mut notice: VoiceDrop,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed = 0u32;

    let reason = loop {
        tokio::select! {
            _ = &mut close => {
                let _ = tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, ws.close(None)).await;
                debug!(guild_id = %notice.guild_id, "voice socket closed on request");
                return;
            }

            _ = ticker.tick() => {
                if missed >= MAX_MISSED_ACKS {
                    break "voice heartbeat not acknowledged".to_string();
                }
                let nonce = chrono::Utc::now().timestamp_millis();
                let beat = VoiceOutbound { op: VoiceOp::Heartbeat, d: nonce };
                let sent = match serde_json::to_string(&beat) {
                    Ok(text) => ws.send(WsMessage::Text(text.into())).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = sent {
                    break format!("voice heartbeat failed: {e}");
                }
                missed += 1;
            }

            frame = ws.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<VoicePayload>(text.as_str()) {
                        Ok(payload) if payload.op == voice_op::HEARTBEAT_ACK => missed = 0,
                        Ok(payload) => debug!(op = payload.op, "voice op ignored"),
                        Err(e) => debug!(error = %e, "unparseable voice payload"),
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break match frame {
                        Some(f) => format!("voice socket closed by server (code {}): {}", u16::from(f.code), f.reason.as_str()),
                        None => "voice socket closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("voice socket error: {e}"),
                None => break "voice socket ended".to_string(),
            },
        }
    };

    notice.reason = reason;
    let _ = drops.send(notice);
}

// ---------------------------------------------------------------------------
// VoiceManager
// ---------------------------------------------------------------------------

struct ActiveVoice {
    channel_id: Snowflake,
    serial: u64,
    close: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// The live [`VoiceBackend`]: one voice session per guild over the gateway.
pub struct VoiceManager {
    gateway: GatewaySender,
    user_id: Option<Snowflake>,
    sessions: HashMap<Snowflake, ActiveVoice>,
    next_serial: u64,
    drops: mpsc::UnboundedSender<VoiceDrop>,
}

impl VoiceManager {
    /// Also returns the receiver the bot loop drains for [`VoiceDrop`]s.
    pub fn new(gateway: GatewaySender) -> (Self, mpsc::UnboundedReceiver<VoiceDrop>) {
        let (drops, drop_rx) = mpsc::unbounded_channel();
        let manager = Self {
            gateway,
            user_id: None,
            sessions: HashMap::new(),
            next_serial: 0,
            drops,
        };
        (manager, drop_rx)
    }

    /// Our own user id, learned from READY; voice identify needs it.
    pub fn set_user_id(&mut self, user_id: impl Into<Snowflake>) {
        self.user_id = Some(user_id.into());
    }

    async fn leave_gateway_channel(&self, guild_id: &str) -> Result<(), VoiceError> {
        self.gateway
            .update_voice_state(UpdateVoiceState {
                guild_id: guild_id.to_string(),
                channel_id: None,
                self_mute: false,
                self_deaf: false,
            })
            .await?;
        Ok(())
    }

    async fn establish(
        &mut self,
        signals: &mut broadcast::Receiver<VoiceSignal>,
        guild_id: &str,
        channel_id: &str,
        user_id: &str,
    ) -> Result<ActiveVoice, VoiceError> {
        let mut pending = PendingJoin::new(guild_id, channel_id, user_id);
        let creds = tokio::time::timeout(SIGNAL_TIMEOUT, await_credentials(signals, &mut pending))
            .await
            .map_err(|_| VoiceError::Timeout("voice state and server updates"))??;

        let (ws, period) = tokio::time::timeout(
            SIGNAL_TIMEOUT,
            open_voice_socket(&creds, guild_id, user_id),
        )
        .await
        .map_err(|_| VoiceError::Timeout("voice socket handshake"))??;

        self.next_serial += 1;
        let serial = self.next_serial;
        let (close_tx, close_rx) = oneshot::channel();
        let template = VoiceDrop {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
            serial,
            reason: String::new(),
        };
        let task = tokio::spawn(keep_alive(ws, period, close_rx, self.drops.clone(), template));

        Ok(ActiveVoice {
            channel_id: channel_id.to_string(),
            serial,
            close: Some(close_tx),
            task,
        })
    }
}

#[async_trait]
impl VoiceBackend for VoiceManager {
    fn is_connected(&self, guild_id: &str) -> bool {
        self.sessions.contains_key(guild_id)
    }

    async fn connect(&mut self, guild_id: &str, channel_id: &str) -> Result<(), VoiceError> {
        let user_id = self.user_id.clone().ok_or(VoiceError::NotReady)?;

        // Subscribe before asking so neither dispatch can slip past.
        let mut signals = self.gateway.subscribe_voice();
        self.gateway
            .update_voice_state(UpdateVoiceState {
                guild_id: guild_id.to_string(),
                channel_id: Some(channel_id.to_string()),
                self_mute: false,
                self_deaf: false,
            })
            .await?;

        match self
            .establish(&mut signals, guild_id, channel_id, &user_id)
            .await
        {
            Ok(session) => {
                info!(guild_id, channel_id, serial = session.serial, "voice session established");
                self.sessions.insert(guild_id.to_string(), session);
                Ok(())
            }
            Err(e) => {
                // Don't leave a half-joined membership behind.
                if let Err(rollback) = self.leave_gateway_channel(guild_id).await {
                    warn!(guild_id, error = %rollback, "failed to roll back voice join");
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self, guild_id: &str, force: bool) -> Result<(), VoiceError> {
        let Some(mut session) = self.sessions.remove(guild_id) else {
            return Ok(());
        };

        if force {
            session.task.abort();
        } else {
            if let Some(close) = session.close.take() {
                let _ = close.send(());
            }
            if tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, &mut session.task)
                .await
                .is_err()
            {
                session.task.abort();
            }
        }
        debug!(guild_id, channel_id = %session.channel_id, force, "voice socket released");

        self.leave_gateway_channel(guild_id).await
    }

    async fn set_state(
        &mut self,
        guild_id: &str,
        channel_id: &str,
        flags: VoiceFlags,
    ) -> Result<(), VoiceError> {
        self.gateway
            .update_voice_state(UpdateVoiceState {
                guild_id: guild_id.to_string(),
                channel_id: Some(channel_id.to_string()),
                self_mute: flags.self_mute,
                self_deaf: flags.self_deaf,
            })
            .await?;
        Ok(())
    }

    fn forget_dropped(&mut self, notice: &VoiceDrop) -> bool {
        let current = self
            .sessions
            .get(&notice.guild_id)
            .is_some_and(|s| s.serial == notice.serial);
        if current {
            self.sessions.remove(&notice.guild_id);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{local_socket, recv_json, send_json};
    use serde_json::json;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    const WAIT: Duration = Duration::from_secs(2);

    fn state(user: &str, guild: &str, channel: Option<&str>, session: &str) -> VoiceSignal {
        VoiceSignal::State(VoiceState {
            guild_id: Some(guild.to_string()),
            channel_id: channel.map(str::to_string),
            user_id: user.to_string(),
            session_id: session.to_string(),
            self_mute: false,
            self_deaf: false,
        })
    }

    fn server(guild: &str, endpoint: Option<&str>) -> VoiceSignal {
        VoiceSignal::Server(VoiceServerUpdate {
            token: "tok".to_string(),
            guild_id: guild.to_string(),
            endpoint: endpoint.map(str::to_string),
        })
    }

    #[test]
    fn credentials_need_both_halves() {
        let mut pending = PendingJoin::new("1", "10", "me");
        assert!(pending.offer(server("1", Some("voice.example"))).is_none());
        let creds = pending.offer(state("me", "1", Some("10"), "sess")).unwrap();
        assert_eq!(
            creds,
            VoiceCredentials {
                session_id: "sess".to_string(),
                token: "tok".to_string(),
                endpoint: "voice.example".to_string(),
            }
        );
    }

    #[test]
    fn other_users_guilds_and_channels_are_ignored() {
        let mut pending = PendingJoin::new("1", "10", "me");
        assert!(pending.offer(state("someone", "1", Some("10"), "x")).is_none());
        assert!(pending.offer(state("me", "2", Some("10"), "x")).is_none());
        // The null update from a preceding disconnect.
        assert!(pending.offer(state("me", "1", None, "x")).is_none());
        assert!(pending.offer(server("2", Some("elsewhere"))).is_none());
        assert!(pending.session_id.is_none());
        assert!(pending.server.is_none());
    }

    #[test]
    fn null_endpoint_waits_for_the_next_server() {
        let mut pending = PendingJoin::new("1", "10", "me");
        assert!(pending.offer(state("me", "1", Some("10"), "sess")).is_none());
        assert!(pending.offer(server("1", None)).is_none());
        assert!(pending.offer(server("1", Some("voice.example"))).is_some());
    }

    #[test]
    fn voice_url_normalises_endpoint() {
        assert_eq!(voice_url("c-ams.discord.media"), "wss://c-ams.discord.media/?v=4");
        assert_eq!(voice_url("wss://c-ams.discord.media/"), "wss://c-ams.discord.media/?v=4");
        assert_eq!(voice_url("c-ams.discord.media:443"), "wss://c-ams.discord.media:443/?v=4");
    }

    async fn voice_client(url: &str) -> WsStream {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    fn template(serial: u64) -> VoiceDrop {
        VoiceDrop {
            guild_id: "1".to_string(),
            channel_id: "10".to_string(),
            serial,
            reason: String::new(),
        }
    }

    #[tokio::test]
    async fn server_close_reports_the_session_serial() {
        let (url, _peer) = local_socket(|mut ws| async move {
            let frame = CloseFrame {
                code: CloseCode::from(4014),
                reason: "Disconnected".into(),
            };
            ws.send(WsMessage::Close(Some(frame))).await.unwrap();
            recv_json(&mut ws).await;
        })
        .await;

        let (_close, close_rx) = oneshot::channel();
        let (drops, mut drop_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(keep_alive(
            voice_client(&url).await,
            Duration::from_secs(60),
            close_rx,
            drops,
            template(7),
        ));

        let dropped = timeout(WAIT, drop_rx.recv()).await.unwrap().unwrap();
        assert_eq!(dropped.serial, 7);
        assert_eq!(dropped.guild_id, "1");
        assert_eq!(dropped.channel_id, "10");
        assert!(dropped.reason.contains("4014"), "{}", dropped.reason);
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unacknowledged_heartbeats_report_a_drop() {
        let (url, peer) = local_socket(|mut ws| async move {
            let mut beats = 0u32;
            while let Some(frame) = recv_json(&mut ws).await {
                if frame["op"] == 3 {
                    beats += 1;
                }
            }
            beats
        })
        .await;

        let (_close, close_rx) = oneshot::channel();
        let (drops, mut drop_rx) = mpsc::unbounded_channel();
        tokio::spawn(keep_alive(
            voice_client(&url).await,
            Duration::from_millis(30),
            close_rx,
            drops,
            template(3),
        ));

        let dropped = timeout(WAIT, drop_rx.recv()).await.unwrap().unwrap();
        assert_eq!(dropped.serial, 3);
        assert_eq!(dropped.reason, "voice heartbeat not acknowledged");
        let beats = timeout(WAIT, peer).await.unwrap().unwrap();
        assert_eq!(beats, MAX_MISSED_ACKS);
    }

    #[tokio::test]
    async fn requested_close_reports_nothing() {
        let (url, peer) = local_socket(|mut ws| async move {
            let mut beats = 0u32;
            while let Some(frame) = recv_json(&mut ws).await {
                if frame["op"] == 3 {
                    beats += 1;
                    send_json(&mut ws, json!({"op": 6, "d": frame["d"].clone()})).await;
                }
            }
            beats
        })
        .await;

        let (close, close_rx) = oneshot::channel();
        let (drops, mut drop_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(keep_alive(
            voice_client(&url).await,
            Duration::from_millis(20),
            close_rx,
            drops,
            template(5),
        ));

        // Long enough to outlast the missed-ack limit if acks were ignored.
        tokio::time::sleep(Duration::from_millis(150)).await;
        close.send(()).unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();

        assert!(drop_rx.recv().await.is_none());
        let beats = timeout(WAIT, peer).await.unwrap().unwrap();
        assert!(beats > MAX_MISSED_ACKS, "only {beats} heartbeats");
    }

    fn test_manager() -> (VoiceManager, mpsc::Receiver<serde_json::Value>) {
        let (sender, outbound) = GatewaySender::for_tests();
        let (manager, _drops) = VoiceManager::new(sender);
        (manager, outbound)
    }

    #[tokio::test]
    async fn connect_before_ready_fails() {
        let (mut manager, _outbound) = test_manager();
        let err = manager.connect("1", "10").await.unwrap_err();
        assert!(matches!(err, VoiceError::NotReady));
    }

    #[tokio::test]
    async fn disconnect_without_session_sends_nothing() {
        let (mut manager, mut outbound) = test_manager();
        manager.disconnect("1", true).await.unwrap();
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn set_state_sends_flags() {
        let (mut manager, mut outbound) = test_manager();
        let flags = VoiceFlags {
            self_mute: true,
            self_deaf: true,
        };
        manager.set_state("1", "10", flags).await.unwrap();
        let sent = outbound.recv().await.unwrap();
        assert_eq!(sent["op"], 4);
        assert_eq!(sent["d"]["channel_id"], "10");
        assert_eq!(sent["d"]["self_mute"], true);
        assert_eq!(sent["d"]["self_deaf"], true);
    }

    #[tokio::test]
    async fn connect_times_out_and_rolls_back() {
        tokio::time::pause();
        let (mut manager, mut outbound) = test_manager();
        manager.set_user_id("me");
        let err = manager.connect("1", "10").await.unwrap_err();
        assert!(matches!(err, VoiceError::Timeout(_)));

        let join = outbound.recv().await.unwrap();
        assert_eq!(join["d"]["channel_id"], "10");
        let rollback = outbound.recv().await.unwrap();
        assert!(rollback["d"]["channel_id"].is_null());
        assert!(!manager.is_connected("1"));
    }

    #[tokio::test]
    async fn stale_drops_are_not_current() {
        let (mut manager, _outbound) = test_manager();
        let (close, _rx) = oneshot::channel();
        manager.sessions.insert(
            "1".to_string(),
            ActiveVoice {
                channel_id: "10".to_string(),
                serial: 2,
                close: Some(close),
                task: tokio::spawn(async {}),
            },
        );
        let mut notice = VoiceDrop {
            guild_id: "1".to_string(),
            channel_id: "10".to_string(),
            serial: 1,
            reason: "old".to_string(),
        };
        assert!(!manager.forget_dropped(&notice));
        assert!(manager.is_connected("1"));

        notice.serial = 2;
        assert!(manager.forget_dropped(&notice));
        assert!(!manager.is_connected("1"));
    }

    static_assertions::assert_impl_all!(VoiceManager: Send);
}
