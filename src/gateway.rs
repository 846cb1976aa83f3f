//! Gateway (WebSocket) transport for the Discord API.
//!
//! One spawned driver task owns the socket and runs a single `select!` loop
//! over the heartbeat timer, the outbound send queue, delivery to the bot,
//! and inbound frames. Parsed events wait in a driver-side backlog until the
//! bot has room for them, so a busy bot never stalls heartbeats. It handles
//!   - HELLO → IDENTIFY, or RESUME when a session is known
//!   - heartbeats, including zombie detection on a missed ACK
//!   - sequence / session id tracking
//!   - reconnect with backoff and resume on disconnect
//!   - the 120-per-60s outbound budget
//!
//! The bot consumes typed [`GatewayEvent`]s and sends through a
//! [`GatewaySender`]. Voice-signalling dispatches are additionally broadcast
//! so a voice join can await them while the bot loop is busy.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::events::{GatewayEvent, VoiceSignal};
use crate::types::*;

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
const GATEWAY_QUERY: &str = "v=10&encoding=json";

/// Discord allows at most 120 gateway sends per 60 seconds.
const SEND_BUDGET_MAX: usize = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

const MAX_RECONNECT_ATTEMPTS: u32 = 8;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

bitflags::bitflags! {
    /// Gateway intents bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intents: u32 {
        const GUILDS = 1 << 0;
        const GUILD_VOICE_STATES = 1 << 7;
        const GUILD_MESSAGES = 1 << 9;
        const MESSAGE_CONTENT = 1 << 15;
    }
}

impl Intents {
    /// Channels for resolution, voice states for joins, messages (with
    /// content) for commands.
    pub fn presence_bot() -> Self {
        Self::GUILDS | Self::GUILD_VOICE_STATES | Self::GUILD_MESSAGES | Self::MESSAGE_CONTENT
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: Intents,
}

// ---------------------------------------------------------------------------
// Outbound rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window limiter for outbound gateway frames.
#[derive(Debug)]
struct SendLimiter {
    sent: VecDeque<Instant>,
    budget: usize,
    window: Duration,
}

impl SendLimiter {
    fn new(budget: usize, window: Duration) -> Self {
        Self {
            sent: VecDeque::with_capacity(budget),
            budget,
            window,
        }
    }

    /// Wait needed before the next send, if the window is full.
    fn delay(&mut self, now: Instant) -> Option<Duration> {
        while self
            .sent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            self.sent.pop_front();
        }
        if self.sent.len() < self.budget {
            return None;
        }
        self.sent
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
    }

    fn record(&mut self, now: Instant) {
        self.sent.push_back(now);
    }
}

// ---------------------------------------------------------------------------
// Session state carried across reconnects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SessionState {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
}

impl SessionState {
    fn resumable(&self) -> Option<(&str, u64)> {
        Some((self.session_id.as_deref()?, self.sequence?))
    }

    /// Forget the session but keep the resume URL.
    fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence = None;
    }
}

/// Build the connect URL, appending version/encoding unless already there.
fn gateway_url(base: Option<&str>) -> String {
    let base = base.unwrap_or(DEFAULT_GATEWAY_URL);
    if base.contains("v=10") {
        base.to_string()
    } else if base.contains('?') {
        format!("{base}&{GATEWAY_QUERY}")
    } else {
        format!("{}/?{GATEWAY_QUERY}", base.trim_end_matches('/'))
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Cloneable handle for sending on the gateway.
#[derive(Debug, Clone)]
pub struct GatewaySender {
    outbound: mpsc::Sender<serde_json::Value>,
    voice: broadcast::Sender<VoiceSignal>,
}

impl GatewaySender {
    /// Queue an op 4 voice state update.
    pub async fn update_voice_state(&self, update: UpdateVoiceState) -> Result<(), GatewayError> {
        let payload = Outbound::new(GatewayOp::VoiceStateUpdate, update).to_value()?;
        self.outbound
            .send(payload)
            .await
            .map_err(|_| GatewayError::Closed)
    }

    /// Subscribe to voice signalling dispatches from now on.
    pub fn subscribe_voice(&self) -> broadcast::Receiver<VoiceSignal> {
        self.voice.subscribe()
    }

    /// A sender with no driver behind it; tests read the queued payloads.
    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::Receiver<serde_json::Value>) {
        let (outbound, rx) = mpsc::channel(64);
        let (voice, _) = broadcast::channel(32);
        (Self { outbound, voice }, rx)
    }
}

pub struct GatewayHandle {
    pub sender: GatewaySender,
    pub events: mpsc::Receiver<GatewayEvent>,
    pub driver: tokio::task::JoinHandle<()>,
}

/// Spawn the gateway driver. The event receiver closes when the driver gives
/// up (fatal close code or exhausted reconnects).
pub fn spawn(config: GatewayConfig) -> GatewayHandle {
    let (event_tx, events) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (voice_tx, _) = broadcast::channel(32);

    let driver = Driver {
        config,
        session: SessionState::default(),
        attempts: 0,
        events: event_tx,
        backlog: VecDeque::new(),
        outbound: outbound_rx,
        voice: voice_tx.clone(),
    };

    GatewayHandle {
        sender: GatewaySender {
            outbound: outbound_tx,
            voice: voice_tx,
        },
        events,
        driver: tokio::spawn(driver.run()),
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    Resume,
    Reidentify,
    Fatal,
    Shutdown,
}

/// Map a gateway close code to what we do next.
fn classify_close(code: u16) -> Disconnect {
    match code {
        4004 => {
            error!("authentication failed (close 4004)");
            Disconnect::Fatal
        }
        4010..=4014 => {
            error!(code, "gateway rejected shard, version, or intents");
            Disconnect::Fatal
        }
        // Invalid seq or session timed out.
        4007 | 4009 => Disconnect::Reidentify,
        _ => Disconnect::Resume,
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    ws: WsStream,
    limiter: SendLimiter,
}

impl Connection {
    async fn send<T: Serialize>(&mut self, payload: &T) -> Result<(), GatewayError> {
        if let Some(delay) = self.limiter.delay(Instant::now()) {
            debug!(delay_ms = delay.as_millis() as u64, "gateway send rate-limited, waiting");
            tokio::time::sleep(delay).await;
        }
        self.limiter.record(Instant::now());
        let text = serde_json::to_string(payload)?;
        self.ws.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    /// Read op 10 and return `heartbeat_interval` in milliseconds.
    async fn read_hello(&mut self) -> Result<u64, GatewayError> {
        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.ws.next())
            .await
            .map_err(|_| GatewayError::Handshake("timed out waiting for HELLO".into()))?
            .ok_or_else(|| GatewayError::Handshake("stream ended before HELLO".into()))??;

        let text = match frame {
            WsMessage::Text(text) => text,
            other => {
                return Err(GatewayError::Handshake(format!(
                    "expected text frame for HELLO, got {other:?}"
                )))
            }
        };
        let payload: GatewayPayload = serde_json::from_str(text.as_str())?;
        if payload.op != 10 {
            return Err(GatewayError::Handshake(format!(
                "expected op 10 (HELLO), got op {}",
                payload.op
            )));
        }

        payload
            .d
            .as_ref()
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| GatewayError::Handshake("HELLO missing heartbeat_interval".into()))
    }
}

struct Driver {
    config: GatewayConfig,
    session: SessionState,
    attempts: u32,
    events: mpsc::Sender<GatewayEvent>,
    /// Parsed events the bot has not taken yet. Survives reconnects.
    backlog: VecDeque<GatewayEvent>,
    outbound: mpsc::Receiver<serde_json::Value>,
    voice: broadcast::Sender<VoiceSignal>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            match self.connect_once().await {
                Ok(Disconnect::Resume) => info!("will attempt RESUME"),
                Ok(Disconnect::Reidentify) => {
                    info!("session invalidated, will re-IDENTIFY");
                    self.session.invalidate();
                }
                Ok(Disconnect::Fatal) => {
                    error!("fatal gateway error, shutting down");
                    return;
                }
                Ok(Disconnect::Shutdown) => {
                    info!("bot side closed, shutting down gateway driver");
                    return;
                }
                Err(e) => warn!(error = %e, "gateway connection failed"),
            }

            self.attempts += 1;
            if self.attempts > MAX_RECONNECT_ATTEMPTS {
                error!("exceeded max reconnect attempts, giving up");
                return;
            }
            let backoff = backoff_delay(self.attempts);
            warn!(
                delay_ms = backoff.as_millis() as u64,
                attempt = self.attempts,
                "reconnecting after backoff"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn connect_once(&mut self) -> Result<Disconnect, GatewayError> {
        let url = gateway_url(self.session.resume_gateway_url.as_deref());
        info!(url = %url, "connecting to Discord gateway");

        let (ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| GatewayError::Handshake("timed out opening websocket".into()))??;
        let mut conn = Connection {
            ws,
            limiter: SendLimiter::new(SEND_BUDGET_MAX, SEND_BUDGET_WINDOW),
        };

        let interval_ms = conn.read_hello().await?;
        info!(interval_ms, "received HELLO");

        if let Some((session_id, seq)) = self.session.resumable() {
            let resume = Outbound::new(
                GatewayOp::Resume,
                json!({"token": self.config.token, "session_id": session_id, "seq": seq}),
            );
            conn.send(&resume).await?;
            info!("sent RESUME");
        } else {
            let identify = Outbound::new(
                GatewayOp::Identify,
                json!({
                    "token": self.config.token,
                    "intents": self.config.intents.bits(),
                    "properties": {
                        "os": std::env::consts::OS,
                        "browser": "afk-voice",
                        "device": "afk-voice",
                    },
                }),
            );
            conn.send(&identify).await?;
            info!("sent IDENTIFY");
        }

        let period = Duration::from_millis(interval_ms.max(1));
        let jitter = period.mul_f64(rand::random::<f64>());
        let mut heartbeat = tokio::time::interval_at(Instant::now() + jitter, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_ack = false;
        let events = self.events.clone();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        warn!("heartbeat not acknowledged, reconnecting");
                        break Disconnect::Resume;
                    }
                    conn.send(&Outbound::new(GatewayOp::Heartbeat, self.session.sequence)).await?;
                    awaiting_ack = true;
                    debug!(seq = ?self.session.sequence, "sent heartbeat");
                }

                outbound = self.outbound.recv() => match outbound {
                    Some(payload) => conn.send(&payload).await?,
                    None => break Disconnect::Shutdown,
                },

                permit = events.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(event) = self.backlog.pop_front() {
                            permit.send(event);
                        }
                    }
                    Err(_) => break Disconnect::Shutdown,
                },

                frame = conn.ws.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket read error");
                            break Disconnect::Resume;
                        }
                        None => {
                            info!("WebSocket stream ended");
                            break Disconnect::Resume;
                        }
                    };

                    match frame {
                        WsMessage::Text(text) => {
                            let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
                                Ok(p) => p,
                                Err(e) => {
                                    warn!(error = %e, "failed to parse gateway payload");
                                    continue;
                                }
                            };
                            if let Some(disconnect) = self.on_payload(&mut conn, payload, &mut awaiting_ack).await? {
                                break disconnect;
                            }
                        }
                        WsMessage::Close(frame) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            warn!(close_code = ?code, "WebSocket closed by server");
                            break code.map(classify_close).unwrap_or(Disconnect::Resume);
                        }
                        _ => {}
                    }
                }
            }
        };

        let _ = conn.ws.close(None).await;
        Ok(outcome)
    }

    /// Handle one inbound payload. `Some` ends this connection.
    async fn on_payload(
        &mut self,
        conn: &mut Connection,
        payload: GatewayPayload,
        awaiting_ack: &mut bool,
    ) -> Result<Option<Disconnect>, GatewayError> {
        if let Some(seq) = payload.s {
            self.session.sequence = Some(seq);
        }
        let resumed = payload.t.as_deref() == Some("RESUMED");

        let event = GatewayEvent::from_payload(payload);
        match &event {
            GatewayEvent::HeartbeatAck => {
                *awaiting_ack = false;
                return Ok(None);
            }
            GatewayEvent::HeartbeatRequest => {
                conn.send(&Outbound::new(GatewayOp::Heartbeat, self.session.sequence))
                    .await?;
                debug!("sent requested heartbeat");
                return Ok(None);
            }
            GatewayEvent::Reconnect => {
                info!("gateway requested reconnect (op 7)");
                return Ok(Some(Disconnect::Resume));
            }
            GatewayEvent::InvalidSession(resumable) => {
                // The reconnect backoff covers Discord's 1-5 s pause.
                warn!(resumable, "session invalidated (op 9)");
                return Ok(Some(if *resumable {
                    Disconnect::Resume
                } else {
                    Disconnect::Reidentify
                }));
            }
            GatewayEvent::Ready(ready) => {
                self.session.session_id = Some(ready.session_id.clone());
                self.session.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                self.attempts = 0;
                info!(session_id = %ready.session_id, user = %ready.user.tag(), "gateway READY");
            }
            _ if resumed => {
                self.attempts = 0;
                info!("session resumed");
            }
            _ => {}
        }

        if let Some(signal) = event.voice_signal() {
            // No receivers just means no join is waiting.
            let _ = self.voice.send(signal);
        }

        self.backlog.push_back(event);
        Ok(None)
    }
}

/// Exponential backoff with jitter, capped at 60 s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64 * 2u64.saturating_pow(attempt.min(6));
    let jittered = (rand::random::<f64>() * 0.5 + 0.75) * base_ms as f64;
    Duration::from_millis(jittered.min(60_000.0) as u64)
}
