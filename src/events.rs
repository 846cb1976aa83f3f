//! Typed gateway events.
//!
//! The gateway driver turns every raw [`GatewayPayload`] into a
//! [`GatewayEvent`] so the bot loop can pattern-match on typed data.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::types::*;

/// A fully-parsed event coming off the Discord gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// IDENTIFY accepted; carries our own user.
    Ready(ReadyEvent),

    /// Full guild object, sent lazily after READY and on guild join.
    GuildCreate(Guild),

    /// Guild became unavailable or we were removed from it.
    GuildDelete(UnavailableGuild),

    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(Channel),

    /// A message was created in a channel we can see.
    MessageCreate(Message),

    /// Someone's voice state changed (ours included).
    VoiceStateUpdate(VoiceState),

    /// Voice server credentials for a guild we asked to join.
    VoiceServerUpdate(VoiceServerUpdate),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session invalidated (op 9); `true` when it can still be resumed.
    InvalidSession(bool),

    /// Anything we don't model.
    Unknown { event_name: Option<String>, op: u8 },
}

/// The two dispatches a pending voice join waits on.
#[derive(Debug, Clone)]
pub enum VoiceSignal {
    State(VoiceState),
    Server(VoiceServerUpdate),
}

impl GatewayEvent {
    /// Convert a raw payload. Never fails: unparseable dispatches become
    /// [`GatewayEvent::Unknown`] after a warning.
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t, payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => GatewayEvent::InvalidSession(
                payload.d.as_ref().and_then(|v| v.as_bool()).unwrap_or(false),
            ),
            11 => GatewayEvent::HeartbeatAck,
            op => GatewayEvent::Unknown {
                event_name: payload.t,
                op,
            },
        }
    }

    fn parse_dispatch(event_name: Option<String>, data: Option<serde_json::Value>) -> Self {
        let Some(d) = data else {
            return GatewayEvent::Unknown { event_name, op: 0 };
        };
        let Some(name) = event_name.as_deref() else {
            return GatewayEvent::Unknown {
                event_name: None,
                op: 0,
            };
        };

        let parsed = match name {
            "READY" => decode(name, d).map(GatewayEvent::Ready),
            "GUILD_CREATE" => decode(name, d).map(GatewayEvent::GuildCreate),
            "GUILD_DELETE" => decode(name, d).map(GatewayEvent::GuildDelete),
            "CHANNEL_CREATE" => decode(name, d).map(GatewayEvent::ChannelCreate),
            "CHANNEL_UPDATE" => decode(name, d).map(GatewayEvent::ChannelUpdate),
            "CHANNEL_DELETE" => decode(name, d).map(GatewayEvent::ChannelDelete),
            "MESSAGE_CREATE" => decode(name, d).map(GatewayEvent::MessageCreate),
            "VOICE_STATE_UPDATE" => decode(name, d).map(GatewayEvent::VoiceStateUpdate),
            "VOICE_SERVER_UPDATE" => decode(name, d).map(GatewayEvent::VoiceServerUpdate),
            _ => None,
        };

        parsed.unwrap_or(GatewayEvent::Unknown { event_name, op: 0 })
    }

    /// The voice-signalling view of this event, if it is one.
    pub fn voice_signal(&self) -> Option<VoiceSignal> {
        match self {
            GatewayEvent::VoiceStateUpdate(state) => Some(VoiceSignal::State(state.clone())),
            GatewayEvent::VoiceServerUpdate(server) => Some(VoiceSignal::Server(server.clone())),
            _ => None,
        }
    }
}

fn decode<T: DeserializeOwned>(event: &str, data: serde_json::Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(event, error = %e, "failed to parse dispatch payload");
            None
        }
    }
}
