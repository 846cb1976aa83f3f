//! Typed representations of the Discord API objects this bot touches.
//!
//! Only the fields we read are modelled; serde ignores the rest. Inbound
//! objects derive `Deserialize`, outbound payloads derive `Serialize`, and a
//! few derive both so tests can build them from JSON literals.

use serde::{Deserialize, Serialize};
use serde_repr::Serialize_repr;

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Discord IDs are snowflakes transmitted as strings in JSON.
pub type Snowflake = String;

// ---------------------------------------------------------------------------
// Gateway envelope
// ---------------------------------------------------------------------------

/// Inbound envelope wrapping every gateway WebSocket message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    pub d: Option<serde_json::Value>,
    pub s: Option<u64>,
    pub t: Option<String>,
}

/// Opcodes we send on the main gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr)]
#[repr(u8)]
pub enum GatewayOp {
    Heartbeat = 1,
    Identify = 2,
    VoiceStateUpdate = 4,
    Resume = 6,
}

/// Outbound envelope: `{"op": <op>, "d": <data>}`.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound<T> {
    pub op: GatewayOp,
    pub d: T,
}

impl<T: Serialize> Outbound<T> {
    pub fn new(op: GatewayOp, d: T) -> Self {
        Self { op, d }
    }

    /// Render to a JSON value ready for the gateway send queue.
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Op 4 body: join, move, or leave a voice channel and set self flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateVoiceState {
    pub guild_id: Snowflake,
    /// `None` serialises as `null`, which leaves the guild's voice channel.
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    pub discriminator: Option<String>,
    #[serde(default)]
    pub bot: bool,
    pub global_name: Option<String>,
}

impl User {
    /// `Username#Discriminator` or just `Username` for the new username system.
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some("0") | None => self.username.clone(),
            Some(disc) => format!("{}#{}", self.username, disc),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Channel kind. Values Discord adds later land in [`ChannelType::Other`]
/// instead of failing the whole `GUILD_CREATE` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "u8", into = "u8")]
pub enum ChannelType {
    GuildText,
    Dm,
    GuildVoice,
    GroupDm,
    GuildCategory,
    GuildAnnouncement,
    GuildStageVoice,
    GuildForum,
    Other(u8),
}

impl From<u8> for ChannelType {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::GuildText,
            1 => Self::Dm,
            2 => Self::GuildVoice,
            3 => Self::GroupDm,
            4 => Self::GuildCategory,
            5 => Self::GuildAnnouncement,
            13 => Self::GuildStageVoice,
            15 => Self::GuildForum,
            other => Self::Other(other),
        }
    }
}

impl From<ChannelType> for u8 {
    fn from(kind: ChannelType) -> Self {
        match kind {
            ChannelType::GuildText => 0,
            ChannelType::Dm => 1,
            ChannelType::GuildVoice => 2,
            ChannelType::GroupDm => 3,
            ChannelType::GuildCategory => 4,
            ChannelType::GuildAnnouncement => 5,
            ChannelType::GuildStageVoice => 13,
            ChannelType::GuildForum => 15,
            ChannelType::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Channel {
    pub id: Snowflake,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    /// Absent on channels embedded in `GUILD_CREATE`; the cache fills it in.
    pub guild_id: Option<Snowflake>,
    pub name: Option<String>,
    pub position: Option<i32>,
    pub parent_id: Option<Snowflake>,
}

impl Channel {
    /// Only regular guild voice channels are join targets; stage channels
    /// need speaker permissions and are rejected.
    pub fn is_voice(&self) -> bool {
        self.kind == ChannelType::GuildVoice
    }

    pub fn name_or_unknown(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub guild_id: Option<Snowflake>,
    pub author: User,
    #[serde(default)]
    pub content: String,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Guild
// ---------------------------------------------------------------------------

/// The subset of `GUILD_CREATE` we keep: the channel list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Guild {
    pub id: Snowflake,
    pub name: Option<String>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

// ---------------------------------------------------------------------------
// READY event payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadyEvent {
    pub v: u8,
    pub user: User,
    pub session_id: String,
    pub resume_gateway_url: String,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

// ---------------------------------------------------------------------------
// Voice signalling (main gateway side)
// ---------------------------------------------------------------------------

/// `VOICE_STATE_UPDATE` dispatch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceState {
    pub guild_id: Option<Snowflake>,
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

/// `VOICE_SERVER_UPDATE` dispatch. A `null` endpoint means the voice server
/// went away and another update will follow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: Snowflake,
    pub endpoint: Option<String>,
}

// ---------------------------------------------------------------------------
// Voice signalling socket (v4)
// ---------------------------------------------------------------------------

/// Opcodes we send on a voice signalling socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr)]
#[repr(u8)]
pub enum VoiceOp {
    Identify = 0,
    Heartbeat = 3,
}

/// Opcodes we read on a voice signalling socket.
pub mod voice_op {
    pub const READY: u8 = 2;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const HELLO: u8 = 8;
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceOutbound<T> {
    pub op: VoiceOp,
    pub d: T,
}

/// Inbound voice envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct VoicePayload {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceIdentify {
    pub server_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
}

// ---------------------------------------------------------------------------
// Outbound message body (for REST POST /channels/{id}/messages)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Always sent so channel names or ids echoed back never ping anyone.
    pub allowed_mentions: AllowedMentions,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
}

impl CreateMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, text: impl Into<String>) -> Self {
        self.content = Some(text.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Rate-limit info parsed from response headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub reset_after: Option<f64>,
    pub bucket: Option<String>,
    pub is_global: bool,
}
