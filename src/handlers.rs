//! Event handlers for the AFK voice bot.
//!
//! Each public function handles one kind of input the bot loop delivers:
//! READY, a chat message, or a voice drop notice. Handlers receive a
//! [`BotContext`] that owns the status tracker, the voice controller, and a
//! [`ChatSurface`] for resolving channels and replying.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::commands::Command;
use crate::config::BotConfig;
use crate::controller::{JoinOutcome, VoiceController};
use crate::http::HttpError;
use crate::status::{status_message, StatusTracker, NOT_CONNECTED};
use crate::types::*;
use crate::voice::{VoiceBackend, VoiceDrop};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Channel lookup and message posting, as the handlers need them.
#[async_trait]
pub trait ChatSurface: Send {
    /// Resolve a channel by id; `None` when it doesn't exist or can't be seen.
    async fn channel(&mut self, channel_id: &str) -> Option<Channel>;

    async fn say(&mut self, channel_id: &str, content: &str) -> Result<(), HttpError>;
}

/// Everything a handler may touch. Owned by the bot loop.
pub struct BotContext<S, V> {
    pub config: BotConfig,
    pub status: StatusTracker,
    pub surface: S,
    pub voice: VoiceController<V>,
}

impl<S: ChatSurface, V: VoiceBackend> BotContext<S, V> {
    pub fn new(config: BotConfig, surface: S, backend: V) -> Self {
        let voice = VoiceController::new(backend, config.voice_flags);
        Self {
            config,
            status: StatusTracker::new(),
            surface,
            voice,
        }
    }
}

/// Why a join target was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unresolved {
    NotFound,
    NotVoice(ChannelType),
}

impl std::fmt::Display for Unresolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unresolved::NotFound => f.write_str("channel not found"),
            Unresolved::NotVoice(kind) => write!(f, "not a voice channel (type {})", u8::from(*kind)),
        }
    }
}

async fn voice_target<S: ChatSurface>(surface: &mut S, channel_id: &str) -> Result<Channel, Unresolved> {
    let channel = surface
        .channel(channel_id)
        .await
        .ok_or(Unresolved::NotFound)?;
    if channel.is_voice() {
        Ok(channel)
    } else {
        Err(Unresolved::NotVoice(channel.kind))
    }
}

// ---------------------------------------------------------------------------
// READY handler
// ---------------------------------------------------------------------------

/// Called on every READY. Joins the default channel when auto-join is on.
pub async fn on_ready<S: ChatSurface, V: VoiceBackend>(ctx: &mut BotContext<S, V>, ready: &ReadyEvent) {
    info!(user = %ready.user.tag(), guilds = ready.guilds.len(), "logged in");

    if !ctx.config.auto_join {
        info!(
            "auto-join disabled; use {}join to connect to a voice channel",
            ctx.config.prefix
        );
        return;
    }

    let channel_id = ctx.config.default_channel();
    match voice_target(&mut ctx.surface, &channel_id).await {
        Ok(channel) => match ctx.voice.join(&mut ctx.status, &channel).await {
            JoinOutcome::Joined { since } => debug!(%since, "auto-join complete"),
            JoinOutcome::Failed(_) => {
                warn!("auto-join failed, staying idle; use {}join to retry", ctx.config.prefix)
            }
        },
        Err(reason) => {
            error!(channel_id = %channel_id, %reason, "cannot auto-join default voice channel");
        }
    }
}

// ---------------------------------------------------------------------------
// MESSAGE_CREATE handler
// ---------------------------------------------------------------------------

/// Called for every message the gateway delivers. Only prefix commands from
/// permitted humans do anything.
pub async fn on_message<S: ChatSurface, V: VoiceBackend>(ctx: &mut BotContext<S, V>, msg: &Message) {
    if msg.author.bot {
        return;
    }

    let Some(command) = Command::parse(&ctx.config.prefix, &msg.content) else {
        if msg.content.starts_with(&ctx.config.prefix) {
            debug!(content = %msg.content, "not a known command, ignoring");
        }
        return;
    };

    if !ctx.config.may_command(&msg.author.id) {
        debug!(author = %msg.author.tag(), command = command.name(), "author not on command allowlist");
        return;
    }

    info!(
        author = %msg.author.tag(),
        channel_id = %msg.channel_id,
        command = command.name(),
        "handling command"
    );

    match command {
        Command::Join(explicit) => handle_join(ctx, explicit).await,
        Command::Leave => {
            ctx.voice
                .leave(&mut ctx.status, msg.guild_id.as_deref())
                .await
        }
        Command::Status => handle_status(ctx, &msg.channel_id).await,
    }
}

async fn handle_join<S: ChatSurface, V: VoiceBackend>(ctx: &mut BotContext<S, V>, explicit: Option<u64>) {
    let channel_id = explicit
        .map(|id| id.to_string())
        .unwrap_or_else(|| ctx.config.default_channel());

    match voice_target(&mut ctx.surface, &channel_id).await {
        Ok(channel) => {
            if let JoinOutcome::Failed(e) = ctx.voice.join(&mut ctx.status, &channel).await {
                debug!(channel_id = %channel.id, error = %e, "join command left the bot idle");
            }
        }
        Err(reason) => warn!(channel_id = %channel_id, %reason, "ignoring join"),
    }
}

async fn handle_status<S: ChatSurface, V: VoiceBackend>(ctx: &mut BotContext<S, V>, reply_to: &str) {
    let text = match ctx.status.target_channel_id.clone() {
        Some(target) if ctx.status.is_connected() => {
            let name = ctx.surface.channel(&target).await.and_then(|c| c.name);
            status_message(&ctx.status, Utc::now(), name.as_deref().unwrap_or("unknown"))
        }
        _ => NOT_CONNECTED.to_string(),
    };

    info!("Status: {text}");
    if let Err(e) = ctx.surface.say(reply_to, &text).await {
        warn!(channel_id = %reply_to, error = %e, "failed to send status reply");
    }
}

// ---------------------------------------------------------------------------
// Voice drops
// ---------------------------------------------------------------------------

/// Called when a voice keep-alive task reports its socket died.
pub fn on_voice_drop<S, V: VoiceBackend>(ctx: &mut BotContext<S, V>, notice: &VoiceDrop) {
    ctx.voice.reconcile_drop(&mut ctx.status, notice);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel, voice_channel, FakeSurface, FakeVoice};
    use chrono::Duration;

    const DEFAULT_VC: &str = "500";

    fn config(extra: &[(&str, &str)]) -> BotConfig {
        let mut pairs = vec![("DISCORD_TOKEN", "token"), ("DEFAULT_VC_ID", DEFAULT_VC)];
        pairs.extend_from_slice(extra);
        BotConfig::from_lookup(|key| {
            pairs
                .iter()
                .rev()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap()
    }

    fn context(extra: &[(&str, &str)]) -> BotContext<FakeSurface, FakeVoice> {
        let surface = FakeSurface::with([
            voice_channel("1", DEFAULT_VC, "afk"),
            voice_channel("1", "501", "general"),
            channel("1", "600", "chat", ChannelType::GuildText),
            channel("1", "601", "stage", ChannelType::GuildStageVoice),
        ]);
        BotContext::new(config(extra), surface, FakeVoice::default())
    }

    fn message(author_id: &str, content: &str) -> Message {
        Message {
            id: "900".into(),
            channel_id: "600".into(),
            guild_id: Some("1".into()),
            author: User {
                id: author_id.into(),
                username: "alice".into(),
                discriminator: None,
                bot: false,
                global_name: None,
            },
            content: content.into(),
            timestamp: "2024-01-01T00:00:00+00:00".into(),
        }
    }

    fn ready() -> ReadyEvent {
        serde_json::from_value(serde_json::json!({
            "v": 10,
            "user": {"id": "42", "username": "afk", "bot": true},
            "session_id": "s",
            "resume_gateway_url": "wss://resume.discord.gg",
            "guilds": [{"id": "1", "unavailable": true}],
        }))
        .unwrap()
    }

    // -- join --------------------------------------------------------------

    #[tokio::test]
    async fn join_without_argument_uses_default_channel() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!join")).await;

        assert_eq!(ctx.status.target_channel_id.as_deref(), Some(DEFAULT_VC));
        assert!(ctx.status.is_connected());
    }

    #[tokio::test]
    async fn join_with_argument_targets_that_channel() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!join 501")).await;
        assert_eq!(ctx.status.target_channel_id.as_deref(), Some("501"));
    }

    #[tokio::test]
    async fn malformed_argument_falls_back_to_default() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!join general")).await;
        assert_eq!(ctx.status.target_channel_id.as_deref(), Some(DEFAULT_VC));
    }

    #[tokio::test]
    async fn join_to_text_channel_changes_nothing() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!join 600")).await;

        assert!(!ctx.status.is_connected());
        assert!(ctx.voice.backend().calls.is_empty());
        assert!(ctx.surface.sent.is_empty());
    }

    #[tokio::test]
    async fn stage_channels_are_rejected() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!join 601")).await;
        assert!(ctx.voice.backend().calls.is_empty());
    }

    #[tokio::test]
    async fn join_to_unknown_channel_keeps_previous_status() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!join")).await;
        let before = ctx.status.clone();

        on_message(&mut ctx, &message("7", "!join 999")).await;

        assert_eq!(ctx.status, before);
    }

    // -- leave -------------------------------------------------------------

    #[tokio::test]
    async fn leave_clears_status() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!join")).await;
        on_message(&mut ctx, &message("7", "!leave")).await;

        assert_eq!(ctx.status, StatusTracker::default());
        assert_eq!(
            ctx.voice.backend().calls.last().map(String::as_str),
            Some("disconnect 1 force=false")
        );
    }

    #[tokio::test]
    async fn leave_when_idle_is_harmless() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!leave")).await;
        assert!(!ctx.status.is_connected());
        assert!(ctx.voice.backend().calls.is_empty());
    }

    // -- status ------------------------------------------------------------

    #[tokio::test]
    async fn status_when_idle() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!status")).await;
        assert_eq!(
            ctx.surface.sent,
            vec![("600".to_string(), NOT_CONNECTED.to_string())]
        );
    }

    #[tokio::test]
    async fn status_when_connected_names_the_channel() {
        let mut ctx = context(&[]);
        ctx.status
            .mark_connected("501", Utc::now() - Duration::seconds(3661));

        on_message(&mut ctx, &message("7", "!status")).await;

        let (channel_id, text) = &ctx.surface.sent[0];
        assert_eq!(channel_id, "600");
        assert!(
            text.starts_with("Connected to #general for 01:01:0"),
            "unexpected reply: {text}"
        );
    }

    #[tokio::test]
    async fn status_falls_back_to_unknown_name() {
        let mut ctx = context(&[]);
        ctx.status.mark_connected("777", Utc::now());

        on_message(&mut ctx, &message("7", "!status")).await;

        assert!(ctx.surface.sent[0].1.starts_with("Connected to #unknown for 00:00:0"));
    }

    #[tokio::test]
    async fn failed_status_reply_is_swallowed() {
        let mut ctx = context(&[]);
        ctx.surface.failing_sends.insert("600".into());
        on_message(&mut ctx, &message("7", "!status")).await;
        assert!(ctx.surface.sent.is_empty());
    }

    // -- filtering ---------------------------------------------------------

    #[tokio::test]
    async fn ignored_messages_do_nothing() {
        let mut ctx = context(&[]);
        let mut from_bot = message("8", "!join");
        from_bot.author.bot = true;

        for msg in [
            from_bot,
            message("7", "!dance"),
            message("7", "?join"),
            message("7", "join"),
            message("7", "!Status"),
        ] {
            on_message(&mut ctx, &msg).await;
        }

        assert!(ctx.surface.sent.is_empty());
        assert!(ctx.surface.lookups.is_empty());
        assert!(ctx.voice.backend().calls.is_empty());
    }

    #[tokio::test]
    async fn allowlist_filters_authors() {
        let mut ctx = context(&[("COMMAND_USERS", "7")]);

        on_message(&mut ctx, &message("8", "!status")).await;
        assert!(ctx.surface.sent.is_empty());

        on_message(&mut ctx, &message("7", "!status")).await;
        assert_eq!(ctx.surface.sent.len(), 1);
    }

    #[tokio::test]
    async fn custom_prefix() {
        let mut ctx = context(&[("COMMAND_PREFIX", "afk.")]);
        on_message(&mut ctx, &message("7", "!status")).await;
        on_message(&mut ctx, &message("7", "afk.status")).await;
        assert_eq!(ctx.surface.sent.len(), 1);
    }

    // -- ready -------------------------------------------------------------

    #[tokio::test]
    async fn ready_without_auto_join_stays_idle() {
        let mut ctx = context(&[]);
        on_ready(&mut ctx, &ready()).await;
        assert!(!ctx.status.is_connected());
        assert!(ctx.surface.lookups.is_empty());
    }

    #[tokio::test]
    async fn ready_with_auto_join_connects() {
        let mut ctx = context(&[("AUTO_JOIN", "TRUE")]);
        on_ready(&mut ctx, &ready()).await;
        assert_eq!(ctx.status.target_channel_id.as_deref(), Some(DEFAULT_VC));
    }

    #[tokio::test]
    async fn auto_join_to_missing_channel_stays_idle() {
        let mut ctx = context(&[("AUTO_JOIN", "true"), ("DEFAULT_VC_ID", "999")]);
        on_ready(&mut ctx, &ready()).await;
        assert!(!ctx.status.is_connected());
        assert!(ctx.voice.backend().calls.is_empty());
    }

    #[tokio::test]
    async fn failed_auto_join_stays_idle() {
        let mut ctx = context(&[("AUTO_JOIN", "true")]);
        ctx.voice.backend_mut().fail_connect = true;
        on_ready(&mut ctx, &ready()).await;

        assert!(!ctx.status.is_connected());
        assert!(ctx.status.target_channel_id.is_none());
        assert_eq!(ctx.voice.backend().calls, vec![format!("connect 1 {DEFAULT_VC}")]);
    }

    #[tokio::test]
    async fn repeated_ready_rejoins() {
        let mut ctx = context(&[("AUTO_JOIN", "true")]);
        on_ready(&mut ctx, &ready()).await;
        on_ready(&mut ctx, &ready()).await;

        assert!(ctx.status.is_connected());
        assert!(ctx
            .voice
            .backend()
            .calls
            .contains(&"disconnect 1 force=true".to_string()));
    }

    // -- drops -------------------------------------------------------------

    #[tokio::test]
    async fn voice_drop_clears_status() {
        let mut ctx = context(&[]);
        on_message(&mut ctx, &message("7", "!join")).await;

        let notice = VoiceDrop {
            guild_id: "1".into(),
            channel_id: DEFAULT_VC.into(),
            serial: ctx.voice.backend().serial,
            reason: "closed by server".into(),
        };
        on_voice_drop(&mut ctx, &notice);

        assert!(!ctx.status.is_connected());
    }
}
