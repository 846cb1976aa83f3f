//! Core bot infrastructure: the live chat surface and the async event loop.
//!
//! This module owns the "engine" of the bot. It connects to Discord's
//! gateway, keeps the channel cache current, and feeds READY, messages, and
//! voice drops to [`crate::handlers`] one at a time. All mutable state lives
//! in the [`BotContext`] the loop owns, so no locks are needed here.

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::cache::ChannelCache;
use crate::config::BotConfig;
use crate::error::{GatewayError, Result};
use crate::events::GatewayEvent;
use crate::gateway::{self, GatewayConfig, GatewayHandle, Intents};
use crate::handlers::{self, BotContext, ChatSurface};
use crate::http::{DiscordHttpClient, HttpError};
use crate::types::*;
use crate::voice::VoiceManager;

// ---------------------------------------------------------------------------
// Chat surface
// ---------------------------------------------------------------------------

/// Channels come from the gateway-fed cache, falling back to REST.
#[derive(Debug)]
pub struct DiscordSurface {
    cache: ChannelCache,
    http: DiscordHttpClient,
}

impl DiscordSurface {
    pub fn new(http: DiscordHttpClient) -> Self {
        Self {
            cache: ChannelCache::new(),
            http,
        }
    }
}

#[async_trait]
impl ChatSurface for DiscordSurface {
    async fn channel(&mut self, channel_id: &str) -> Option<Channel> {
        if let Some(channel) = self.cache.get(channel_id) {
            return Some(channel.clone());
        }

        match self.http.get_channel(channel_id).await {
            Ok(channel) => {
                self.cache.upsert(channel.clone());
                Some(channel)
            }
            Err(e) if e.is_not_found() => {
                debug!(channel_id, "channel does not exist");
                None
            }
            Err(e) => {
                warn!(channel_id, error = %e, "failed to fetch channel");
                None
            }
        }
    }

    async fn say(&mut self, channel_id: &str, content: &str) -> Result<(), HttpError> {
        self.http.send_message(channel_id, content).await?;
        Ok(())
    }
}

/// Fold channel bookkeeping events into the cache. Returns the event back
/// when it is not one of them.
fn apply_to_cache(cache: &mut ChannelCache, event: GatewayEvent) -> Option<GatewayEvent> {
    match event {
        GatewayEvent::GuildCreate(guild) => cache.insert_guild(guild),
        GatewayEvent::GuildDelete(guild) => cache.remove_guild(&guild.id),
        GatewayEvent::ChannelCreate(channel) | GatewayEvent::ChannelUpdate(channel) => {
            cache.upsert(channel)
        }
        GatewayEvent::ChannelDelete(channel) => {
            cache.remove(&channel.id);
        }
        other => return Some(other),
    }
    None
}

// ---------------------------------------------------------------------------
// Bot entry point
// ---------------------------------------------------------------------------

/// Connect to the Discord gateway and run the event loop.
///
/// Only returns once the gateway driver has given up, which is always an
/// error from the caller's point of view.
pub async fn run(config: BotConfig) -> Result<()> {
    let http = DiscordHttpClient::new(config.token.clone())?;

    let GatewayHandle {
        sender,
        mut events,
        driver,
    } = gateway::spawn(GatewayConfig {
        token: config.token.clone(),
        intents: Intents::presence_bot(),
    });

    let (voice, mut drops) = VoiceManager::new(sender);
    let mut ctx = BotContext::new(config, DiscordSurface::new(http), voice);

    if ctx.config.is_open() {
        warn!("COMMAND_USERS is empty, any member of a shared guild can command the bot");
    }
    info!(prefix = %ctx.config.prefix, "gateway started, entering event loop");

    // ----- Main event loop -----
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                dispatch(&mut ctx, event).await;
            }
            Some(notice) = drops.recv() => handlers::on_voice_drop(&mut ctx, &notice),
        }
    }

    warn!("event stream ended, bot shutting down");
    if let Err(e) = driver.await {
        warn!(error = %e, "gateway driver task failed");
    }
    Err(GatewayError::Closed.into())
}

async fn dispatch(ctx: &mut BotContext<DiscordSurface, VoiceManager>, event: GatewayEvent) {
    let Some(event) = apply_to_cache(&mut ctx.surface.cache, event) else {
        return;
    };

    match event {
        GatewayEvent::Ready(ready) => {
            ctx.voice.backend_mut().set_user_id(ready.user.id.clone());
            handlers::on_ready(ctx, &ready).await;
        }

        GatewayEvent::MessageCreate(msg) => handlers::on_message(ctx, &msg).await,

        // Voice dispatches reach the voice manager over the gateway's
        // broadcast channel; heartbeats and session control stay in the
        // driver.
        GatewayEvent::VoiceStateUpdate(_) | GatewayEvent::VoiceServerUpdate(_) => {}

        GatewayEvent::Unknown {
            event_name: Some(ref name),
            ..
        } => {
            trace!(event = %name, "unhandled gateway event");
        }

        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
