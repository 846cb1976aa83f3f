//! In-memory channel directory fed by gateway events.
//!
//! `GUILD_CREATE` seeds a guild's channels and `CHANNEL_*` events keep them
//! current, so resolving a join target usually costs no REST call.

use std::collections::HashMap;

use tracing::debug;

use crate::types::*;

#[derive(Debug, Default)]
pub struct ChannelCache {
    channels: HashMap<Snowflake, Channel>,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything we know about `guild` with its fresh channel list.
    pub fn insert_guild(&mut self, guild: Guild) {
        if guild.unavailable {
            return;
        }
        self.remove_guild(&guild.id);
        let count = guild.channels.len();
        for mut channel in guild.channels {
            channel.guild_id.get_or_insert_with(|| guild.id.clone());
            self.channels.insert(channel.id.clone(), channel);
        }
        debug!(guild_id = %guild.id, channels = count, "cached guild channels");
    }

    pub fn remove_guild(&mut self, guild_id: &str) {
        self.channels
            .retain(|_, c| c.guild_id.as_deref() != Some(guild_id));
    }

    pub fn upsert(&mut self, channel: Channel) {
        self.channels.insert(channel.id.clone(), channel);
    }

    pub fn remove(&mut self, channel_id: &str) -> Option<Channel> {
        self.channels.remove(channel_id)
    }

    pub fn get(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
