//! Startup configuration read from the environment (and `.env`).
//!
//! Everything is read once. A missing or malformed required value is a
//! [`ConfigError`]; the binary turns that into an immediate exit before any
//! connection is opened.

use std::collections::HashSet;

use crate::types::Snowflake;

pub const DEFAULT_PREFIX: &str = "!";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set in environment or .env file")]
    Missing(&'static str),

    #[error("{key} is not a valid channel or user id: {value:?}")]
    InvalidId { key: &'static str, value: String },

    #[error("COMMAND_PREFIX must not be empty")]
    EmptyPrefix,
}

/// Self-mute / self-deafen flags applied with every voice-state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceFlags {
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl Default for VoiceFlags {
    fn default() -> Self {
        Self {
            self_mute: true,
            self_deaf: false,
        }
    }
}

#[derive(Clone)]
pub struct BotConfig {
    pub token: String,
    /// Fallback target for `join` and the auto-join target.
    pub default_channel_id: u64,
    pub prefix: String,
    pub auto_join: bool,
    pub voice_flags: VoiceFlags,
    /// Users allowed to issue commands. Empty means anyone.
    pub command_users: HashSet<Snowflake>,
}

impl BotConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("DISCORD_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let raw_channel = lookup("DEFAULT_VC_ID")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DEFAULT_VC_ID"))?;
        let default_channel_id = parse_id("DEFAULT_VC_ID", &raw_channel)?;

        let prefix = lookup("COMMAND_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        if prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }

        let command_users = match lookup("COMMAND_USERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_id("COMMAND_USERS", s).map(|id| id.to_string()))
                .collect::<Result<HashSet<_>, _>>()?,
            None => HashSet::new(),
        };

        Ok(Self {
            token,
            default_channel_id,
            prefix,
            auto_join: flag(&lookup, "AUTO_JOIN", false),
            voice_flags: VoiceFlags {
                self_mute: flag(&lookup, "SELF_MUTE", true),
                self_deaf: flag(&lookup, "SELF_DEAF", false),
            },
            command_users,
        })
    }

    pub fn default_channel(&self) -> Snowflake {
        self.default_channel_id.to_string()
    }

    /// No `COMMAND_USERS` configured: every guild member may command.
    pub fn is_open(&self) -> bool {
        self.command_users.is_empty()
    }

    pub fn may_command(&self, user_id: &str) -> bool {
        self.is_open() || self.command_users.contains(user_id)
    }
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("token", &"[REDACTED]")
            .field("default_channel_id", &self.default_channel_id)
            .field("prefix", &self.prefix)
            .field("auto_join", &self.auto_join)
            .field("voice_flags", &self.voice_flags)
            .field("command_users", &self.command_users)
            .finish()
    }
}

/// `true` iff the value is `true`, ignoring case. Unset keeps the default.
fn flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_id(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .ok_or_else(|| ConfigError::InvalidId {
            key,
            value: raw.to_string(),
        })
}
