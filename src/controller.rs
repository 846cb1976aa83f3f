//! Voice membership: the join and leave transitions and the status tracker
//! updates that go with them.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::VoiceFlags;
use crate::error::VoiceError;
use crate::status::StatusTracker;
use crate::types::Channel;
use crate::voice::{VoiceBackend, VoiceDrop};

/// Result of a join attempt. Failures are already logged.
#[must_use]
#[derive(Debug)]
pub enum JoinOutcome {
    Joined { since: DateTime<Utc> },
    Failed(VoiceError),
}

impl JoinOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JoinOutcome::Joined { .. })
    }
}

pub struct VoiceController<V> {
    backend: V,
    flags: VoiceFlags,
}

impl<V: VoiceBackend> VoiceController<V> {
    pub fn new(backend: V, flags: VoiceFlags) -> Self {
        Self { backend, flags }
    }

    pub fn backend(&self) -> &V {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut V {
        &mut self.backend
    }

    /// Move into `channel`, replacing any session in its guild.
    ///
    /// `status` is only written when the connect and the flag update both
    /// succeed.
    pub async fn join(&mut self, status: &mut StatusTracker, channel: &Channel) -> JoinOutcome {
        let name = channel.name_or_unknown();
        let Some(guild_id) = channel.guild_id.as_deref() else {
            let err = VoiceError::NoGuild(channel.id.clone());
            error!(channel = %name, error = %err, "failed to join voice channel");
            return JoinOutcome::Failed(err);
        };

        match self.try_join(guild_id, channel).await {
            Ok(()) => {
                let since = Utc::now();
                status.mark_connected(channel.id.clone(), since);
                info!(
                    channel = %name,
                    channel_id = %channel.id,
                    self_mute = self.flags.self_mute,
                    self_deaf = self.flags.self_deaf,
                    "joined voice channel"
                );
                JoinOutcome::Joined { since }
            }
            Err(e) => {
                error!(channel = %name, channel_id = %channel.id, error = %e, "failed to join voice channel");
                JoinOutcome::Failed(e)
            }
        }
    }

    async fn try_join(&mut self, guild_id: &str, channel: &Channel) -> Result<(), VoiceError> {
        if self.backend.is_connected(guild_id) {
            debug!(guild_id, "dropping existing voice session before join");
            self.backend.disconnect(guild_id, true).await?;
        }

        info!(channel = %channel.name_or_unknown(), channel_id = %channel.id, "connecting to voice");
        self.backend.connect(guild_id, &channel.id).await?;
        self.backend
            .set_state(guild_id, &channel.id, self.flags)
            .await
    }

    /// Clear `status`, then leave the invoking guild's voice channel if we
    /// are in one. Errors are logged and swallowed.
    pub async fn leave(&mut self, status: &mut StatusTracker, guild_id: Option<&str>) {
        status.clear();

        let Some(guild_id) = guild_id.filter(|g| self.backend.is_connected(g)) else {
            info!("not currently in a voice channel");
            return;
        };

        match self.backend.disconnect(guild_id, false).await {
            Ok(()) => info!(guild_id, "disconnected from voice by command"),
            Err(e) => warn!(guild_id, error = %e, "voice disconnect failed"),
        }
    }

    /// Apply a voice drop reported by the backend. Returns whether it
    /// referred to the live session.
    pub fn reconcile_drop(&mut self, status: &mut StatusTracker, notice: &VoiceDrop) -> bool {
        if !self.backend.forget_dropped(notice) {
            debug!(guild_id = %notice.guild_id, serial = notice.serial, "ignoring stale voice drop");
            return false;
        }

        warn!(
            guild_id = %notice.guild_id,
            channel_id = %notice.channel_id,
            reason = %notice.reason,
            "voice connection dropped"
        );
        if status.target_channel_id.as_deref() == Some(notice.channel_id.as_str()) {
            status.clear();
        }
        true
    }
}
