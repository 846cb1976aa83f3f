//! What the bot believes about its voice membership.
//!
//! The belief is not checked against the gateway. It is corrected only by
//! the join/leave paths and by voice-drop reconciliation in the bot loop.

use chrono::{DateTime, Utc};

use crate::types::Snowflake;

pub const NOT_CONNECTED: &str = "Not connected to any voice channel.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusTracker {
    /// Set iff we believe a voice connection is up.
    pub connected_since: Option<DateTime<Utc>>,
    pub target_channel_id: Option<Snowflake>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected_since.is_some()
    }

    pub fn mark_connected(&mut self, channel_id: impl Into<Snowflake>, at: DateTime<Utc>) {
        self.connected_since = Some(at);
        self.target_channel_id = Some(channel_id.into());
    }

    pub fn clear(&mut self) {
        self.connected_since = None;
        self.target_channel_id = None;
    }

    /// Whole seconds connected as of `now`; a clock step backwards reads as 0.
    pub fn uptime_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        self.connected_since
            .map(|since| now.signed_duration_since(since).num_seconds().max(0) as u64)
    }
}

/// `HH:MM:SS`; hours keep growing past 99.
pub fn format_uptime(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// The status reply. `channel_name` is only consulted when connected.
pub fn status_message(tracker: &StatusTracker, now: DateTime<Utc>, channel_name: &str) -> String {
    match tracker.uptime_secs(now) {
        Some(secs) => format!("Connected to #{channel_name} for {}", format_uptime(secs)),
        None => NOT_CONNECTED.to_string(),
    }
}
