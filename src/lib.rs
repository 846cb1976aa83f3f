//! AFK voice presence bot for Discord.
//!
//! Keeps an account parked in one voice channel and answers three prefix
//! commands: `join [channelId]`, `leave`, and `status`. Transport lives in
//! `gateway` (WebSocket), `voice` (voice signalling) and `http` (REST); the
//! bot logic lives in `handlers` and `controller`, driven by [`bot::run`].

pub mod bot;
pub mod cache;
pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod http;
pub mod status;
pub mod types;
pub mod voice;

#[cfg(test)]
mod testing;

pub use config::BotConfig;
pub use error::{Error, Result};
