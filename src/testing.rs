//! In-memory fakes for the voice and chat seams, plus a loopback websocket
//! server for driving the gateway and voice sockets.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::config::VoiceFlags;
use crate::error::VoiceError;
use crate::handlers::ChatSurface;
use crate::http::HttpError;
use crate::types::*;
use crate::voice::{VoiceBackend, VoiceDrop};

pub fn channel(guild_id: &str, id: &str, name: &str, kind: ChannelType) -> Channel {
    Channel {
        id: id.to_string(),
        kind,
        guild_id: Some(guild_id.to_string()),
        name: Some(name.to_string()),
        position: None,
        parent_id: None,
    }
}

pub fn voice_channel(guild_id: &str, id: &str, name: &str) -> Channel {
    channel(guild_id, id, name, ChannelType::GuildVoice)
}

/// Records every call as a short string; each operation can be made to fail.
#[derive(Debug, Default)]
pub struct FakeVoice {
    pub calls: Vec<String>,
    pub connected: HashMap<Snowflake, Snowflake>,
    pub serial: u64,
    serials: HashMap<Snowflake, u64>,
    pub fail_connect: bool,
    pub fail_set_state: bool,
    pub fail_disconnect: bool,
}

#[async_trait]
impl VoiceBackend for FakeVoice {
    fn is_connected(&self, guild_id: &str) -> bool {
        self.connected.contains_key(guild_id)
    }

    async fn connect(&mut self, guild_id: &str, channel_id: &str) -> Result<(), VoiceError> {
        self.calls.push(format!("connect {guild_id} {channel_id}"));
        if self.fail_connect {
            return Err(VoiceError::Timeout("voice state and server updates"));
        }
        self.serial += 1;
        self.serials.insert(guild_id.to_string(), self.serial);
        self.connected
            .insert(guild_id.to_string(), channel_id.to_string());
        Ok(())
    }

    async fn disconnect(&mut self, guild_id: &str, force: bool) -> Result<(), VoiceError> {
        self.calls.push(format!("disconnect {guild_id} force={force}"));
        self.connected.remove(guild_id);
        self.serials.remove(guild_id);
        if self.fail_disconnect {
            return Err(VoiceError::Signalling("close handshake failed".into()));
        }
        Ok(())
    }

    async fn set_state(
        &mut self,
        guild_id: &str,
        channel_id: &str,
        flags: VoiceFlags,
    ) -> Result<(), VoiceError> {
        self.calls.push(format!(
            "set_state {guild_id} {channel_id} mute={} deaf={}",
            flags.self_mute, flags.self_deaf
        ));
        if self.fail_set_state {
            return Err(VoiceError::Signalling("state update rejected".into()));
        }
        Ok(())
    }

    fn forget_dropped(&mut self, notice: &VoiceDrop) -> bool {
        if self.serials.get(&notice.guild_id) != Some(&notice.serial) {
            return false;
        }
        self.serials.remove(&notice.guild_id);
        self.connected.remove(&notice.guild_id);
        true
    }
}

/// A channel directory plus an outbox of sent messages.
#[derive(Debug, Default)]
pub struct FakeSurface {
    pub channels: HashMap<Snowflake, Channel>,
    pub lookups: Vec<Snowflake>,
    pub sent: Vec<(Snowflake, String)>,
    pub failing_sends: HashSet<Snowflake>,
}

impl FakeSurface {
    pub fn with(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: channels.into_iter().map(|c| (c.id.clone(), c)).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ChatSurface for FakeSurface {
    async fn channel(&mut self, channel_id: &str) -> Option<Channel> {
        self.lookups.push(channel_id.to_string());
        self.channels.get(channel_id).cloned()
    }

    async fn say(&mut self, channel_id: &str, content: &str) -> Result<(), HttpError> {
        if self.failing_sends.contains(channel_id) {
            return Err(HttpError::Api {
                status: 403,
                body: "Missing Permissions".into(),
                route: format!("POST /channels/{channel_id}/messages"),
            });
        }
        self.sent.push((channel_id.to_string(), content.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loopback websocket server
// ---------------------------------------------------------------------------

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Accept one client on a loopback port and run `script` against it.
/// Returns the `ws://` address and the server task.
pub async fn local_socket<F, Fut, T>(script: F) -> (String, JoinHandle<T>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        script(ws).await
    });
    (format!("ws://{addr}"), server)
}

pub async fn send_json(ws: &mut ServerSocket, value: serde_json::Value) {
    ws.send(WsMessage::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Next text frame as JSON; `None` once the client closes or goes away.
pub async fn recv_json(ws: &mut ServerSocket) -> Option<serde_json::Value> {
    while let Some(frame) = ws.next().await {
        match frame.ok()? {
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            WsMessage::Close(_) => return None,
            _ => {}
        }
    }
    None
}
