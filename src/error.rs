use crate::config::ConfigError;
use crate::http::HttpError;

/// Gateway transport failures surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("gateway handshake: {0}")]
    Handshake(String),

    #[error("gateway payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("gateway driver has shut down")]
    Closed,
}

/// Voice join/leave failures. Reported to the controller, never to users.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("own user id unknown; READY not received yet")]
    NotReady,

    #[error("channel {0} does not belong to a guild")]
    NoGuild(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("voice signalling: {0}")]
    Signalling(String),

    #[error("voice websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("voice payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Top-level error returned by [`crate::bot::run`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Http(#[from] HttpError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
