pub mod bridge;

use crate::credentials::CredentialState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub type ConnectionHandle = Arc<dyn Connection>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport is closed")]
    Closed,
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub browser: Vec<String>,
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Composing,
    Paused,
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn send_message(&self, to: &str, text: &str) -> Result<(), TransportError>;
    async fn send_presence(&self, to: &str, presence: Presence) -> Result<(), TransportError>;
    async fn logout(&self) -> Result<(), TransportError>;
    fn end(&self);
}

pub struct OpenedConnection {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        options: &ConnectOptions,
        credentials: CredentialState,
    ) -> Result<OpenedConnection, TransportError>;
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    CredentialsUpdated(CredentialState),
    ConnectionUpdate(ConnectionUpdate),
    Messages(Vec<InboundEnvelope>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionSignal {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub connection: Option<ConnectionSignal>,
    /// Shape is not guaranteed by the protocol; read via [`disconnect_status_code`].
    #[serde(default)]
    pub last_disconnect: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<ExtendedText>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessageContent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundText {
    pub from: String,
    pub text: String,
}

impl InboundEnvelope {
    pub fn text_message(&self) -> Option<InboundText> {
        let message = self.message.as_ref()?;
        if self.key.from_me {
            return None;
        }
        let from = self.key.remote_jid.as_deref()?;

        let text = message
            .conversation
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| {
                message
                    .extended_text_message
                    .as_ref()
                    .and_then(|ext| ext.text.as_deref())
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return None;
        }

        Some(InboundText {
            from: from.to_string(),
            text: text.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    BadSession,
    Replaced,
    RateLimited,
    Blocked,
    Other(Option<u16>),
}

impl DisconnectReason {
    pub const LOGGED_OUT: u16 = 401;
    pub const BLOCKED: u16 = 405;
    pub const RATE_LIMITED: u16 = 429;
    pub const REPLACED: u16 = 440;
    pub const BAD_SESSION: u16 = 500;

    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(Self::LOGGED_OUT) => Self::LoggedOut,
            Some(Self::BAD_SESSION) => Self::BadSession,
            Some(Self::REPLACED) => Self::Replaced,
            Some(Self::RATE_LIMITED) => Self::RateLimited,
            Some(Self::BLOCKED) => Self::Blocked,
            other => Self::Other(other),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::LoggedOut => Some(Self::LOGGED_OUT),
            Self::BadSession => Some(Self::BAD_SESSION),
            Self::Replaced => Some(Self::REPLACED),
            Self::RateLimited => Some(Self::RATE_LIMITED),
            Self::Blocked => Some(Self::BLOCKED),
            Self::Other(code) => *code,
        }
    }
}

pub fn disconnect_status_code(last_disconnect: &serde_json::Value) -> Option<u16> {
    const PATHS: [&[&str]; 4] = [
        &["error", "output", "statusCode"],
        &["error", "data", "statusCode"],
        &["error", "statusCode"],
        &["statusCode"],
    ];

    PATHS.iter().find_map(|path| {
        let value = path
            .iter()
            .try_fold(last_disconnect, |node, key| node.get(key))?;
        as_status_code(value)
    })
}

fn as_status_code(value: &serde_json::Value) -> Option<u16> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn disconnect_message(last_disconnect: &serde_json::Value) -> String {
    last_disconnect
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("Connection Failure")
        .to_string()
}

// only the supervisor replaces or clears this
#[derive(Clone, Default)]
pub struct ConnectionCell {
    inner: Arc<Mutex<Option<ConnectionHandle>>>,
}

impl ConnectionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ConnectionHandle> {
        self.lock().clone()
    }

    pub(crate) fn replace(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.lock().replace(handle)
    }

    pub(crate) fn take(&self) -> Option<ConnectionHandle> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ConnectionHandle>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
