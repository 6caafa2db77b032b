use super::{
    Connection, ConnectionSignal, ConnectionUpdate, ConnectOptions, InboundEnvelope,
    OpenedConnection, Presence, Transport, TransportError, TransportEvent,
};
use crate::credentials::CredentialState;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};

const EVENT_BUFFER: usize = 64;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(1);
const LOGOUT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct Outbound {
    json: String,
    written: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Auth {
        credentials: &'a CredentialState,
        browser: &'a [String],
        connect_timeout_ms: u64,
        keep_alive_interval_ms: u64,
    },
    SendMessage {
        id: String,
        to: &'a str,
        text: &'a str,
    },
    Presence {
        to: &'a str,
        state: Presence,
    },
    Logout,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    CredsUpdate {
        #[serde(default)]
        credentials: CredentialState,
    },
    ConnectionUpdate(ConnectionUpdate),
    MessagesUpsert {
        #[serde(default)]
        messages: Vec<InboundEnvelope>,
    },
}

impl From<BridgeFrame> for TransportEvent {
    fn from(frame: BridgeFrame) -> Self {
        match frame {
            BridgeFrame::CredsUpdate { credentials } => Self::CredentialsUpdated(credentials),
            BridgeFrame::ConnectionUpdate(update) => Self::ConnectionUpdate(update),
            BridgeFrame::MessagesUpsert { messages } => Self::Messages(messages),
        }
    }
}

fn parse_frame(text: &str) -> Option<TransportEvent> {
    match serde_json::from_str::<BridgeFrame>(text) {
        Ok(frame) => Some(frame.into()),
        Err(err) => {
            tracing::debug!(error = %err, "ignoring unparseable bridge frame");
            None
        }
    }
}

fn closed_update() -> TransportEvent {
    TransportEvent::ConnectionUpdate(ConnectionUpdate {
        connection: Some(ConnectionSignal::Close),
        ..Default::default()
    })
}

#[derive(Debug, Clone)]
pub struct BridgeTransport {
    url: String,
}

impl BridgeTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub async fn attach<S>(
        mut ws: WebSocketStream<S>,
        options: &ConnectOptions,
        credentials: CredentialState,
    ) -> Result<OpenedConnection, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let auth = serde_json::to_string(&ClientFrame::Auth {
            credentials: &credentials,
            browser: &options.browser,
            connect_timeout_ms: options.connect_timeout.as_millis() as u64,
            keep_alive_interval_ms: options.keep_alive_interval.as_millis() as u64,
        })?;
        ws.send(Message::Text(auth))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let keep_alive = options.keep_alive_interval.max(MIN_KEEP_ALIVE);
        let task = tokio::spawn(pump(ws, outbound_rx, events_tx, keep_alive));

        Ok(OpenedConnection {
            handle: Arc::new(BridgeConnection {
                outbound: outbound_tx,
                task: Mutex::new(Some(task)),
            }),
            events: events_rx,
        })
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn open(
        &self,
        options: &ConnectOptions,
        credentials: CredentialState,
    ) -> Result<OpenedConnection, TransportError> {
        tracing::info!(url = %self.url, "connecting to protocol bridge");
        let (ws, _) = tokio::time::timeout(options.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Connect("timed out".to_string()))?
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Self::attach(ws, options, credentials).await
    }
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::Sender<TransportEvent>,
    keep_alive: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval(keep_alive);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(event) = parse_frame(&text) else {
                            continue;
                        };
                        if events.send(event).await.is_err() {
                            tracing::debug!("bridge listener gone, closing pump");
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "bridge closed the socket");
                        break;
                    }
                    None => {
                        tracing::info!("bridge socket ended");
                        break;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "bridge read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            Some(Outbound { json, written }) = outbound.recv() => {
                if let Err(err) = write.send(Message::Text(json)).await {
                    tracing::warn!(error = %err, "bridge write error");
                    break;
                }
                if let Some(written) = written {
                    let _ = written.send(());
                }
            }
            _ = ping.tick() => {
                if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                    tracing::warn!(error = %err, "bridge keep-alive failed");
                    break;
                }
            }
        }
    }

    let _ = events.send(closed_update()).await;
}

pub struct BridgeConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeConnection {
    fn queue(
        &self,
        frame: &ClientFrame<'_>,
        written: Option<oneshot::Sender<()>>,
    ) -> Result<(), TransportError> {
        let json = serde_json::to_string(frame)?;
        self.outbound
            .send(Outbound { json, written })
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Connection for BridgeConnection {
    async fn send_message(&self, to: &str, text: &str) -> Result<(), TransportError> {
        self.queue(
            &ClientFrame::SendMessage {
                id: uuid::Uuid::new_v4().to_string(),
                to,
                text,
            },
            None,
        )
    }

    async fn send_presence(&self, to: &str, presence: Presence) -> Result<(), TransportError> {
        self.queue(
            &ClientFrame::Presence {
                to,
                state: presence,
            },
            None,
        )
    }

    // resolves once the frame is on the wire, so a following end() cannot drop it
    async fn logout(&self) -> Result<(), TransportError> {
        let (written_tx, written_rx) = oneshot::channel();
        self.queue(&ClientFrame::Logout, Some(written_tx))?;
        match tokio::time::timeout(LOGOUT_WRITE_TIMEOUT, written_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Send("logout not written in time".to_string())),
        }
    }

    fn end(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.end();
    }
}
