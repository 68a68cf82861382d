use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock as AsyncRwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{RawTransport, TransportConnector};
use crate::error::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket implementation of [`RawTransport`].
pub struct WebSocketTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: AsyncRwLock<mpsc::UnboundedReceiver<Vec<u8>>>,
    connected: Arc<AsyncRwLock<bool>>,
    ws_task: Option<tokio::task::JoinHandle<()>>,
}

impl WebSocketTransport {
    pub async fn connect(url: &Url) -> Result<Self, TransportError> {
        let connect = connect_async(url.as_str());
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))?
            .map_err(|err| TransportError::Socket(err.to_string()))?;

        let (tx_out, rx_out) = mpsc::unbounded_channel::<Vec<u8>>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<Vec<u8>>();

        let connected = Arc::new(AsyncRwLock::new(true));
        let connected_clone = connected.clone();

        let ws_task = tokio::spawn(async move {
            pump_websocket(ws_stream, rx_out, tx_in, connected_clone).await;
        });

        Ok(Self {
            tx: tx_out,
            rx: AsyncRwLock::new(rx_in),
            connected,
            ws_task: Some(ws_task),
        })
    }
}

#[async_trait]
impl RawTransport for WebSocketTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ChannelClosed);
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        let mut rx = self.rx.write().await;
        rx.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected
            .try_read()
            .map(|guard| *guard)
            .unwrap_or(false)
    }
}

async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Vec<u8>>,
    tx_in: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AsyncRwLock<bool>>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(data) = rx_out.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if tx_in.send(text.into_bytes()).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                if tx_in.send(data).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => {
                break;
            }
            _ => {}
        }
    }

    *connected.write().await = false;
    send_task.abort();
    let _ = send_task.await;
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.ws_task.take() {
            task.abort();
        }
    }
}

/// Production connector: dials the configured relay URL.
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(relay_url: &Url) -> Result<Self, TransportError> {
        let mut url = relay_url.clone();
        match url.scheme() {
            "ws" | "wss" => {}
            "http" => url
                .set_scheme("ws")
                .map_err(|_| TransportError::InvalidUrl("cannot derive ws url".into()))?,
            "https" => url
                .set_scheme("wss")
                .map_err(|_| TransportError::InvalidUrl("cannot derive wss url".into()))?,
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported relay scheme: {other}"
                )));
            }
        }
        Ok(Self { url })
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn RawTransport>, TransportError> {
        let transport = WebSocketTransport::connect(&self.url).await?;
        Ok(Box::new(transport))
    }
}
