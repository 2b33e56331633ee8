//! Production [`Connector`] over a tokio-tungstenite websocket.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, warn};

use crate::connection::{Connector, Link};
use crate::error::ConnectionError;
use crate::protocol::{ClientFrame, ServerFrame};

/// Tunables for opening the websocket.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    options: ConnectOptions,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_options(url, ConnectOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: ConnectOptions) -> Self {
        Self {
            url: url.into(),
            options,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, ConnectionError> {
        let (ws_stream, _) = tokio::time::timeout(
            self.options.connect_timeout,
            tokio_tungstenite::connect_async(&self.url),
        )
        .await
        .map_err(|_| {
            ConnectionError::Unreachable(format!(
                "timed out after {:?} connecting to {}",
                self.options.connect_timeout, self.url
            ))
        })?
        .map_err(ConnectionError::from_tungstenite)?;

        debug!(url = %self.url, "Websocket established");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerFrame>();

        // Writer: drains frames until the session drops its sender, then closes.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(e) => {
                        error!("Failed to serialize frame: {}", e);
                        continue;
                    }
                };
                if ws_write
                    .send(tungstenite::Message::Text(json.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: ends (dropping `inbound_tx`) when the socket closes.
        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(tungstenite::Message::Text(text)) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if inbound_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Ignoring malformed frame: {}", e),
                        }
                    }
                    Ok(tungstenite::Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Websocket read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
