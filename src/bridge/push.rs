//! Pushed status events from the delegate's WebSocket channel

use futures::stream::StreamExt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use super::RemoteStatus;

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30000;
const CHANNEL_CAPACITY: usize = 256;

/// Keeps a WebSocket connection to `{base}/ws` open and rebroadcasts every
/// `workflow_update` message as a [`RemoteStatus`]. Reconnects with
/// exponential backoff. The listener task stops when this is dropped.
#[derive(Debug)]
pub struct PushListener {
    tx: broadcast::Sender<RemoteStatus>,
    handle: JoinHandle<()>,
}

impl PushListener {
    pub fn start(base_url: &str) -> Self {
        let ws_url = ws_url(base_url);
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let sender = tx.clone();

        let handle = tokio::spawn(async move {
            let mut backoff_ms = INITIAL_BACKOFF_MS;

            loop {
                match connect_async(&ws_url).await {
                    Ok((mut ws_stream, _)) => {
                        backoff_ms = INITIAL_BACKOFF_MS;
                        tracing::debug!("Connected to delegate event channel");

                        while let Some(message) = ws_stream.next().await {
                            match message {
                                Ok(Message::Text(text)) => {
                                    if let Some(status) = parse_update(&text) {
                                        // no receivers is fine
                                        let _ = sender.send(status);
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!("WebSocket error: {}, reconnecting...", e);
                                    break;
                                }
                            }
                        }
                        tracing::debug!("Delegate event channel closed, reconnecting...");
                    }
                    Err(e) => {
                        tracing::debug!("Failed to connect to delegate event channel: {}", e);
                    }
                }

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        });

        Self { tx, handle }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RemoteStatus> {
        self.tx.subscribe()
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn ws_url(base_url: &str) -> String {
    let base = base_url
        .trim_end_matches('/')
        .replace("http://", "ws://")
        .replace("https://", "wss://");
    format!("{}/ws", base)
}

/// Decode one channel message; anything but a well-formed
/// `workflow_update` yields `None`
pub(crate) fn parse_update(text: &str) -> Option<RemoteStatus> {
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    if json.get("type").and_then(|t| t.as_str()) != Some("workflow_update") {
        return None;
    }
    match serde_json::from_value(json) {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!("Ignoring malformed workflow update: {}", e);
            None
        }
    }
}
