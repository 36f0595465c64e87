//! WebSocket hub for the progress push channel.
//!
//! One socket can watch any number of scans. The client sends method
//! envelopes (`SubscribeToScan`, `UnsubscribeFromScan`,
//! `GetCurrentProgress`); the server forwards each subscribed group's
//! messages plus the global stats feed. A subscriber that falls behind its
//! group simply misses the gap — the protocol contract is that clients call
//! `GetCurrentProgress` after any reconnect or lag.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::stats::LiveStatsTracker;
use crate::store::ScanStore;

use super::{ProgressBroadcaster, ScanServerMessage, snapshot_for};

/// Outbound buffer per socket; a dead client is dropped once it fills.
const SOCKET_BUFFER: usize = 64;

/// Subscriber → server methods.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "PascalCase")]
enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SubscribeToScan { scan_id: Uuid },
    #[serde(rename_all = "camelCase")]
    UnsubscribeFromScan { scan_id: Uuid },
    #[serde(rename_all = "camelCase")]
    GetCurrentProgress { scan_id: Uuid },
}

/// Shared state behind the `/hubs/scanprogress` route.
pub struct ScanProgressHub {
    pub store: ScanStore,
    pub tracker: Arc<LiveStatsTracker>,
    pub broadcaster: Arc<ProgressBroadcaster>,
}

impl ScanProgressHub {
    /// Drive one socket until the client goes away.
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket) {
        let (out_tx, mut out_rx) = mpsc::channel::<ScanServerMessage>(SOCKET_BUFFER);
        let mut subscriptions: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

        // Every socket gets the global stats feed.
        let stats_forward = spawn_forwarder(self.broadcaster.subscribe_stats(), out_tx.clone());

        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    let Some(message) = outbound else { break };
                    let Ok(text) = serde_json::to_string(&message) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                inbound = socket.recv() => {
                    let Some(Ok(frame)) = inbound else { break };
                    let Message::Text(text) = frame else { continue };
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => {
                            self.handle_client_message(message, &mut subscriptions, &out_tx)
                                .await;
                        }
                        Err(e) => debug!("ignoring malformed hub frame: {e}"),
                    }
                }
            }
        }

        stats_forward.abort();
        for (_, task) in subscriptions {
            task.abort();
        }
        debug!("hub socket closed");
    }

    async fn handle_client_message(
        &self,
        message: ClientMessage,
        subscriptions: &mut HashMap<Uuid, JoinHandle<()>>,
        out_tx: &mpsc::Sender<ScanServerMessage>,
    ) {
        match message {
            ClientMessage::SubscribeToScan { scan_id } => {
                if subscriptions.contains_key(&scan_id) {
                    return;
                }
                let receiver = self.broadcaster.subscribe_scan(scan_id);
                subscriptions.insert(scan_id, spawn_forwarder(receiver, out_tx.clone()));
                debug!(%scan_id, "socket subscribed");
            }
            ClientMessage::UnsubscribeFromScan { scan_id } => {
                // Unknown subscriptions are ignored by design.
                if let Some(task) = subscriptions.remove(&scan_id) {
                    task.abort();
                    debug!(%scan_id, "socket unsubscribed");
                }
            }
            ClientMessage::GetCurrentProgress { scan_id } => {
                match snapshot_for(&self.store, &self.tracker, scan_id).await {
                    Ok(snapshot) => {
                        let _ = out_tx
                            .send(ScanServerMessage::CurrentProgress { snapshot })
                            .await;
                    }
                    Err(e) => warn!(%scan_id, error = %e, "snapshot failed"),
                }
            }
        }
    }
}

/// Pump one broadcast receiver into the socket's outbound queue. Lag is
/// swallowed (the client resyncs); a full socket buffer ends the forwarder,
/// which ends the socket.
fn spawn_forwarder(
    mut receiver: tokio::sync::broadcast::Receiver<ScanServerMessage>,
    out_tx: mpsc::Sender<ScanServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    if out_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "subscriber lagged; client must resync");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_envelope_parses_signalr_style_methods() {
        let raw = r#"{"method":"SubscribeToScan","scanId":"6f2c1e08-9f9f-4ad1-8b62-2f8e6cbb0001"}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ClientMessage::SubscribeToScan { .. }));

        let raw = r#"{"method":"GetCurrentProgress","scanId":"6f2c1e08-9f9f-4ad1-8b62-2f8e6cbb0001"}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ClientMessage::GetCurrentProgress { .. }));
    }

    #[test]
    fn unknown_methods_are_rejected() {
        let raw = r#"{"method":"Explode","scanId":"6f2c1e08-9f9f-4ad1-8b62-2f8e6cbb0001"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }
}
