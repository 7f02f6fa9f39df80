//! Websocket transport
//!
//! [`RealtimeHub`] ties the session manager and subscription registry to axum
//! websockets. Each connection runs one loop multiplexing client frames, live
//! events of its subscriptions, keep-alive pings and the init deadline.

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn, Instrument};

use pulse_common::logging::LogContext;
use pulse_events::LiveEvent;

use crate::identity::TokenVerifier;
use crate::protocol::{close_code, ProtocolSession, Reply, ServerMessage, SUBPROTOCOL};
use crate::registry::SubscriptionRegistry;
use crate::session::ConnectionSessionManager;

/// Realtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Server ping interval; a connection silent for two intervals is dropped
    pub keep_alive_secs: u64,
    /// Time allowed between upgrade and `connection_init`
    pub init_timeout_secs: u64,
    /// Per-subscription delivery buffer
    pub subscription_buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 15,
            init_timeout_secs: 10,
            subscription_buffer: 64,
        }
    }
}

/// One item from a subscription's forwarding stream; `None` marks its end
type Forwarded = (String, String, Option<LiveEvent>);

pub struct RealtimeHub {
    sessions: Arc<ConnectionSessionManager>,
    registry: Arc<SubscriptionRegistry>,
    config: RealtimeConfig,
    connections: AtomicUsize,
}

impl RealtimeHub {
    pub fn new(verifier: Arc<dyn TokenVerifier>, config: RealtimeConfig) -> Self {
        Self {
            sessions: Arc::new(ConnectionSessionManager::new(verifier)),
            registry: Arc::new(SubscriptionRegistry::new(config.subscription_buffer)),
            config,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Accept a websocket upgrade speaking `graphql-transport-ws`
    pub fn upgrade(self: Arc<Self>, ws: WebSocketUpgrade) -> Response {
        ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| {
            let span = LogContext::with_operation("realtime", "connection").span();
            async move { self.serve(socket).await }.instrument(span)
        })
    }

    pub async fn serve(&self, mut socket: WebSocket) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        let mut protocol = ProtocolSession::new(self.sessions.clone(), self.registry.clone());
        let mut streams: SelectAll<BoxStream<'static, Forwarded>> = SelectAll::new();

        let keep_alive = Duration::from_secs(self.config.keep_alive_secs.max(1));
        let mut ticker = interval_at(Instant::now() + keep_alive, keep_alive);
        let init_deadline = tokio::time::sleep(Duration::from_secs(self.config.init_timeout_secs.max(1)));
        tokio::pin!(init_deadline);
        let mut last_seen = Instant::now();

        'conn: loop {
            tokio::select! {
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            for reply in protocol.on_text(&text).await {
                                match reply {
                                    Reply::Send(message) => {
                                        if send_frame(&mut socket, &message).await.is_err() {
                                            break 'conn;
                                        }
                                    }
                                    Reply::Subscribed { id, subscription_id, receiver } => {
                                        streams.push(forward(id, subscription_id, receiver));
                                    }
                                    Reply::Close { code, reason } => {
                                        close(&mut socket, code, reason).await;
                                        break 'conn;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_seen = Instant::now();
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => last_seen = Instant::now(),
                        Some(Ok(Message::Binary(_))) => {
                            close(&mut socket, close_code::BAD_REQUEST, "Binary frames are not supported".to_string()).await;
                            break;
                        }
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    }
                }
                Some((id, subscription_id, event)) = streams.next(), if !streams.is_empty() => {
                    let frame = match event {
                        Some(event) => Some(ServerMessage::next(&id, &event)),
                        None => protocol.on_stream_end(&subscription_id),
                    };
                    if let Some(frame) = frame {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                }
                _ = &mut init_deadline, if !protocol.is_initialized() => {
                    warn!("Connection initialisation timed out");
                    close(&mut socket, close_code::INIT_TIMEOUT, "Connection initialisation timeout".to_string()).await;
                    break;
                }
                _ = ticker.tick() => {
                    if last_seen.elapsed() > keep_alive * 2 {
                        info!("Reaping unresponsive connection");
                        break;
                    }
                    if send_frame(&mut socket, &ServerMessage::Ping { payload: None }).await.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(session) = protocol.session() {
            debug!(connection = %session.connection_id, operations = protocol.active_operations(), "Connection closed");
        }
        protocol.close();
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Turn a subscription receiver into a tagged stream with an end marker
fn forward(
    id: String,
    subscription_id: String,
    receiver: mpsc::Receiver<LiveEvent>,
) -> BoxStream<'static, Forwarded> {
    stream::unfold(Some(receiver), move |state| {
        let id = id.clone();
        let subscription_id = subscription_id.clone();
        async move {
            let mut receiver = state?;
            match receiver.recv().await {
                Some(event) => Some(((id, subscription_id, Some(event)), Some(receiver))),
                None => Some(((id, subscription_id, None), None)),
            }
        }
    })
    .boxed()
}

async fn send_frame(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload)).await
}

async fn close(socket: &mut WebSocket, code: u16, reason: String) {
    debug!(code, reason = %reason, "Closing connection");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_events::envelope::AgentStatus;
    use pulse_events::live::AgentStatusPayload;

    fn status(agent: &str) -> LiveEvent {
        LiveEvent::AgentStatusChanged(AgentStatusPayload {
            agent_id: agent.to_string(),
            status: AgentStatus::Busy,
            changed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_forward_tags_and_marks_end() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = forward("op-1".to_string(), "sub-1".to_string(), rx);

        tx.send(status("A")).await.unwrap();
        drop(tx);

        let (id, subscription_id, event) = stream.next().await.unwrap();
        assert_eq!((id.as_str(), subscription_id.as_str()), ("op-1", "sub-1"));
        assert!(event.is_some());

        let (_, _, end) = stream.next().await.unwrap();
        assert!(end.is_none());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_next_frame_shape() {
        let frame = serde_json::to_value(ServerMessage::next("7", &status("A"))).unwrap();
        assert_eq!(frame["type"], "next");
        assert_eq!(frame["id"], "7");
        assert_eq!(frame["payload"]["data"]["agentStatusChanged"]["agentId"], "A");
        assert_eq!(frame["payload"]["data"]["agentStatusChanged"]["status"], "BUSY");
    }
}
