//! Manages the lifecycle of one relay session: a client websocket paired with
//! an upstream realtime websocket.

use super::{
    provider::{self, CLIENT_REQUEST_ID_HEADER, UpstreamSocket},
    transform::{Disposition, MessageProcessor},
};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{
    fmt,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{Instrument, debug, error, info, instrument, warn};

type ClientSink = SplitSink<WebSocket, Message>;
type ClientStream = SplitStream<WebSocket>;
type UpstreamSink = Arc<Mutex<SplitSink<UpstreamSocket, WsMessage>>>;
type UpstreamStream = SplitStream<UpstreamSocket>;

/// The phases a relay session moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// The upstream handshake is in progress.
    Connecting,
    /// Both forwarding loops are running.
    Relaying,
    /// One side has closed and the other is being torn down.
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Relaying => write!(f, "relaying"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Tracks a session's state; transitions only ever move forward.
#[derive(Debug)]
pub struct Lifecycle {
    state: StdMutex<SessionState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: StdMutex::new(SessionState::Connecting),
        }
    }
}

impl Lifecycle {
    /// Moves to `next` unless the session is already at or past it.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *current;
        if next > from {
            info!(%from, to = %next, "Relay session state changed.");
            *current = next;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn current(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Axum handler to upgrade an HTTP connection to a relay session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let client_request_id = headers
        .get(CLIENT_REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_request_id))
}

/// Runs one relay session from upstream handshake to teardown.
#[instrument(name = "relay_session", skip_all, fields(session_id = tracing::field::Empty))]
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, client_request_id: Option<String>) {
    let session_id: u32 = rand::random();
    tracing::Span::current().record("session_id", session_id.to_string());
    info!(client_request_id = client_request_id.as_deref(), "New client connection.");

    let lifecycle = Lifecycle::default();
    let upstream = match provider::connect(&state, client_request_id.as_deref()).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(error = ?e, "Could not open upstream realtime session.");
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: "Upstream connection failed".into(),
            };
            if let Err(e) = socket.send(Message::Close(Some(frame))).await {
                debug!(error = %e, "Client went away before the error close frame.");
            }
            lifecycle.advance(SessionState::Closed);
            return;
        }
    };
    lifecycle.advance(SessionState::Relaying);

    let processor = MessageProcessor::new(state.server_config.clone(), state.tools.clone());
    let (client_tx, client_rx) = socket.split();
    let (upstream_tx, upstream_rx) = upstream.split();
    let upstream_tx: UpstreamSink = Arc::new(Mutex::new(upstream_tx));

    tokio::join!(
        client_to_upstream(&processor, &lifecycle, client_rx, upstream_tx.clone())
            .instrument(tracing::info_span!("client_to_upstream")),
        upstream_to_client(&processor, &lifecycle, upstream_rx, client_tx, upstream_tx)
            .instrument(tracing::info_span!("upstream_to_client")),
    );

    lifecycle.advance(SessionState::Closed);
}

async fn send_upstream(upstream_tx: &UpstreamSink, text: String) -> bool {
    match upstream_tx.lock().await.send(WsMessage::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Upstream socket is no longer writable.");
            false
        }
    }
}

async fn send_client(client_tx: &mut ClientSink, text: String) -> bool {
    match client_tx.send(Message::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Client socket is no longer writable.");
            false
        }
    }
}

/// Whether a read error is the peer dropping the connection rather than a
/// protocol failure.
fn is_transport_reset(error: &tungstenite::Error) -> bool {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        tungstenite::Error::Protocol(tungstenite::error::ProtocolError::ResetWithoutClosingHandshake) => true,
        _ => false,
    }
}

/// Relays client frames upstream until the client goes away, then closes the
/// upstream socket so the other loop ends too.
async fn client_to_upstream(
    processor: &MessageProcessor,
    lifecycle: &Lifecycle,
    mut client_rx: ClientStream,
    upstream_tx: UpstreamSink,
) {
    while let Some(frame) = client_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let outgoing = match processor.process_to_server(text.as_str()) {
                    Ok(Disposition::Forward) => text.as_str().to_string(),
                    Ok(Disposition::Replace(rewritten)) => rewritten,
                    Ok(Disposition::Suppress) => continue,
                    Err(e) => {
                        warn!(error = ?e, "Dropping client message that could not be rewritten.");
                        continue;
                    }
                };
                if !send_upstream(&upstream_tx, outgoing).await {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                warn!(bytes = data.len(), "Ignoring unexpected binary frame from client.");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("Client closed the connection.");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Client connection reset.");
                break;
            }
        }
    }

    lifecycle.advance(SessionState::Closing);
    info!("Closing upstream realtime socket.");
    if let Err(e) = upstream_tx.lock().await.close().await {
        debug!(error = %e, "Upstream socket was already closed.");
    }
}

/// Relays upstream frames to the client, running tools and answering the
/// model as the transform rules require, then closes the client socket.
async fn upstream_to_client(
    processor: &MessageProcessor,
    lifecycle: &Lifecycle,
    mut upstream_rx: UpstreamStream,
    mut client_tx: ClientSink,
    upstream_tx: UpstreamSink,
) {
    'relay: while let Some(frame) = upstream_rx.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                let outcome = match processor.process_to_client(text.as_str()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(error = ?e, "Dropping upstream message that could not be processed.");
                        continue;
                    }
                };
                for message in outcome.to_upstream {
                    if !send_upstream(&upstream_tx, message).await {
                        break 'relay;
                    }
                }
                for message in outcome.to_client {
                    if !send_client(&mut client_tx, message).await {
                        break 'relay;
                    }
                }
                let relayed = match outcome.disposition {
                    Disposition::Forward => Some(text.as_str().to_string()),
                    Disposition::Replace(rewritten) => Some(rewritten),
                    Disposition::Suppress => None,
                };
                if let Some(message) = relayed {
                    if !send_client(&mut client_tx, message).await {
                        break;
                    }
                }
            }
            Ok(WsMessage::Binary(data)) => {
                warn!(bytes = data.len(), "Ignoring unexpected binary frame from upstream.");
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                info!(?frame, "Upstream closed the connection.");
                break;
            }
            Err(e) if is_transport_reset(&e) => {
                debug!(error = %e, "Upstream connection reset.");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Upstream connection failed.");
                break;
            }
        }
    }

    lifecycle.advance(SessionState::Closing);
    if let Err(e) = client_tx.close().await {
        debug!(error = %e, "Client socket was already closed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_moves_forward_only() {
        let lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.current(), SessionState::Connecting);

        assert!(lifecycle.advance(SessionState::Relaying));
        assert!(lifecycle.advance(SessionState::Closing));
        assert!(!lifecycle.advance(SessionState::Closing));
        assert!(!lifecycle.advance(SessionState::Relaying));
        assert_eq!(lifecycle.current(), SessionState::Closing);

        assert!(lifecycle.advance(SessionState::Closed));
        assert_eq!(lifecycle.current(), SessionState::Closed);
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_transport_reset_classification() {
        assert!(is_transport_reset(&tungstenite::Error::ConnectionClosed));
        assert!(is_transport_reset(&tungstenite::Error::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset
        ))));
        assert!(is_transport_reset(&tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
        )));
        assert!(!is_transport_reset(&tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::HandshakeIncomplete
        )));
    }
}
