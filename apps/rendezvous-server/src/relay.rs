use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use rendezvous_proto::{FailureReason, Message, Receipt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::registry::{ConnectionHandle, EvictReason, Outbound, RegisteredConnection, Registry};
use crate::server::AppState;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_socket(socket, state.registry, state.idle_timeout, Some(addr))
    })
}

async fn handle_socket(
    socket: WebSocket,
    registry: Registry,
    idle_timeout: Duration,
    remote_addr: Option<SocketAddr>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let shutdown = Arc::new(Notify::new());
    let connection = Arc::new(ConnectionHandle::new(tx, shutdown.clone(), remote_addr));
    let connection_id = connection.id();

    gauge!("rendezvous_connections_active").increment(1.0);
    info!(
        connection_id = %connection_id,
        remote_addr = ?remote_addr,
        "connection opened"
    );

    let writer_shutdown = shutdown.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(message) => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(connection_id = %connection_id, error = %err, "dropping unencodable frame");
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { reason } => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    };
                    let _ = sender.send(WsMessage::Close(Some(frame))).await;
                    break;
                }
            }
        }
        writer_shutdown.notify_one();
        debug!(connection_id = %connection_id, "writer task finished");
    });

    let mut registered: Vec<Arc<RegisteredConnection>> = Vec::new();

    loop {
        let frame = tokio::select! {
            _ = connection.closed() => {
                debug!(connection_id = %connection_id, "connection closed by server");
                break;
            }
            frame = tokio::time::timeout(idle_timeout, receiver.next()) => match frame {
                Ok(frame) => frame,
                Err(_) => {
                    info!(
                        connection_id = %connection_id,
                        idle_secs = idle_timeout.as_secs_f64(),
                        "closing idle connection"
                    );
                    counter!("rendezvous_idle_disconnects_total").increment(1);
                    break;
                }
            },
        };

        let decoded = match frame {
            Some(Ok(WsMessage::Text(text))) => Message::decode(&text),
            Some(Ok(WsMessage::Binary(bytes))) => Message::decode_slice(&bytes),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {
                connection.touch();
                continue;
            }
            Some(Err(err)) => {
                debug!(connection_id = %connection_id, error = %err, "websocket read failed");
                break;
            }
        };
        connection.touch();

        match decoded {
            Ok(message) => dispatch(&registry, &connection, &mut registered, message),
            Err(err) if err.is_fatal() => {
                warn!(connection_id = %connection_id, error = %err, "dropping connection on bad frame");
                break;
            }
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "discarding frame");
            }
        }
    }

    for entry in &registered {
        registry.evict(entry, EvictReason::Disconnected);
    }
    connection.close("connection closed");
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    gauge!("rendezvous_connections_active").decrement(1.0);
    info!(
        connection_id = %connection_id,
        identities = registered.len(),
        "connection closed"
    );
}

fn dispatch(
    registry: &Registry,
    connection: &Arc<ConnectionHandle>,
    registered: &mut Vec<Arc<RegisteredConnection>>,
    message: Message,
) {
    trace!(
        connection_id = %connection.id(),
        kind = message.message_type().label(),
        "frame received"
    );
    match message {
        Message::RegisterRequest(body) => {
            let entry = registry.register(
                body.cid.clone(),
                body.auth_code.clone(),
                Arc::clone(connection),
            );
            registered.retain(|existing| existing.identity() != entry.identity());
            registered.push(entry);
            reply(connection, Message::RegisterResponse(Receipt::ok(body)));
        }
        Message::HeartbeatRequest => reply(connection, Message::HeartbeatResponse),
        Message::SdpRequest(body) => {
            let outcome = relay(
                registry,
                connection,
                &body.from,
                &body.to,
                body.auth_code.as_deref(),
                true,
                Message::SdpRequest(body.clone()),
            );
            let receipt = match outcome {
                Ok(()) => Receipt::ok(body),
                Err(reason) => Receipt::failed(body, reason),
            };
            reply(connection, Message::SdpResponse(receipt));
        }
        Message::CandidateRequest(body) => {
            let outcome = relay(
                registry,
                connection,
                &body.from,
                &body.to,
                None,
                false,
                Message::CandidateRequest(body.clone()),
            );
            let receipt = match outcome {
                Ok(()) => Receipt::ok(body),
                Err(reason) => Receipt::failed(body, reason),
            };
            reply(connection, Message::CandidateResponse(receipt));
        }
        other => {
            debug!(
                connection_id = %connection.id(),
                kind = other.message_type().label(),
                "ignoring response frame from client"
            );
        }
    }
}

/// Forwards `message` to the connection registered for `to`.
///
/// Session descriptions need the target's secret unless the target has
/// already reached `from` with ours. Candidates only need a live target.
fn relay(
    registry: &Registry,
    connection: &ConnectionHandle,
    from: &str,
    to: &str,
    auth_code: Option<&str>,
    check_auth: bool,
    message: Message,
) -> Result<(), FailureReason> {
    let kind = message.message_type().label();
    let result = forward(registry, connection, from, to, auth_code, check_auth, message);
    let outcome = match result {
        Ok(()) => "delivered",
        Err(reason) => reason.label(),
    };
    counter!("rendezvous_relays_total", "kind" => kind, "outcome" => outcome).increment(1);
    match result {
        Ok(()) => debug!(from, to, kind, "relayed"),
        Err(reason) => warn!(from, to, kind, reason = reason.label(), "relay refused"),
    }
    result
}

fn forward(
    registry: &Registry,
    connection: &ConnectionHandle,
    from: &str,
    to: &str,
    auth_code: Option<&str>,
    check_auth: bool,
    message: Message,
) -> Result<(), FailureReason> {
    let source = registry
        .lookup(from)
        .filter(|entry| entry.connection().id() == connection.id())
        .ok_or(FailureReason::UnknownSender)?;
    let target = registry.lookup(to).ok_or(FailureReason::TargetUnreachable)?;

    if check_auth && !target.authorizes(auth_code, from) {
        return Err(FailureReason::Unauthorized);
    }

    if let Err(err) = target.connection().send(message) {
        warn!(to, error = %err, "target connection is gone; evicting");
        registry.evict(&target, EvictReason::WriteFailed);
        return Err(FailureReason::TargetUnreachable);
    }

    if check_auth {
        source.grant_answer(to);
    }
    Ok(())
}

fn reply(connection: &ConnectionHandle, message: Message) {
    if let Err(err) = connection.send(message) {
        debug!(error = %err, "reply dropped");
    }
}
