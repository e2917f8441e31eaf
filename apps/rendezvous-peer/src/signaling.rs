use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rendezvous_proto::{Message, ProtocolError};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, trace, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to connect to signaling server {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("signaling connection closed")]
    Closed,
    #[error("no register response within {0:?}")]
    RegisterTimeout(Duration),
    #[error("signaling server rejected registration of {cid}")]
    RegisterRejected { cid: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One live connection to the rendezvous server.
///
/// A writer task owns the sink, a reader task decodes inbound frames, and a
/// heartbeat task keeps the server's idle reaper away.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(url: &Url, ping_interval: Duration) -> Result<Self, SignalingError> {
        let (stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|source| SignalingError::Connect {
                    url: url.to_string(),
                    source,
                })?;
        debug!(url = %url, "signaling connected");

        let (mut sink, mut stream) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "dropping unencodable signaling frame");
                        continue;
                    }
                };
                trace!(kind = message.message_type().label(), "signaling send");
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(WsMessage::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let decoded = match frame {
                    Ok(WsMessage::Text(text)) => Message::decode(&text),
                    Ok(WsMessage::Binary(bytes)) => Message::decode_slice(&bytes),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "signaling read failed");
                        break;
                    }
                };
                match decoded {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.is_fatal() => {
                        warn!(error = %err, "signaling server sent a bad frame");
                        break;
                    }
                    Err(err) => debug!(error = %err, "discarding signaling frame"),
                }
            }
            debug!("signaling reader finished");
        });

        let heartbeat_tx = outbound_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Message::HeartbeatRequest).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            writer,
            reader,
            heartbeat,
        })
    }

    /// Registers `cid` and waits for the server to confirm it.
    pub async fn register(
        &mut self,
        cid: &str,
        auth_code: &str,
        timeout: Duration,
    ) -> Result<(), SignalingError> {
        self.send(Message::register(cid, auth_code))?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let message = tokio::time::timeout_at(deadline, self.inbound.recv())
                .await
                .map_err(|_| SignalingError::RegisterTimeout(timeout))?
                .ok_or(SignalingError::Closed)?;
            match message {
                Message::RegisterResponse(receipt) if receipt.body.cid == cid => {
                    return if receipt.success {
                        Ok(())
                    } else {
                        Err(SignalingError::RegisterRejected {
                            cid: cid.to_string(),
                        })
                    };
                }
                other => debug!(
                    kind = other.message_type().label(),
                    "ignoring frame while registering"
                ),
            }
        }
    }

    pub fn send(&self, message: Message) -> Result<(), SignalingError> {
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::Closed)
    }

    /// Next frame from the server, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    pub async fn close(self) {
        self.heartbeat.abort();
        drop(self.outbound);
        let _ = tokio::time::timeout(Duration::from_secs(1), self.writer).await;
        self.reader.abort();
    }
}
