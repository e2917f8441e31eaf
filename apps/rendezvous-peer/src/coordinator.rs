use std::sync::Arc;

use bytes::Bytes;
use rendezvous_proto::{FailureReason, Message, MessageType, SdpBody};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::config::{PeerConfig, Role};
use crate::engine::{ConnectionState, EngineError, EngineEvent, EngineEvents, TransportEngine};
use crate::signaling::{SignalingClient, SignalingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Registered,
    OfferCreated,
    LocalDescSet,
    AwaitingAnswer,
    AwaitingOffer,
    RemoteDescSet,
    NegotiatingPath,
    ChannelOpen,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_writable(self) -> bool {
        matches!(self, SessionState::ChannelOpen | SessionState::Connected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("relay refused {kind:?}: {reason:?}")]
    Refused {
        kind: MessageType,
        reason: Option<FailureReason>,
    },
    #[error("signaling connection lost before the channel opened")]
    SignalingLost,
    #[error("session failed")]
    SessionFailed,
    #[error("session closed")]
    SessionClosed,
    #[error("data channel is not open")]
    ChannelNotOpen,
}

/// Locally discovered candidates wait here until the remote description is
/// committed. Opening drains the backlog, so nothing is ever sent twice.
#[derive(Debug, Default)]
struct CandidateGate {
    open: bool,
    pending: Vec<String>,
}

impl CandidateGate {
    /// Returns the candidate back when it may be sent right away.
    fn admit(&mut self, candidate: String) -> Option<String> {
        if self.open {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    fn open(&mut self) -> Vec<String> {
        self.open = true;
        std::mem::take(&mut self.pending)
    }
}

/// Caller's view of a running session.
pub struct SessionHandle {
    engine: Arc<dyn TransportEngine>,
    state: watch::Receiver<SessionState>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Resolves once the data channel is open.
    pub async fn wait_writable(&self) -> Result<(), CoordinatorError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| s.is_writable() || s.is_terminal())
            .await
            .map(|s| *s)
            .unwrap_or(SessionState::Closed);
        match reached {
            SessionState::Failed => Err(CoordinatorError::SessionFailed),
            SessionState::Closed => Err(CoordinatorError::SessionClosed),
            _ => Ok(()),
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), CoordinatorError> {
        self.ensure_writable()?;
        self.engine.send_text(text.into()).await?;
        Ok(())
    }

    pub async fn send_bytes(&self, bytes: Bytes) -> Result<(), CoordinatorError> {
        self.ensure_writable()?;
        self.engine.send_bytes(bytes).await?;
        Ok(())
    }

    /// Next message received over the data channel.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    pub async fn close(self) {
        self.shutdown.notify_one();
        let _ = self.task.await;
    }

    fn ensure_writable(&self) -> Result<(), CoordinatorError> {
        if self.state().is_writable() {
            Ok(())
        } else {
            Err(CoordinatorError::ChannelNotOpen)
        }
    }
}

/// Registers with the rendezvous server and starts negotiating in the
/// background. Returns once registration is confirmed.
pub async fn start(
    config: &PeerConfig,
    engine: Arc<dyn TransportEngine>,
    events: EngineEvents,
) -> Result<SessionHandle, CoordinatorError> {
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);

    let mut signaling = SignalingClient::connect(&config.signal_url, config.ping_interval).await?;
    signaling
        .register(&config.cid, &config.auth_code, config.register_timeout)
        .await?;
    state_tx.send_replace(SessionState::Registered);
    info!(cid = %config.cid, role = config.role.label(), "registered with rendezvous server");

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());
    let remote = match &config.role {
        Role::Initiator { remote_cid, .. } => Some(remote_cid.clone()),
        Role::Responder => None,
    };
    let session = Session {
        local: config.cid.clone(),
        role: config.role.clone(),
        remote,
        gate: CandidateGate::default(),
        path_connected: false,
        engine: Arc::clone(&engine),
        signaling: Some(signaling),
        state: state_tx,
        inbound: inbound_tx,
    };
    let task = tokio::spawn(session.run(events, Arc::clone(&shutdown)));

    Ok(SessionHandle {
        engine,
        state: state_rx,
        inbound: inbound_rx,
        shutdown,
        task,
    })
}

struct Session {
    local: String,
    role: Role,
    remote: Option<String>,
    gate: CandidateGate,
    path_connected: bool,
    engine: Arc<dyn TransportEngine>,
    signaling: Option<SignalingClient>,
    state: watch::Sender<SessionState>,
    inbound: mpsc::UnboundedSender<Bytes>,
}

impl Session {
    async fn run(mut self, mut events: EngineEvents, shutdown: Arc<Notify>) {
        if let Err(err) = self.begin().await {
            warn!(cid = %self.local, error = %err, "negotiation aborted");
            self.finish(SessionState::Failed).await;
            return;
        }

        let outcome = loop {
            let step = tokio::select! {
                _ = shutdown.notified() => break SessionState::Closed,
                message = recv_signal(&mut self.signaling) => match message {
                    Some(message) => self.on_signal(message).await,
                    None => self.on_signaling_lost(),
                },
                event = events.recv() => match event {
                    Some(event) => self.on_engine_event(event).await,
                    None => Ok(Some(SessionState::Closed)),
                },
            };
            match step {
                Ok(Some(terminal)) => break terminal,
                Ok(None) => {}
                Err(err) => {
                    warn!(cid = %self.local, error = %err, "negotiation aborted");
                    break SessionState::Failed;
                }
            }
        };
        self.finish(outcome).await;
    }

    async fn begin(&mut self) -> Result<(), CoordinatorError> {
        let Role::Initiator {
            remote_cid,
            remote_auth_code,
        } = self.role.clone()
        else {
            self.transition(SessionState::AwaitingOffer);
            return Ok(());
        };

        let offer = self.engine.create_local_offer().await?;
        self.transition(SessionState::OfferCreated);
        self.engine.set_local_description(offer.clone()).await?;
        self.transition(SessionState::LocalDescSet);
        self.signal(Message::sdp(
            offer,
            self.local.clone(),
            remote_cid.clone(),
            Some(remote_auth_code),
        ))?;
        self.transition(SessionState::AwaitingAnswer);
        info!(cid = %self.local, remote = %remote_cid, "offer sent");
        Ok(())
    }

    async fn on_signal(&mut self, message: Message) -> Result<Option<SessionState>, CoordinatorError> {
        match message {
            Message::SdpRequest(body) => self.on_remote_description(body).await?,
            Message::CandidateRequest(body) => {
                if self.remote.as_deref() != Some(body.from.as_str()) {
                    debug!(from = %body.from, "ignoring candidate from unknown peer");
                    return Ok(None);
                }
                trace!(candidate = %body.candidate, "remote candidate");
                if let Err(err) = self.engine.add_remote_candidate(&body.candidate).await {
                    warn!(error = %err, "engine rejected remote candidate");
                }
            }
            Message::SdpResponse(receipt) if !receipt.success => {
                return Err(CoordinatorError::Refused {
                    kind: MessageType::SdpRequest,
                    reason: receipt.reason,
                });
            }
            Message::CandidateResponse(receipt) if !receipt.success => {
                warn!(
                    to = %receipt.body.to,
                    reason = ?receipt.reason,
                    "candidate was not relayed"
                );
            }
            other => trace!(kind = other.message_type().label(), "signaling frame"),
        }
        Ok(None)
    }

    async fn on_remote_description(&mut self, body: SdpBody) -> Result<(), CoordinatorError> {
        if body.to != self.local {
            debug!(to = %body.to, "ignoring description addressed elsewhere");
            return Ok(());
        }
        match self.remote.clone() {
            Some(remote) if remote != body.from => {
                warn!(from = %body.from, %remote, "ignoring description from a second peer");
                return Ok(());
            }
            Some(_) => {}
            None => self.remote = Some(body.from.clone()),
        }

        // A repeated description must not pull an open channel back into
        // negotiation.
        let was_writable = self.current().is_writable();
        self.engine.set_remote_description(body.sd).await?;
        if !was_writable {
            self.transition(SessionState::RemoteDescSet);
        }
        info!(cid = %self.local, from = %body.from, "remote description committed");

        if matches!(self.role, Role::Responder) {
            let answer = self.engine.create_local_answer().await?;
            self.engine.set_local_description(answer.clone()).await?;
            self.signal(Message::sdp(answer, self.local.clone(), body.from.clone(), None))?;
            info!(cid = %self.local, remote = %body.from, "answer sent");
        }

        let backlog = self.gate.open();
        if !backlog.is_empty() {
            debug!(count = backlog.len(), "flushing buffered candidates");
        }
        for candidate in backlog {
            self.send_candidate(candidate)?;
        }
        if !was_writable {
            self.transition(SessionState::NegotiatingPath);
        }
        Ok(())
    }

    async fn on_engine_event(
        &mut self,
        event: EngineEvent,
    ) -> Result<Option<SessionState>, CoordinatorError> {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = self.gate.admit(candidate) {
                    self.send_candidate(candidate)?;
                }
            }
            EngineEvent::ChannelOpen => {
                self.transition(SessionState::ChannelOpen);
                info!(cid = %self.local, remote = ?self.remote, "data channel open");
                if self.path_connected {
                    self.transition(SessionState::Connected);
                }
            }
            EngineEvent::ChannelMessage(bytes) => {
                if self.inbound.send(bytes).is_err() {
                    trace!("inbound message dropped; handle is gone");
                }
            }
            EngineEvent::ChannelClosed => {
                info!(cid = %self.local, "data channel closed");
                return Ok(Some(SessionState::Closed));
            }
            EngineEvent::ConnectionState(state) => {
                debug!(cid = %self.local, ?state, "engine connection state");
                match state {
                    ConnectionState::Connected => {
                        self.path_connected = true;
                        if self.current() == SessionState::ChannelOpen {
                            self.transition(SessionState::Connected);
                        }
                    }
                    ConnectionState::Failed => return Ok(Some(SessionState::Failed)),
                    state if state.is_terminal() => return Ok(Some(SessionState::Closed)),
                    _ => {}
                }
            }
        }
        Ok(None)
    }

    fn on_signaling_lost(&mut self) -> Result<Option<SessionState>, CoordinatorError> {
        self.signaling = None;
        if self.current().is_writable() {
            debug!(cid = %self.local, "signaling closed; data channel stays up");
            Ok(None)
        } else {
            Err(CoordinatorError::SignalingLost)
        }
    }

    fn send_candidate(&self, candidate: String) -> Result<(), CoordinatorError> {
        let Some(remote) = self.remote.clone() else {
            return Ok(());
        };
        self.signal(Message::candidate(candidate, self.local.clone(), remote))
    }

    fn signal(&self, message: Message) -> Result<(), CoordinatorError> {
        match &self.signaling {
            Some(signaling) => Ok(signaling.send(message)?),
            None => Err(SignalingError::Closed.into()),
        }
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(cid = %self.local, from = ?previous, to = ?next, "session state");
        }
    }

    async fn finish(mut self, outcome: SessionState) {
        self.transition(outcome);
        if let Err(err) = self.engine.close().await {
            debug!(error = %err, "engine close failed");
        }
        if let Some(signaling) = self.signaling.take() {
            signaling.close().await;
        }
        info!(cid = %self.local, state = ?outcome, "session finished");
    }
}

async fn recv_signal(signaling: &mut Option<SignalingClient>) -> Option<Message> {
    match signaling {
        Some(signaling) => signaling.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn candidates_wait_until_gate_opens() {
        let mut gate = CandidateGate::default();
        assert_eq!(gate.admit("a".into()), None);
        assert_eq!(gate.admit("b".into()), None);

        assert_eq!(gate.open(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(gate.admit("c".into()), Some("c".to_string()));
    }

    #[test_timeout::timeout]
    fn reopening_does_not_replay_flushed_candidates() {
        let mut gate = CandidateGate::default();
        gate.admit("a".into());
        assert_eq!(gate.open().len(), 1);
        assert!(gate.open().is_empty());
    }

    #[test_timeout::timeout]
    fn writable_and_terminal_states() {
        assert!(SessionState::ChannelOpen.is_writable());
        assert!(SessionState::Connected.is_writable());
        assert!(!SessionState::NegotiatingPath.is_writable());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::AwaitingAnswer.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }
}
