use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::SinkExt;
use parking_lot::Mutex;
use rendezvous_peer::{
    ConnectionState, CoordinatorError, EngineError, EngineEvent, EngineEvents, PeerConfig, Role,
    SessionHandle, SessionState, SignalingError, TransportEngine,
};
use rendezvous_proto::{Message, SessionDescription};
use rendezvous_server::{serve, AppState, Registry};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use url::Url;

#[derive(Default)]
struct StubLog {
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    candidates: Vec<String>,
    opened: bool,
    closed: bool,
}

/// Cooperating engine: announces one candidate when its local description is
/// committed and opens the channel once it holds a remote description and a
/// remote candidate. Text sent on one side of a pair arrives on the other.
struct StubEngine {
    name: &'static str,
    events: mpsc::UnboundedSender<EngineEvent>,
    peer: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    log: Mutex<StubLog>,
    refuse_answers: AtomicBool,
}

impl StubEngine {
    fn new(name: &'static str) -> (Arc<Self>, EngineEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            name,
            events,
            peer: Mutex::new(None),
            log: Mutex::new(StubLog::default()),
            refuse_answers: AtomicBool::new(false),
        });
        (engine, rx)
    }

    fn pair(a: &'static str, b: &'static str) -> ((Arc<Self>, EngineEvents), (Arc<Self>, EngineEvents)) {
        let first = Self::new(a);
        let second = Self::new(b);
        *first.0.peer.lock() = Some(second.0.events.clone());
        *second.0.peer.lock() = Some(first.0.events.clone());
        (first, second)
    }

    fn description(&self, kind: &str) -> SessionDescription {
        SessionDescription::new(json!({"type": kind, "sdp": format!("stub-{kind}-{}", self.name)}))
    }

    fn maybe_open(&self) {
        let mut log = self.log.lock();
        if log.opened || log.remote.is_empty() || log.candidates.is_empty() {
            return;
        }
        log.opened = true;
        let _ = self
            .events
            .send(EngineEvent::ConnectionState(ConnectionState::Connected));
        let _ = self.events.send(EngineEvent::ChannelOpen);
    }
}

#[async_trait]
impl TransportEngine for StubEngine {
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError> {
        Ok(self.description("offer"))
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError> {
        if self.refuse_answers.load(Ordering::SeqCst) {
            return Err(EngineError::CreateDescription {
                kind: "answer",
                reason: "stub refuses to answer".into(),
            });
        }
        Ok(self.description("answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.log.lock().local.push(description);
        let _ = self
            .events
            .send(EngineEvent::LocalCandidate(format!("candidate:{}", self.name)));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.log.lock().remote.push(description);
        self.maybe_open();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), EngineError> {
        self.log.lock().candidates.push(candidate.to_string());
        self.maybe_open();
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), EngineError> {
        self.send_bytes(Bytes::from(text)).await
    }

    async fn send_bytes(&self, bytes: Bytes) -> Result<(), EngineError> {
        match self.peer.lock().as_ref() {
            Some(peer) => peer
                .send(EngineEvent::ChannelMessage(bytes))
                .map_err(|_| EngineError::Send("peer gone".into())),
            None => Err(EngineError::ChannelNotOpen),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.log.lock().closed = true;
        Ok(())
    }
}

struct TestServer {
    url: Url,
    registry: Registry,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server() -> TestServer {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let registry = Registry::new();
    let state = AppState::new(registry.clone(), None);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = serve(listener, state, "/signal", async {
            let _ = shutdown_rx.await;
        })
        .await;
    });
    TestServer {
        url: Url::parse(&format!("ws://{addr}/signal")).unwrap(),
        registry,
        _shutdown: shutdown_tx,
    }
}

fn initiator(url: &Url, cid: &str, to: &str, to_secret: &str) -> PeerConfig {
    PeerConfig::new(
        url.clone(),
        cid,
        format!("{cid}-secret"),
        Role::Initiator {
            remote_cid: to.into(),
            remote_auth_code: to_secret.into(),
        },
    )
}

fn responder(url: &Url, cid: &str) -> PeerConfig {
    PeerConfig::new(url.clone(), cid, format!("{cid}-secret"), Role::Responder)
}

async fn wait(result: impl std::future::Future<Output = Result<(), CoordinatorError>>) -> Result<(), CoordinatorError> {
    tokio::time::timeout(Duration::from_secs(10), result)
        .await
        .expect("session did not settle")
}

impl TestServer {
    async fn wait_until_unregistered(&self, cid: &str) {
        for _ in 0..100 {
            if self.registry.lookup(cid).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{cid} is still registered");
    }
}

async fn wait_for_state(session: &SessionHandle, expected: SessionState) {
    let mut state = session.subscribe();
    tokio::time::timeout(Duration::from_secs(10), state.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("session never reached {expected:?}"))
        .unwrap();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

async fn open_pair(
    server: &TestServer,
) -> (SessionHandle, Arc<StubEngine>, SessionHandle, Arc<StubEngine>) {
    let ((offer_engine, offer_events), (answer_engine, answer_events)) =
        StubEngine::pair("c1", "c2");
    let answering = rendezvous_peer::start(
        &responder(&server.url, "c2"),
        answer_engine.clone(),
        answer_events,
    )
    .await
    .unwrap();
    let offering = rendezvous_peer::start(
        &initiator(&server.url, "c1", "c2", "c2-secret"),
        offer_engine.clone(),
        offer_events,
    )
    .await
    .unwrap();
    wait(offering.wait_writable()).await.unwrap();
    wait(answering.wait_writable()).await.unwrap();
    (offering, offer_engine, answering, answer_engine)
}

#[test_timeout::tokio_timeout_test]
async fn offer_and_answer_open_the_channel_on_both_sides() {
    let server = start_server().await;
    let ((offer_engine, offer_events), (answer_engine, answer_events)) =
        StubEngine::pair("c1", "c2");

    let mut answering = rendezvous_peer::start(
        &responder(&server.url, "c2"),
        answer_engine.clone(),
        answer_events,
    )
    .await
    .unwrap();
    let offering = rendezvous_peer::start(
        &initiator(&server.url, "c1", "c2", "c2-secret"),
        offer_engine.clone(),
        offer_events,
    )
    .await
    .unwrap();

    wait(offering.wait_writable()).await.unwrap();
    wait(answering.wait_writable()).await.unwrap();
    assert!(offering.state().is_writable());
    assert!(answering.state().is_writable());

    {
        let log = answer_engine.log.lock();
        assert_eq!(log.remote, vec![offer_engine.description("offer")]);
        assert_eq!(log.local, vec![answer_engine.description("answer")]);
        assert_eq!(log.candidates, vec!["candidate:c1".to_string()]);
    }
    {
        let log = offer_engine.log.lock();
        assert_eq!(log.local, vec![offer_engine.description("offer")]);
        assert_eq!(log.remote, vec![answer_engine.description("answer")]);
        assert_eq!(log.candidates, vec!["candidate:c2".to_string()]);
    }

    offering.send_text("hello c2").await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), answering.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received[..], b"hello c2");

    offering.close().await;
    answering.close().await;
    assert!(offer_engine.log.lock().closed);
    assert!(answer_engine.log.lock().closed);
}

#[test_timeout::tokio_timeout_test]
async fn offer_to_absent_peer_fails_the_session() {
    let server = start_server().await;
    let (engine, events) = StubEngine::new("c1");

    let session = rendezvous_peer::start(
        &initiator(&server.url, "c1", "nobody", "whatever"),
        engine.clone(),
        events,
    )
    .await
    .unwrap();

    let err = wait(session.wait_writable()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionFailed));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(
        session.send_text("too early").await,
        Err(CoordinatorError::ChannelNotOpen)
    ));
    session.close().await;
    assert!(engine.log.lock().closed);
}

#[test_timeout::tokio_timeout_test]
async fn offer_with_wrong_secret_never_reaches_the_responder() {
    let server = start_server().await;
    let ((offer_engine, offer_events), (answer_engine, answer_events)) =
        StubEngine::pair("c1", "c2");

    let answering = rendezvous_peer::start(
        &responder(&server.url, "c2"),
        answer_engine.clone(),
        answer_events,
    )
    .await
    .unwrap();
    let offering = rendezvous_peer::start(
        &initiator(&server.url, "c1", "c2", "not-the-secret"),
        offer_engine,
        offer_events,
    )
    .await
    .unwrap();

    assert!(wait(offering.wait_writable()).await.is_err());
    assert_eq!(answering.state(), SessionState::AwaitingOffer);
    assert!(answer_engine.log.lock().remote.is_empty());

    offering.close().await;
    answering.close().await;
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_server_is_a_connect_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("ws://{addr}/signal")).unwrap();
    let (engine, events) = StubEngine::new("c1");
    let result = rendezvous_peer::start(&responder(&url, "c1"), engine, events).await;
    assert!(matches!(
        result,
        Err(CoordinatorError::Signaling(SignalingError::Connect { .. }))
    ));
}

#[test_timeout::tokio_timeout_test]
async fn engine_failure_fails_the_session_and_releases_signaling() {
    let server = start_server().await;
    let (offering, offer_engine, answering, _answer_engine) = open_pair(&server).await;

    offer_engine
        .events
        .send(EngineEvent::ConnectionState(ConnectionState::Failed))
        .unwrap();
    wait_for_state(&offering, SessionState::Failed).await;
    assert!(matches!(
        offering.send_text("late").await,
        Err(CoordinatorError::ChannelNotOpen)
    ));

    offering.close().await;
    assert!(offer_engine.log.lock().closed);
    server.wait_until_unregistered("c1").await;
    assert!(server.registry.lookup("c2").is_some());

    answering.close().await;
}

#[test_timeout::tokio_timeout_test]
async fn engine_closes_the_session_only_on_a_terminal_state() {
    let server = start_server().await;
    let (offering, offer_engine, answering, _answer_engine) = open_pair(&server).await;

    offer_engine
        .events
        .send(EngineEvent::ConnectionState(ConnectionState::Disconnected))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(offering.state().is_writable());

    offer_engine
        .events
        .send(EngineEvent::ConnectionState(ConnectionState::Closed))
        .unwrap();
    wait_for_state(&offering, SessionState::Closed).await;

    offering.close().await;
    assert!(offer_engine.log.lock().closed);
    answering.close().await;
}

#[test_timeout::tokio_timeout_test]
async fn closed_data_channel_closes_the_session() {
    let server = start_server().await;
    let (offering, _offer_engine, answering, answer_engine) = open_pair(&server).await;

    answer_engine.events.send(EngineEvent::ChannelClosed).unwrap();
    wait_for_state(&answering, SessionState::Closed).await;
    assert!(matches!(
        wait(answering.wait_writable()).await,
        Err(CoordinatorError::SessionClosed)
    ));

    answering.close().await;
    assert!(answer_engine.log.lock().closed);
    server.wait_until_unregistered("c2").await;

    offering.close().await;
}

#[test_timeout::tokio_timeout_test]
async fn answer_creation_error_fails_the_responder() {
    let server = start_server().await;
    let ((offer_engine, offer_events), (answer_engine, answer_events)) =
        StubEngine::pair("c1", "c2");
    answer_engine.refuse_answers.store(true, Ordering::SeqCst);

    let answering = rendezvous_peer::start(
        &responder(&server.url, "c2"),
        answer_engine.clone(),
        answer_events,
    )
    .await
    .unwrap();
    let offering = rendezvous_peer::start(
        &initiator(&server.url, "c1", "c2", "c2-secret"),
        offer_engine,
        offer_events,
    )
    .await
    .unwrap();

    let err = wait(answering.wait_writable()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionFailed));
    assert_eq!(answering.state(), SessionState::Failed);
    assert!(answer_engine.log.lock().local.is_empty());

    answering.close().await;
    assert!(answer_engine.log.lock().closed);
    server.wait_until_unregistered("c2").await;

    offering.close().await;
}

#[test_timeout::tokio_timeout_test]
async fn repeated_offer_keeps_the_open_channel_writable() {
    let server = start_server().await;
    let ((_sink_engine, mut sink_events), (answer_engine, answer_events)) =
        StubEngine::pair("c1", "c2");
    let answering = rendezvous_peer::start(
        &responder(&server.url, "c2"),
        answer_engine.clone(),
        answer_events,
    )
    .await
    .unwrap();

    // The offering side speaks the relay protocol directly.
    let (mut c1, _) = connect_async(server.url.as_str()).await.unwrap();
    let frame = |message: Message| WsMessage::Text(message.encode().unwrap());
    let offer = || {
        Message::sdp(
            SessionDescription::from("OFFER"),
            "c1",
            "c2",
            Some("c2-secret".to_string()),
        )
    };
    c1.send(frame(Message::register("c1", "c1-secret"))).await.unwrap();
    eventually(|| server.registry.lookup("c1").is_some()).await;

    c1.send(frame(offer())).await.unwrap();
    c1.send(frame(Message::candidate("candidate:c1", "c1", "c2")))
        .await
        .unwrap();
    wait(answering.wait_writable()).await.unwrap();

    c1.send(frame(offer())).await.unwrap();
    c1.send(frame(Message::candidate("candidate:c1-again", "c1", "c2")))
        .await
        .unwrap();
    eventually(|| answer_engine.log.lock().candidates.len() == 2).await;

    assert_eq!(answer_engine.log.lock().remote.len(), 2);
    assert!(answering.state().is_writable());
    answering.send_text("still open").await.unwrap();
    match tokio::time::timeout(Duration::from_secs(5), sink_events.recv()).await {
        Ok(Some(EngineEvent::ChannelMessage(bytes))) => assert_eq!(&bytes[..], b"still open"),
        other => panic!("expected a channel message, got {other:?}"),
    }

    answering.close().await;
}
