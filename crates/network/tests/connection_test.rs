//! Server and client connection managers over real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use knot_network::{
    ClientConfig, CorrelationId, Frame, FrameCodec, Handler, MissedHeartbeatPolicy, NetworkError,
    ServerConfig, Session, SessionId, SessionState, SessionTable, TcpClient, TcpServer,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect(SessionId),
    Message(SessionId, CorrelationId, Bytes),
    Heartbeat(SessionId, CorrelationId),
    Close(SessionId),
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl Handler for Recorder {
    async fn connect(&self, session_id: SessionId, session: Arc<Session>) {
        assert_eq!(session.state(), SessionState::Working);
        let _ = self.events.send(Event::Connect(session_id));
    }

    async fn message(&self, session_id: SessionId, correlation_id: CorrelationId, body: Bytes) {
        let _ = self
            .events
            .send(Event::Message(session_id, correlation_id, body));
    }

    async fn heartbeat(&self, session_id: SessionId, correlation_id: CorrelationId) {
        let _ = self.events.send(Event::Heartbeat(session_id, correlation_id));
    }

    async fn close(&self, session_id: SessionId) {
        let _ = self.events.send(Event::Close(session_id));
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (events, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { events }), rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("handler alive")
}

/// Skip heartbeat events, which arrive on their own schedule.
async fn next_non_heartbeat(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    loop {
        match next_event(rx).await {
            Event::Heartbeat(..) => {}
            event => return event,
        }
    }
}

async fn start_server() -> (TcpServer<Recorder>, mpsc::UnboundedReceiver<Event>, String) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();

    let (handler, events) = recorder();
    let server = TcpServer::new(handler, ServerConfig::default());
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    (server, events, addr.to_string())
}

#[tokio::test]
async fn test_heartbeat_is_acked_with_same_correlation_id() {
    let (_server, mut events, addr) = start_server().await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut peer = Framed::new(stream, FrameCodec);
    let Event::Connect(session_id) = next_event(&mut events).await else {
        panic!("expected connect");
    };

    peer.send(Frame::heartbeat(42)).await.unwrap();

    let ack = timeout(Duration::from_secs(2), peer.next())
        .await
        .expect("ack in time")
        .unwrap()
        .unwrap();
    assert_eq!(ack, Frame::heartbeat_ack(42));
    assert_eq!(next_event(&mut events).await, Event::Heartbeat(session_id, 42));
}

#[tokio::test]
async fn test_server_raises_connect_message_close() {
    let (server, mut events, addr) = start_server().await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut peer = Framed::new(stream, FrameCodec);

    let Event::Connect(session_id) = next_event(&mut events).await else {
        panic!("expected connect");
    };
    assert_eq!(server.session_count(), 1);
    assert!(server.session(session_id).is_some());

    peer.send(Frame::data(7, "ping")).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(session_id, 7, Bytes::from_static(b"ping"))
    );

    server.write(session_id, 7, "pong").await.unwrap();
    let reply = timeout(Duration::from_secs(2), peer.next())
        .await
        .expect("reply in time")
        .unwrap()
        .unwrap();
    assert_eq!(reply, Frame::data(7, "pong"));

    // Plain frames are accepted and ignored
    peer.send(Frame::new(1, knot_network::FrameKind::Plain, "noise"))
        .await
        .unwrap();

    drop(peer);
    assert_eq!(next_event(&mut events).await, Event::Close(session_id));

    timeout(Duration::from_secs(2), async {
        while server.session_count() > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session removed");
    assert!(matches!(
        server.write(session_id, 1, "late").await,
        Err(NetworkError::UnknownSession(id)) if id == session_id
    ));
}

#[tokio::test]
async fn test_client_exchanges_data_and_heartbeats() {
    let (server, mut server_events, addr) = start_server().await;
    let (client_handler, mut client_events) = recorder();

    let config = ClientConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_millis(500));
    let client = TcpClient::dial(&addr, client_handler, config).await.unwrap();

    assert_eq!(
        next_event(&mut client_events).await,
        Event::Connect(client.session_id())
    );
    let Event::Connect(server_session) = next_non_heartbeat(&mut server_events).await else {
        panic!("expected connect");
    };

    let correlation_id = client.write_data("hello").await.unwrap();
    let Event::Message(session_id, received_id, body) =
        next_non_heartbeat(&mut server_events).await
    else {
        panic!("expected message");
    };
    assert_eq!(session_id, server_session);
    assert_eq!(received_id, correlation_id);

    server.write(session_id, received_id, body).await.unwrap();
    assert_eq!(
        next_non_heartbeat(&mut client_events).await,
        Event::Message(client.session_id(), correlation_id, Bytes::from_static(b"hello"))
    );

    // Idle long enough for the heartbeat to fire
    loop {
        if let Event::Heartbeat(session_id, _) = next_event(&mut server_events).await {
            assert_eq!(session_id, server_session);
            break;
        }
    }

    client.close();
    timeout(Duration::from_secs(2), client.closed())
        .await
        .expect("client released");
    assert_eq!(
        next_non_heartbeat(&mut client_events).await,
        Event::Close(client.session_id())
    );
    assert_eq!(
        next_non_heartbeat(&mut server_events).await,
        Event::Close(server_session)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_frames_before_disconnect_are_delivered() {
    let (_server, mut events, addr) = start_server().await;

    for round in 0..50u16 {
        let stream = TcpStream::connect(&addr).await.unwrap();
        let mut peer = Framed::new(stream, FrameCodec);
        let Event::Connect(session_id) = next_event(&mut events).await else {
            panic!("expected connect");
        };

        peer.send(Frame::data(round, "a")).await.unwrap();
        peer.send(Frame::data(round, "b")).await.unwrap();
        drop(peer);

        // Message callbacks run on their own tasks, so only delivery is checked
        let mut bodies = Vec::new();
        let mut closed = false;
        while bodies.len() < 2 || !closed {
            match next_event(&mut events).await {
                Event::Message(id, correlation_id, body) => {
                    assert_eq!((id, correlation_id), (session_id, round));
                    bodies.push(body);
                }
                Event::Close(id) => {
                    assert_eq!(id, session_id);
                    closed = true;
                }
                event => panic!("unexpected {event:?}"),
            }
        }
        bodies.sort();
        assert_eq!(
            bodies,
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            "round {round}"
        );
    }
}

#[tokio::test]
async fn test_inbound_traffic_resets_heartbeat_timer() {
    let (server, mut server_events, addr) = start_server().await;
    let (client_handler, _client_events) = recorder();

    let config = ClientConfig::default()
        .with_heartbeat_interval(Duration::from_millis(300))
        .with_heartbeat_timeout(Duration::from_secs(1));
    let _client = TcpClient::dial(&addr, client_handler, config).await.unwrap();
    let Event::Connect(server_session) = next_event(&mut server_events).await else {
        panic!("expected connect");
    };

    for i in 0..12u16 {
        server.write(server_session, i, "tick").await.unwrap();
        sleep(Duration::from_millis(50)).await;
    }

    let mut during_traffic = 0;
    while let Ok(event) = server_events.try_recv() {
        if matches!(event, Event::Heartbeat(..)) {
            during_traffic += 1;
        }
    }
    assert_eq!(during_traffic, 0);

    // Once the line goes quiet the heartbeat fires again
    assert!(matches!(
        next_event(&mut server_events).await,
        Event::Heartbeat(id, _) if id == server_session
    ));
}

#[tokio::test]
async fn test_shared_session_table_tracks_server_sessions() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();

    let sessions = SessionTable::new();
    let (handler, mut events) = recorder();
    let server = TcpServer::with_sessions(handler, ServerConfig::default(), sessions.clone());
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    assert!(sessions.is_empty());

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut peer = Framed::new(stream, FrameCodec);
    let Event::Connect(session_id) = next_event(&mut events).await else {
        panic!("expected connect");
    };
    assert_eq!(sessions.len(), 1);
    assert_eq!(server.sessions().len(), 1);
    assert!(sessions.get(session_id).is_some());

    sessions.write(session_id, 9, "via table").await.unwrap();
    let frame = timeout(Duration::from_secs(2), peer.next())
        .await
        .expect("frame in time")
        .unwrap()
        .unwrap();
    assert_eq!(frame, Frame::data(9, "via table"));

    drop(peer);
    assert_eq!(next_event(&mut events).await, Event::Close(session_id));
    timeout(Duration::from_secs(2), async {
        while !sessions.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session removed");
    assert!(matches!(
        sessions.write(session_id, 10, "late").await,
        Err(NetworkError::UnknownSession(id)) if id == session_id
    ));
}

#[tokio::test]
async fn test_correlation_ids_increase() {
    let (_server, _events, addr) = start_server().await;
    let (handler, _client_events) = recorder();

    let client = TcpClient::dial(&addr, handler, ClientConfig::default())
        .await
        .unwrap();

    let first = client.next_correlation_id();
    let second = client.write_data("x").await.unwrap();
    assert_eq!(second, first.wrapping_add(1));
}

/// A peer that accepts connections and never answers.
async fn silent_listener() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

#[tokio::test]
async fn test_missed_heartbeat_disconnects_when_configured() {
    let (addr, _listener) = silent_listener().await;
    let (handler, mut events) = recorder();

    let config = ClientConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_millis(100))
        .with_missed_heartbeat(MissedHeartbeatPolicy::Disconnect);
    let client = TcpClient::dial(&addr, handler, config).await.unwrap();
    let session_id = client.session_id();

    timeout(Duration::from_secs(2), client.closed())
        .await
        .expect("missed heartbeat closes the session");
    assert_eq!(next_event(&mut events).await, Event::Connect(session_id));
    assert_eq!(next_event(&mut events).await, Event::Close(session_id));
}

#[tokio::test]
async fn test_missed_heartbeat_is_log_only_by_default() {
    let (addr, _listener) = silent_listener().await;
    let (handler, _events) = recorder();

    let config = ClientConfig::default()
        .with_heartbeat_interval(Duration::from_millis(30))
        .with_heartbeat_timeout(Duration::from_millis(30));
    let client = TcpClient::dial(&addr, handler, config).await.unwrap();

    sleep(Duration::from_millis(300)).await;
    assert_eq!(client.session().state(), SessionState::Working);
}

#[tokio::test]
async fn test_shutdown_closes_live_sessions() {
    let (server, mut events, addr) = start_server().await;
    let (handler, _client_events) = recorder();

    let client = TcpClient::dial(&addr, handler, ClientConfig::default())
        .await
        .unwrap();
    let Event::Connect(session_id) = next_event(&mut events).await else {
        panic!("expected connect");
    };

    server.shutdown();

    assert_eq!(next_non_heartbeat(&mut events).await, Event::Close(session_id));
    timeout(Duration::from_secs(2), client.closed())
        .await
        .expect("client sees the server go away");
}
