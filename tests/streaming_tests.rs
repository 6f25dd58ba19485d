use futures_util::{SinkExt, StreamExt};
use livescribe::{
    ConnectOptions, EventStream, ManagerConfig, SessionState, StreamingError, StreamingEvent,
    StreamingManager,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

/// Accepts any number of connections, running `handler` for each with its
/// 1-based connection number. Returns the endpoint and a connection counter.
async fn spawn_server<F, Fut>(handler: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(usize, ServerWs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(stream).await {
                    handler(n, ws).await;
                }
            });
        }
    });
    (format!("ws://{}/v3/ws", addr), count)
}

fn text(json: &str) -> Message {
    Message::Text(json.to_string().into())
}

fn begin(id: &str) -> Message {
    text(&format!(r#"{{"type":"Begin","id":"{}","expires_at":1700000000}}"#, id))
}

fn turn(transcript: &str, end_of_turn: bool, formatted: bool) -> Message {
    text(&format!(
        r#"{{"type":"Turn","transcript":"{}","end_of_turn":{},"turn_is_formatted":{}}}"#,
        transcript, end_of_turn, formatted
    ))
}

async fn drain(ws: &mut ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn test_config(endpoint: String) -> ManagerConfig {
    ManagerConfig {
        endpoint,
        connect_timeout: Duration::from_millis(300),
        termination_timeout: Duration::from_millis(300),
        warm_keepalive_interval: Duration::from_millis(50),
        rewarm_delay: Duration::from_millis(40),
        max_rewarm_delay: Duration::from_secs(1),
        max_rewarm_attempts: 3,
        usage_dir: None,
        ..ManagerConfig::default()
    }
}

fn options() -> ConnectOptions {
    ConnectOptions::new("test-token").with_sample_rate(16000)
}

async fn next_event(events: &mut EventStream) -> StreamingEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

#[tokio::test]
async fn cold_session_assembles_turns_and_terminates() {
    let audio_frames = Arc::new(AtomicUsize::new(0));
    let frames = audio_frames.clone();
    let (endpoint, connections) = spawn_server(move |_, mut ws| {
        let frames = frames.clone();
        async move {
            let _ = ws.send(begin("sess-1")).await;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(_) => {
                        if frames.fetch_add(1, Ordering::SeqCst) == 0 {
                            let _ = ws.send(turn("hel", false, false)).await;
                            let _ = ws.send(turn("Hello.", true, false)).await;
                            let _ = ws.send(turn("hello", true, false)).await;
                            let _ = ws.send(turn("Hello", true, true)).await;
                        }
                    }
                    Message::Text(t) if t.contains("Terminate") => {
                        let _ = ws
                            .send(text(r#"{"type":"Termination","audio_duration_seconds":1.5}"#))
                            .await;
                        let _ = ws.close(None).await;
                        break;
                    }
                    _ => {}
                }
            }
        }
    })
    .await;

    let manager = StreamingManager::new(test_config(endpoint));
    let mut events = manager.subscribe();
    let session_id = manager.connect(options()).await.unwrap();
    assert_eq!(session_id, "sess-1");
    assert_eq!(manager.state(), SessionState::Active);
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        assert!(manager.send_audio(&[0u8; 320]));
    }

    assert_eq!(next_event(&mut events).await, StreamingEvent::Partial("hel".into()));
    assert_eq!(next_event(&mut events).await, StreamingEvent::Final("Hello.".into()));
    assert_eq!(next_event(&mut events).await, StreamingEvent::Final("Hello".into()));
    assert_eq!(manager.accumulated_text(), "Hello");

    let result = manager.disconnect(true).await;
    assert!(!result.termination_timed_out);
    assert_eq!(result.text, "Hello");
    assert_eq!(result.audio_duration_seconds, Some(1.5));
    assert_eq!(result.audio_stats.chunks_sent, 3);
    assert_eq!(result.audio_stats.chunks_dropped, 0);
    assert!(result.audio_stats.is_balanced());

    match next_event(&mut events).await {
        StreamingEvent::SessionEnd(end) => assert_eq!(end, result),
        other => panic!("expected session end, got {:?}", other),
    }
    assert_eq!(manager.state(), SessionState::Closed);
    assert!(!manager.status().is_connected);
    assert_eq!(audio_frames.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn connect_times_out_without_begin() {
    let (endpoint, _) = spawn_server(|_, mut ws| async move { drain(&mut ws).await }).await;
    let manager = StreamingManager::new(test_config(endpoint));

    let started = Instant::now();
    let err = manager.connect(options()).await.unwrap_err();
    assert_eq!(err, StreamingError::ConnectionTimeout(300));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(manager.state(), SessionState::Closed);
    assert_eq!(manager.status().session_id, None);
}

#[tokio::test]
async fn disconnect_without_termination_ack_returns_accumulated_text() {
    let (endpoint, _) = spawn_server(|_, mut ws| async move {
        let _ = ws.send(begin("sess-2")).await;
        let mut answered = false;
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Binary(_)) && !answered {
                answered = true;
                let _ = ws.send(turn("partial text", true, false)).await;
            }
        }
    })
    .await;

    let manager = StreamingManager::new(test_config(endpoint));
    let mut events = manager.subscribe();
    manager.connect(options()).await.unwrap();
    assert!(manager.send_audio(&[1u8; 640]));
    assert_eq!(
        next_event(&mut events).await,
        StreamingEvent::Final("partial text".into())
    );

    let started = Instant::now();
    let result = manager.disconnect(true).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    assert!(result.termination_timed_out);
    assert_eq!(result.text, "partial text");
    assert_eq!(result.audio_duration_seconds, None);
    assert_eq!(result.audio_stats.chunks_sent, 1);
    assert_eq!(manager.state(), SessionState::Closed);
}

#[tokio::test]
async fn send_audio_without_session_is_dropped() {
    let manager = StreamingManager::new(test_config("ws://127.0.0.1:9/v3/ws".into()));
    assert!(!manager.send_audio(&[0u8; 100]));
    assert!(!manager.send_audio(&[0u8; 50]));

    let stats = manager.audio_stats();
    assert_eq!(stats.chunks_received, 2);
    assert_eq!(stats.bytes_received, 150);
    assert_eq!(stats.chunks_dropped, 2);
    assert_eq!(stats.chunks_sent, 0);
    assert!(stats.first_drop_at_ms.is_some());
    assert!(stats.is_balanced());
    assert!(!manager.force_endpoint());
}

#[tokio::test]
async fn open_socket_tracks_buffered_amount() {
    let (endpoint, _) = spawn_server(|_, mut ws| async move {
        let _ = ws.send(begin("sess-3")).await;
        drain(&mut ws).await;
    })
    .await;
    let manager = StreamingManager::new(test_config(endpoint));
    manager.connect(options()).await.unwrap();

    let mut max_seen = 0;
    for _ in 0..20 {
        assert!(manager.send_audio(&[7u8; 3200]));
        let stats = manager.audio_stats();
        assert!(stats.max_buffered_amount >= max_seen);
        assert!(stats.max_buffered_amount >= stats.last_buffered_amount);
        max_seen = stats.max_buffered_amount;
    }
    let stats = manager.audio_stats();
    assert_eq!(stats.chunks_sent, 20);
    assert_eq!(stats.bytes_sent, 64_000);
    assert_eq!(stats.chunks_dropped, 0);
    manager.disconnect(false).await;
}

#[tokio::test]
async fn warm_connection_is_adopted_once() {
    let (endpoint, connections) = spawn_server(|n, mut ws| async move {
        let _ = ws.send(begin(&format!("warm-{}", n))).await;
        drain(&mut ws).await;
    })
    .await;
    let manager = StreamingManager::new(test_config(endpoint));

    manager.warmup(options()).await.unwrap();
    manager.warmup(options()).await.unwrap();
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    let status = manager.status();
    assert!(status.has_warm_connection);
    assert!(status.has_valid_token);
    assert!(!status.is_connected);

    let started = Instant::now();
    let session_id = manager.connect(options()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(session_id, "warm-1");
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    let status = manager.status();
    assert!(status.is_connected);
    assert!(!status.has_warm_connection);
    assert_eq!(status.session_id.as_deref(), Some("warm-1"));
    assert!(manager.send_audio(&[0u8; 320]));
    assert_eq!(
        manager.connect(options()).await.unwrap_err(),
        StreamingError::AlreadyConnected
    );

    let result = manager.disconnect(false).await;
    assert!(!result.termination_timed_out);
    assert_eq!(result.audio_stats.chunks_sent, 1);
    assert_eq!(manager.state(), SessionState::Closed);

    let session_id = manager.connect(options()).await.unwrap();
    assert_eq!(session_id, "warm-2");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    manager.disconnect(false).await;
}

#[tokio::test]
async fn adopted_connection_loss_is_reported_without_rewarm() {
    let (endpoint, connections) = spawn_server(|_, mut ws| async move {
        let _ = ws.send(begin("warm-lost")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: "boom".into(),
            }))
            .await;
        drain(&mut ws).await;
    })
    .await;
    let manager = StreamingManager::new(test_config(endpoint));
    let mut events = manager.subscribe();

    manager.warmup(options()).await.unwrap();
    manager.connect(options()).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        StreamingEvent::Error {
            error: StreamingError::ConnectionLost {
                code: 1011,
                reason: "boom".into()
            },
            connection_lost: true,
        }
    );
    assert_eq!(manager.state(), SessionState::Closed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!manager.rewarm_pending());
    assert_eq!(manager.rewarm_attempts(), 0);
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lost_warm_connection_rewarms_with_backoff_until_cap() {
    let (endpoint, connections) = spawn_server(|n, mut ws| async move {
        let _ = ws.send(begin(&format!("warm-{}", n))).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = ws.close(None).await;
        drain(&mut ws).await;
    })
    .await;
    let manager = StreamingManager::new(test_config(endpoint));

    manager.warmup(options()).await.unwrap();
    assert_eq!(manager.rewarm_attempts(), 0);

    // First loss: one rewarm at the base delay.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.rewarm_attempts(), 1);
    assert_eq!(manager.last_rewarm_delay(), Some(Duration::from_millis(40)));

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(manager.rewarm_attempts(), 3);
    assert_eq!(manager.last_rewarm_delay(), Some(Duration::from_millis(160)));
    assert_eq!(connections.load(Ordering::SeqCst), 4);
    assert!(!manager.rewarm_pending());

    // An explicit warmup resets the budget.
    manager.warmup(options()).await.unwrap();
    assert_eq!(manager.rewarm_attempts(), 0);
    assert_eq!(connections.load(Ordering::SeqCst), 5);
    manager.shutdown();
}

#[tokio::test]
async fn second_consecutive_rewarm_failure_doubles_delay() {
    let (endpoint, connections) = spawn_server(|n, mut ws| async move {
        if n == 1 {
            let _ = ws.send(begin("warm-1")).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = ws.close(None).await;
        }
        // Later connections never send Begin.
        drain(&mut ws).await;
    })
    .await;
    let mut config = test_config(endpoint);
    config.rewarm_delay = Duration::from_millis(30);
    config.connect_timeout = Duration::from_millis(150);
    let manager = StreamingManager::new(config);

    manager.warmup(options()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(manager.last_rewarm_delay(), Some(Duration::from_millis(30)));

    // The rewarmed connection never starts a session; its handshake timeout
    // schedules the second attempt.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(manager.rewarm_attempts(), 2);
    assert_eq!(manager.last_rewarm_delay(), Some(Duration::from_millis(60)));
    assert!(connections.load(Ordering::SeqCst) >= 2);
    manager.shutdown();
}

#[tokio::test]
async fn rewarm_skipped_without_valid_token() {
    let (endpoint, connections) = spawn_server(|n, mut ws| async move {
        let _ = ws.send(begin(&format!("warm-{}", n))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = ws.close(None).await;
        drain(&mut ws).await;
    })
    .await;
    let mut config = test_config(endpoint);
    config.token_expiry_ms = 0;
    config.token_refresh_buffer_ms = 0;
    let manager = StreamingManager::new(config);

    manager.warmup(options()).await.unwrap();
    assert!(!manager.status().has_valid_token);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(!manager.status().has_warm_connection);
}

#[tokio::test]
async fn warm_connection_is_kept_alive_with_pings() {
    let pings = Arc::new(AtomicUsize::new(0));
    let seen = pings.clone();
    let (endpoint, _) = spawn_server(move |_, mut ws| {
        let seen = seen.clone();
        async move {
            let _ = ws.send(begin("warm-ping")).await;
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Ping(_)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    })
    .await;
    let manager = StreamingManager::new(test_config(endpoint));
    manager.warmup(options()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(pings.load(Ordering::SeqCst) >= 2);
    assert!(manager.status().has_warm_connection);
    manager.shutdown();
    assert!(!manager.status().has_warm_connection);
}

#[tokio::test]
async fn force_endpoint_sends_control_frame() {
    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let log = received.clone();
    let (endpoint, _) = spawn_server(move |_, mut ws| {
        let log = log.clone();
        async move {
            let _ = ws.send(begin("sess-fe")).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(t) = msg {
                    log.lock().unwrap().push(t.to_string());
                }
            }
        }
    })
    .await;
    let manager = StreamingManager::new(test_config(endpoint));
    manager.connect(options()).await.unwrap();
    assert!(manager.force_endpoint());
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.disconnect(false).await;

    let texts = received.lock().unwrap().clone();
    assert_eq!(texts, vec![r#"{"type":"ForceEndpoint"}"#.to_string()]);
}

#[tokio::test]
async fn server_error_while_active_is_connection_loss() {
    let (endpoint, _) = spawn_server(|_, mut ws| async move {
        let _ = ws.send(begin("sess-err")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = ws.send(text(r#"{"type":"Error","error":"quota exceeded"}"#)).await;
        drain(&mut ws).await;
    })
    .await;
    let manager = StreamingManager::new(test_config(endpoint));
    let mut first = manager.subscribe();
    let mut second = manager.subscribe();
    manager.connect(options()).await.unwrap();

    let expected = StreamingEvent::Error {
        error: StreamingError::Protocol("quota exceeded".into()),
        connection_lost: true,
    };
    assert_eq!(next_event(&mut first).await, expected);
    assert_eq!(next_event(&mut second).await, expected);
    assert_eq!(manager.state(), SessionState::Closed);
    assert!(!manager.send_audio(&[0u8; 10]));
}

#[tokio::test]
async fn server_error_before_begin_rejects_connect_and_notifies() {
    let (endpoint, _) = spawn_server(|_, mut ws| async move {
        let _ = ws.send(text(r#"{"type":"Error","error":"bad token"}"#)).await;
        drain(&mut ws).await;
    })
    .await;
    let manager = StreamingManager::new(test_config(endpoint));
    let mut events = manager.subscribe();

    let err = manager.connect(options()).await.unwrap_err();
    assert_eq!(err, StreamingError::Protocol("bad token".into()));
    assert_eq!(
        next_event(&mut events).await,
        StreamingEvent::Error {
            error: StreamingError::Protocol("bad token".into()),
            connection_lost: false,
        }
    );
    assert_eq!(manager.state(), SessionState::Closed);
    assert!(!manager.status().is_connected);
}

#[tokio::test]
async fn disconnect_cancels_in_flight_connect() {
    let (endpoint, _) = spawn_server(|_, mut ws| async move { drain(&mut ws).await }).await;
    let mut config = test_config(endpoint);
    config.connect_timeout = Duration::from_secs(5);
    let manager = StreamingManager::new(config);

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(options()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), SessionState::Connecting);

    let result = manager.disconnect(true).await;
    assert!(!result.termination_timed_out);
    let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap_err(), StreamingError::Cancelled);
    assert_eq!(manager.state(), SessionState::Closed);
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let manager = StreamingManager::new(test_config("ws://127.0.0.1:9/v3/ws".into()));
    assert_eq!(
        manager.connect(ConnectOptions::new("  ")).await.unwrap_err(),
        StreamingError::MissingToken
    );
    assert_eq!(
        manager.warmup(ConnectOptions::default()).await.unwrap_err(),
        StreamingError::MissingToken
    );
    assert_eq!(manager.state(), SessionState::Idle);
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let manager = StreamingManager::new(test_config("ws://127.0.0.1:9/v3/ws".into()));
    manager.cleanup();
    manager.cleanup();
    assert_eq!(manager.state(), SessionState::Idle);
    let result = manager.disconnect(true).await;
    assert_eq!(result.text, "");
    assert!(!result.termination_timed_out);
}
