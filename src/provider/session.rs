use super::assemblyai::{build_streaming_url, parse_server_message, ClientMessage, ServerMessage};
use super::socket::{self, ScheduledTask, SocketEvent, SocketHandle};
use super::warm::WarmPool;
use super::{
    ConnectOptions, DisconnectResult, EventStream, ManagerStatus, ResolvedOptions, SessionState,
    StreamingEvent, Subscribers,
};
use crate::error::StreamingError;
use crate::settings::{ManagerConfig, Settings};
use crate::stats::AudioStats;
use crate::token::{now_ms, TokenCache};
use crate::transcript::{apply_end_of_turn_transcript, Turn};
use crate::usage::{append_session_summary, SessionSummary};
use chrono::Local;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

fn wall_ts() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Owns the active streaming session, the warm spare connection and the
/// token cache. Cheap to clone; clones share one manager.
#[derive(Clone)]
pub struct StreamingManager {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: ManagerConfig,
    inner: Mutex<Inner>,
    next_socket_id: AtomicU64,
}

pub(crate) struct Inner {
    pub(crate) state: SessionState,
    /// Bumped whenever a new session starts; stale timers and late socket
    /// handshakes compare against it.
    generation: u64,
    session_id: Option<String>,
    /// Socket id routed to the session handler, known before the socket
    /// handshake completes.
    session_socket_id: Option<u64>,
    socket: Option<SocketHandle>,
    sample_rate: u32,
    connect_started: Option<Instant>,
    connect_waiter: Option<oneshot::Sender<Result<String, StreamingError>>>,
    connect_timer: Option<ScheduledTask>,
    termination_waiter: Option<oneshot::Sender<DisconnectResult>>,
    turns: Vec<Turn>,
    accumulated_text: String,
    stats: AudioStats,
    pub(crate) warm: WarmPool,
    pub(crate) tokens: TokenCache,
    subscribers: Subscribers,
}

impl Inner {
    fn result(&self, audio_duration_seconds: Option<f64>, termination_timed_out: bool) -> DisconnectResult {
        DisconnectResult {
            audio_duration_seconds,
            text: self.accumulated_text.clone(),
            audio_stats: self.stats.clone(),
            termination_timed_out,
        }
    }

    fn has_session(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connecting | SessionState::Active | SessionState::Terminating
        )
    }
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn next_socket_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Socket callback bound once when a socket opens. Events are routed to
    /// whichever slot owns the socket at the time they arrive.
    pub(crate) fn dispatcher(self: &Arc<Self>) -> impl Fn(u64, SocketEvent) + Send + Sync + 'static {
        let weak = Arc::downgrade(self);
        move |id, event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_socket_event(id, event);
            }
        }
    }

    fn on_socket_event(self: &Arc<Self>, id: u64, event: SocketEvent) {
        let mut inner = self.lock();
        if inner.warm.owns(id) {
            self.on_warm_event(&mut inner, event);
        } else if inner.session_socket_id == Some(id) {
            self.on_session_event(&mut inner, event);
        } else {
            log::debug!("[session] dropping event from released socket {}", id);
        }
    }

    fn resolve(&self, options: ConnectOptions) -> Result<ResolvedOptions, StreamingError> {
        let token = options.token.trim().to_string();
        if token.is_empty() {
            return Err(StreamingError::MissingToken);
        }
        Ok(ResolvedOptions {
            sample_rate: options.sample_rate.unwrap_or(self.config.default_sample_rate),
            language: options
                .language
                .filter(|l| !l.trim().is_empty())
                .or_else(|| self.config.default_language.clone()),
            token,
        })
    }

    fn begin_session(&self, inner: &mut Inner) -> u64 {
        self.cleanup_locked(inner);
        inner.generation += 1;
        inner.generation
    }

    fn adopt_warm(&self, inner: &mut Inner, requested: &ResolvedOptions) -> Option<String> {
        let (id, socket, session_id, options) = inner.warm.take_ready()?;
        if options.sample_rate != requested.sample_rate || options.language != requested.language {
            log::debug!(
                "[session] warm connection opened with {} Hz {:?}, requested {} Hz {:?}",
                options.sample_rate,
                options.language,
                requested.sample_rate,
                requested.language
            );
        }
        inner.warm.cancel_rewarm();
        self.begin_session(inner);
        inner.state = SessionState::Active;
        inner.session_socket_id = Some(id);
        inner.socket = Some(socket);
        inner.sample_rate = options.sample_rate;
        inner.session_id = session_id.clone();
        let session_id = session_id.unwrap_or_default();
        log::info!(
            "[session] [{}] adopted warm connection: session={}",
            wall_ts(),
            session_id
        );
        Some(session_id)
    }

    fn on_connect_timeout(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != SessionState::Connecting {
            return;
        }
        if let Some(timer) = inner.connect_timer.take() {
            timer.release();
        }
        let ms = self.config.connect_timeout.as_millis() as u64;
        log::warn!("[session] no session start within {} ms", ms);
        if let Some(waiter) = inner.connect_waiter.take() {
            let _ = waiter.send(Err(StreamingError::ConnectionTimeout(ms)));
        }
        self.cleanup_locked(&mut inner);
    }

    fn on_session_event(self: &Arc<Self>, inner: &mut Inner, event: SocketEvent) {
        match event {
            SocketEvent::Text(text) => match parse_server_message(&text) {
                Ok(message) => self.on_server_message(inner, message),
                Err(e) => log::debug!("[session] {}", e),
            },
            SocketEvent::Closed { code, reason } => self.on_session_closed(inner, code, reason),
        }
    }

    fn on_server_message(self: &Arc<Self>, inner: &mut Inner, message: ServerMessage) {
        match message {
            ServerMessage::Begin { id, expires_at } => {
                if inner.state != SessionState::Connecting {
                    log::debug!("[session] unexpected session start {} in {:?}", id, inner.state);
                    return;
                }
                let elapsed = inner
                    .connect_started
                    .map(|t| t.elapsed().as_millis())
                    .unwrap_or_default();
                log::info!(
                    "[session] [{}] session started: id={} expires_at={:?} handshake_ms={}",
                    wall_ts(),
                    id,
                    expires_at,
                    elapsed
                );
                inner.state = SessionState::Active;
                inner.session_id = Some(id.clone());
                inner.connect_timer = None;
                inner.warm.cancel_rewarm();
                if let Some(waiter) = inner.connect_waiter.take() {
                    let _ = waiter.send(Ok(id));
                }
            }
            ServerMessage::Turn {
                transcript,
                end_of_turn,
                turn_is_formatted,
            } => {
                if !end_of_turn {
                    inner.subscribers.emit(StreamingEvent::Partial(transcript));
                    return;
                }
                let update =
                    apply_end_of_turn_transcript(&mut inner.turns, &transcript, turn_is_formatted);
                log::debug!(
                    "[session] end of turn (formatted={}): {:?}",
                    turn_is_formatted,
                    update.action
                );
                inner.accumulated_text = update.accumulated_text;
                if update.action.changed_text() {
                    log::info!("[session] transcript final: \"{}\"", update.last_turn_text);
                    inner
                        .subscribers
                        .emit(StreamingEvent::Final(inner.accumulated_text.clone()));
                }
            }
            ServerMessage::Termination {
                audio_duration_seconds,
            } => {
                log::info!(
                    "[session] session terminated: audio_duration={:?}s",
                    audio_duration_seconds
                );
                let result = inner.result(audio_duration_seconds, false);
                if let Some(waiter) = inner.termination_waiter.take() {
                    let _ = waiter.send(result.clone());
                }
                self.record_usage(inner, &result);
                inner.subscribers.emit(StreamingEvent::SessionEnd(result));
                self.cleanup_locked(inner);
            }
            ServerMessage::Error { error } => {
                log::error!("[session] server error: {}", error);
                let err = StreamingError::Protocol(error);
                match inner.state {
                    SessionState::Connecting => {
                        inner.subscribers.emit(StreamingEvent::Error {
                            error: err.clone(),
                            connection_lost: false,
                        });
                        if let Some(waiter) = inner.connect_waiter.take() {
                            let _ = waiter.send(Err(err));
                        }
                        self.cleanup_locked(inner);
                    }
                    SessionState::Active => {
                        inner.subscribers.emit(StreamingEvent::Error {
                            error: err,
                            connection_lost: true,
                        });
                        self.cleanup_locked(inner);
                    }
                    _ => inner.subscribers.emit(StreamingEvent::Error {
                        error: err,
                        connection_lost: false,
                    }),
                }
            }
            ServerMessage::Unknown => log::debug!("[session] ignoring unknown message"),
        }
    }

    fn on_session_closed(&self, inner: &mut Inner, code: u16, reason: String) {
        match inner.state {
            SessionState::Connecting => {
                log::warn!("[session] closed before session start: {} {}", code, reason);
                if let Some(waiter) = inner.connect_waiter.take() {
                    let _ = waiter.send(Err(StreamingError::ConnectionLost { code, reason }));
                }
                self.cleanup_locked(inner);
            }
            SessionState::Active => {
                log::error!("[session] connection lost: {} {}", code, reason);
                inner.subscribers.emit(StreamingEvent::Error {
                    error: StreamingError::ConnectionLost { code, reason },
                    connection_lost: true,
                });
                self.cleanup_locked(inner);
            }
            SessionState::Terminating => {
                // Disconnect owns the teardown; just wake it.
                log::debug!("[session] closed while terminating: {} {}", code, reason);
                inner.socket = None;
                inner.termination_waiter = None;
            }
            SessionState::Idle | SessionState::Closed => {}
        }
    }

    fn record_usage(&self, inner: &Inner, result: &DisconnectResult) {
        let Some(dir) = self.config.usage_dir.clone() else {
            return;
        };
        let summary = SessionSummary {
            session_id: inner.session_id.clone().unwrap_or_default(),
            ended_at: Local::now().to_rfc3339(),
            audio_duration_seconds: result.audio_duration_seconds,
            text_chars: result.text.chars().count(),
            termination_timed_out: result.termination_timed_out,
            audio_stats: result.audio_stats.clone(),
        };
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        tokio::task::spawn_blocking(move || {
            if let Err(e) = append_session_summary(&dir, &summary) {
                log::warn!("[session] {}", e);
            }
        });
    }

    /// Idempotent: cancels session timers, closes the session socket, wakes
    /// any waiter with `Cancelled` and resets session state.
    pub(crate) fn cleanup_locked(&self, inner: &mut Inner) {
        inner.connect_timer = None;
        inner.connect_waiter = None;
        inner.termination_waiter = None;
        inner.socket = None;
        inner.session_socket_id = None;
        inner.connect_started = None;
        inner.session_id = None;
        inner.turns.clear();
        inner.accumulated_text.clear();
        inner.stats = AudioStats::default();
        if inner.state != SessionState::Idle {
            inner.state = SessionState::Closed;
        }
    }
}

impl Default for StreamingManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl StreamingManager {
    pub fn new(config: ManagerConfig) -> Self {
        let tokens = TokenCache::new(config.token_expiry_ms, config.token_refresh_buffer_ms);
        let inner = Inner {
            state: SessionState::Idle,
            generation: 0,
            session_id: None,
            session_socket_id: None,
            socket: None,
            sample_rate: config.default_sample_rate,
            connect_started: None,
            connect_waiter: None,
            connect_timer: None,
            termination_waiter: None,
            turns: Vec::new(),
            accumulated_text: String::new(),
            stats: AudioStats::default(),
            warm: WarmPool::default(),
            tokens,
            subscribers: Subscribers::default(),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(inner),
                next_socket_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.manager_config())
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Register a listener. Every subscriber receives every event.
    pub fn subscribe(&self) -> EventStream {
        self.shared.lock().subscribers.subscribe()
    }

    pub fn cache_token(&self, token: &str) {
        self.shared.lock().tokens.cache_token(token);
    }

    pub fn cached_token(&self) -> Option<String> {
        self.shared.lock().tokens.get_cached_token()
    }

    /// Open a spare connection so the next `connect` skips the handshake.
    pub async fn warmup(&self, options: ConnectOptions) -> Result<(), StreamingError> {
        let options = self.shared.resolve(options)?;
        self.shared.lock().tokens.cache_token(&options.token);
        self.shared.open_warm(options, true).await
    }

    /// Start a session, adopting a ready warm connection when there is one.
    /// Returns the server session id.
    pub async fn connect(&self, options: ConnectOptions) -> Result<String, StreamingError> {
        let shared = &self.shared;
        let options = shared.resolve(options)?;
        let url = build_streaming_url(&shared.config.endpoint, &options, shared.config.format_turns)?;
        let timeout = shared.config.connect_timeout;
        let id = shared.next_socket_id();

        let (generation, mut rx) = {
            let mut inner = shared.lock();
            if inner.has_session() {
                return Err(StreamingError::AlreadyConnected);
            }
            inner.tokens.cache_token(&options.token);
            if let Some(session_id) = shared.adopt_warm(&mut inner, &options) {
                return Ok(session_id);
            }

            let generation = shared.begin_session(&mut inner);
            inner.state = SessionState::Connecting;
            inner.session_socket_id = Some(id);
            inner.sample_rate = options.sample_rate;
            inner.connect_started = Some(Instant::now());
            let (tx, rx) = oneshot::channel();
            inner.connect_waiter = Some(tx);
            let weak = Arc::downgrade(shared);
            inner.connect_timer = Some(ScheduledTask::after(timeout, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_connect_timeout(generation);
                }
            }));
            (generation, rx)
        };
        log::info!("[session] [{}] cold connect (socket {})", wall_ts(), id);

        let opened = tokio::select! {
            biased;
            opened = socket::open(url, id, shared.dispatcher()) => opened,
            settled = &mut rx => {
                return settled.unwrap_or(Err(StreamingError::Cancelled));
            }
        };

        {
            let mut inner = shared.lock();
            let current = inner.generation == generation && inner.session_socket_id == Some(id);
            match opened {
                Ok(sock) if current => inner.socket = Some(sock),
                Ok(sock) => drop(sock),
                Err(e) if current => {
                    log::error!("[session] connect failed: {}", e);
                    shared.cleanup_locked(&mut inner);
                    return Err(e);
                }
                Err(e) => log::debug!("[session] late connect failure ignored: {}", e),
            }
        }

        rx.await.unwrap_or(Err(StreamingError::Cancelled))
    }

    /// Forward one PCM chunk. Never blocks and never errors; `false` means the
    /// chunk was dropped because no session socket is open.
    pub fn send_audio(&self, chunk: &[u8]) -> bool {
        let mut inner = self.shared.lock();
        let now = now_ms();
        inner.stats.record_received(chunk.len(), now);
        let buffered = match inner.socket.as_ref() {
            Some(socket) if socket.send_binary(chunk.to_vec()) => Some(socket.buffered_amount()),
            _ => None,
        };
        match buffered {
            Some(buffered) => {
                inner.stats.record_sent(chunk.len(), buffered);
                true
            }
            None => {
                inner.stats.record_dropped(chunk.len(), now);
                if inner.stats.chunks_dropped == 1 || inner.stats.chunks_dropped % 50 == 0 {
                    log::warn!(
                        "[session] audio dropped, socket not open (dropped={})",
                        inner.stats.chunks_dropped
                    );
                }
                false
            }
        }
    }

    /// Ask the server to finalize the current utterance.
    pub fn force_endpoint(&self) -> bool {
        let inner = self.shared.lock();
        if inner.state != SessionState::Active {
            return false;
        }
        let sent = inner
            .socket
            .as_ref()
            .is_some_and(|s| s.send_text(ClientMessage::ForceEndpoint.to_json()));
        if sent {
            log::debug!("[session] [{}] force endpoint sent", wall_ts());
        }
        sent
    }

    /// End the session. With `terminate`, ask the server to flush and wait up
    /// to the termination timeout for its acknowledgement.
    pub async fn disconnect(&self, terminate: bool) -> DisconnectResult {
        let shared = &self.shared;
        let (generation, rx) = {
            let mut inner = shared.lock();
            let can_terminate = terminate
                && inner.state == SessionState::Active
                && inner.socket.as_ref().is_some_and(|s| s.is_open());
            if !can_terminate {
                let result = inner.result(None, false);
                if inner.state == SessionState::Active || inner.state == SessionState::Terminating {
                    shared.record_usage(&inner, &result);
                }
                shared.cleanup_locked(&mut inner);
                return result;
            }

            inner.state = SessionState::Terminating;
            let (tx, rx) = oneshot::channel();
            inner.termination_waiter = Some(tx);
            if let Some(socket) = inner.socket.as_ref() {
                socket.send_text(ClientMessage::Terminate.to_json());
            }
            log::info!("[session] [{}] terminate sent", wall_ts());
            (inner.generation, rx)
        };

        let waited = tokio::time::timeout(shared.config.termination_timeout, rx).await;
        let mut inner = shared.lock();
        let result = match waited {
            Ok(Ok(result)) => result,
            _ => {
                log::warn!(
                    "[session] no termination ack within {} ms, using accumulated text",
                    shared.config.termination_timeout.as_millis()
                );
                let result = inner.result(None, true);
                shared.record_usage(&inner, &result);
                result
            }
        };
        if inner.generation == generation {
            shared.cleanup_locked(&mut inner);
        }
        result
    }

    pub fn cleanup(&self) {
        let mut inner = self.shared.lock();
        self.shared.cleanup_locked(&mut inner);
    }

    /// Tear everything down: the session, the warm connection and any
    /// pending rewarm.
    pub fn shutdown(&self) {
        let mut inner = self.shared.lock();
        self.shared.cleanup_locked(&mut inner);
        inner.warm.cancel_rewarm();
        if inner.warm.slot.take().is_some() {
            log::info!("[warm] warm connection released on shutdown");
        }
    }

    pub fn status(&self) -> ManagerStatus {
        let inner = self.shared.lock();
        ManagerStatus {
            is_connected: inner.state == SessionState::Active,
            session_id: inner.session_id.clone(),
            has_warm_connection: inner.warm.is_ready(),
            has_valid_token: inner.tokens.is_token_valid(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn accumulated_text(&self) -> String {
        self.shared.lock().accumulated_text.clone()
    }

    pub fn audio_stats(&self) -> AudioStats {
        self.shared.lock().stats.clone()
    }

    /// Sample rate of the current (or last) session.
    pub fn sample_rate(&self) -> u32 {
        self.shared.lock().sample_rate
    }

    pub fn rewarm_attempts(&self) -> u32 {
        self.shared.lock().warm.rewarm_attempts
    }

    /// Backoff used for the most recently scheduled rewarm.
    pub fn last_rewarm_delay(&self) -> Option<Duration> {
        self.shared.lock().warm.last_rewarm_delay
    }

    pub fn rewarm_pending(&self) -> bool {
        self.shared.lock().warm.rewarm_pending()
    }
}
