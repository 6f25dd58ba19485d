//! Pre-opened spare connection and its automatic rewarm with backoff.

use super::assemblyai::{build_streaming_url, parse_server_message, ServerMessage};
use super::session::{Inner, Shared};
use super::socket::{self, ScheduledTask, SocketEvent, SocketHandle};
use super::{ResolvedOptions, SessionState};
use crate::error::StreamingError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Backoff before rewarm `attempt` (1-based): `base * 2^(attempt-1)`, capped.
pub fn rewarm_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

pub(crate) struct WarmConnection {
    pub(crate) id: u64,
    /// `None` until the TCP/TLS/upgrade handshake finishes.
    pub(crate) socket: Option<SocketHandle>,
    pub(crate) ready: bool,
    pub(crate) options: ResolvedOptions,
    /// Server session id, set on Begin.
    pub(crate) session_id: Option<String>,
    opened_at: Instant,
    waiter: Option<oneshot::Sender<Result<(), StreamingError>>>,
    handshake_timer: Option<ScheduledTask>,
    keepalive: Option<ScheduledTask>,
}

impl WarmConnection {
    fn opening(
        id: u64,
        options: ResolvedOptions,
        waiter: oneshot::Sender<Result<(), StreamingError>>,
        handshake_timer: ScheduledTask,
    ) -> Self {
        Self {
            id,
            socket: None,
            ready: false,
            options,
            session_id: None,
            opened_at: Instant::now(),
            waiter: Some(waiter),
            handshake_timer: Some(handshake_timer),
            keepalive: None,
        }
    }

    fn is_adoptable(&self) -> bool {
        self.ready && self.socket.as_ref().is_some_and(|s| s.is_open())
    }
}

#[derive(Default)]
pub(crate) struct WarmPool {
    pub(crate) slot: Option<WarmConnection>,
    pub(crate) rewarm_attempts: u32,
    /// Options of the last successful warmup, reused by rewarm.
    pub(crate) last_options: Option<ResolvedOptions>,
    pub(crate) last_rewarm_delay: Option<Duration>,
    rewarm_task: Option<ScheduledTask>,
}

impl WarmPool {
    pub(crate) fn owns(&self, socket_id: u64) -> bool {
        self.slot.as_ref().is_some_and(|w| w.id == socket_id)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.slot.as_ref().is_some_and(|w| w.is_adoptable())
    }

    pub(crate) fn rewarm_pending(&self) -> bool {
        self.rewarm_task.is_some()
    }

    pub(crate) fn cancel_rewarm(&mut self) {
        if self.rewarm_task.take().is_some() {
            log::debug!("[warm] pending rewarm cancelled");
        }
    }

    /// Move a ready warm connection out of the pool, consuming it. Its
    /// keep-alive and handshake timers are cancelled here; the socket and
    /// session id are returned to the new owner.
    pub(crate) fn take_ready(&mut self) -> Option<(u64, SocketHandle, Option<String>, ResolvedOptions)> {
        if !self.is_ready() {
            return None;
        }
        let warm = self.slot.take()?;
        let WarmConnection {
            id,
            socket,
            session_id,
            options,
            opened_at,
            ..
        } = warm;
        log::debug!(
            "[warm] adopting connection {} (warm for {} ms)",
            id,
            opened_at.elapsed().as_millis()
        );
        socket.map(|s| (id, s, session_id, options))
    }
}

impl Shared {
    /// Open a spare connection and wait for the server's Begin. A no-op when
    /// a warm connection already exists or is being opened.
    pub(crate) async fn open_warm(
        self: &Arc<Self>,
        options: ResolvedOptions,
        explicit: bool,
    ) -> Result<(), StreamingError> {
        let url = build_streaming_url(&self.config.endpoint, &options, self.config.format_turns)?;
        let timeout = self.config.connect_timeout;
        let id = self.next_socket_id();

        let rx = {
            let mut inner = self.lock();
            if inner.warm.slot.is_some() {
                log::debug!("[warm] warm connection already present");
                if explicit {
                    inner.warm.rewarm_attempts = 0;
                }
                return Ok(());
            }
            if explicit {
                inner.warm.cancel_rewarm();
            }
            let (tx, rx) = oneshot::channel();
            let weak = Arc::downgrade(self);
            let timer = ScheduledTask::after(timeout, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_warm_timeout(id);
                }
            });
            inner.warm.slot = Some(WarmConnection::opening(id, options.clone(), tx, timer));
            rx
        };

        log::info!(
            "[warm] opening warm connection {} (explicit={})",
            id,
            explicit
        );
        let opened = tokio::time::timeout(timeout, socket::open(url, id, self.dispatcher())).await;
        {
            let mut inner = self.lock();
            match opened {
                Ok(Ok(sock)) => match inner.warm.slot.as_mut() {
                    Some(warm) if warm.id == id => warm.socket = Some(sock),
                    _ => drop(sock),
                },
                Ok(Err(e)) => {
                    if inner.warm.owns(id) {
                        inner.warm.slot = None;
                    }
                    log::warn!("[warm] failed to open warm connection: {}", e);
                    return Err(StreamingError::WarmupFailed(e.to_string()));
                }
                Err(_) => {
                    if inner.warm.owns(id) {
                        inner.warm.slot = None;
                    }
                    log::warn!("[warm] socket handshake timed out");
                    return Err(StreamingError::WarmupFailed(
                        "socket handshake timed out".into(),
                    ));
                }
            }
        }

        match rx.await {
            Ok(Ok(())) => {
                let mut inner = self.lock();
                if explicit {
                    inner.warm.rewarm_attempts = 0;
                }
                inner.warm.last_options = Some(options);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StreamingError::Cancelled),
        }
    }

    pub(crate) fn on_warm_event(self: &Arc<Self>, inner: &mut Inner, event: SocketEvent) {
        match event {
            SocketEvent::Text(text) => match parse_server_message(&text) {
                Ok(ServerMessage::Begin { id, expires_at }) => self.on_warm_begin(inner, id, expires_at),
                Ok(ServerMessage::Error { error }) => {
                    self.teardown_warm(inner, &format!("server error: {}", error));
                }
                Ok(other) => log::debug!("[warm] ignoring {:?} on idle connection", other),
                Err(e) => log::debug!("[warm] {}", e),
            },
            SocketEvent::Closed { code, reason } => {
                self.teardown_warm(inner, &format!("closed ({}) {}", code, reason));
            }
        }
    }

    fn on_warm_begin(self: &Arc<Self>, inner: &mut Inner, session_id: String, expires_at: Option<u64>) {
        let every = self.config.warm_keepalive_interval;
        let Some(warm) = inner.warm.slot.as_mut() else {
            return;
        };
        if warm.ready {
            return;
        }
        log::info!(
            "[warm] connection {} ready: session={} expires_at={:?} after {} ms",
            warm.id,
            session_id,
            expires_at,
            warm.opened_at.elapsed().as_millis()
        );
        warm.ready = true;
        warm.session_id = Some(session_id);
        warm.handshake_timer = None;

        let id = warm.id;
        let weak = Arc::downgrade(self);
        warm.keepalive = Some(ScheduledTask::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the first immediate tick.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !shared.ping_warm(id) {
                    return;
                }
            }
        }));
        if let Some(waiter) = warm.waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Returns false once the keep-alive loop should stop.
    fn ping_warm(self: &Arc<Self>, id: u64) -> bool {
        let mut inner = self.lock();
        let pinged = match inner.warm.slot.as_ref() {
            Some(warm) if warm.id == id => warm.socket.as_ref().map(|s| s.ping()),
            _ => return false,
        };
        match pinged {
            Some(true) => {
                log::debug!("[warm] keepalive ping on connection {}", id);
                true
            }
            Some(false) => {
                self.teardown_warm(&mut inner, "keep-alive ping failed");
                false
            }
            None => true,
        }
    }

    fn on_warm_timeout(self: &Arc<Self>, id: u64) {
        let mut inner = self.lock();
        let pending = inner
            .warm
            .slot
            .as_ref()
            .is_some_and(|w| w.id == id && !w.ready);
        if pending {
            self.teardown_warm(&mut inner, "timed out waiting for session start");
        }
    }

    /// Drop the warm connection. A connection that had been ready and was
    /// lost while no session is active triggers a rewarm.
    pub(crate) fn teardown_warm(self: &Arc<Self>, inner: &mut Inner, reason: &str) {
        let Some(mut warm) = inner.warm.slot.take() else {
            return;
        };
        let was_ready = warm.ready;
        log::warn!("[warm] connection {} lost: {}", warm.id, reason);
        if let Some(waiter) = warm.waiter.take() {
            let _ = waiter.send(Err(StreamingError::WarmupFailed(reason.to_string())));
        }
        drop(warm);
        if was_ready && inner.state != SessionState::Active {
            self.schedule_rewarm(inner);
        }
    }

    pub(crate) fn schedule_rewarm(self: &Arc<Self>, inner: &mut Inner) {
        let max = self.config.max_rewarm_attempts;
        if inner.warm.rewarm_attempts >= max {
            log::debug!("[warm] rewarm attempts exhausted ({}), waiting for warmup", max);
            return;
        }
        let Some(options) = inner.warm.last_options.clone() else {
            return;
        };
        inner.warm.rewarm_attempts += 1;
        let attempt = inner.warm.rewarm_attempts;
        let delay = rewarm_delay(self.config.rewarm_delay, self.config.max_rewarm_delay, attempt);
        log::info!(
            "[warm] rewarm {}/{} scheduled in {} ms",
            attempt,
            max,
            delay.as_millis()
        );
        inner.warm.last_rewarm_delay = Some(delay);
        let weak = Arc::downgrade(self);
        inner.warm.rewarm_task = Some(ScheduledTask::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.run_rewarm(options).await;
            }
        }));
    }

    async fn run_rewarm(self: &Arc<Self>, options: ResolvedOptions) {
        let token = {
            let mut inner = self.lock();
            if let Some(task) = inner.warm.rewarm_task.take() {
                task.release();
            }
            if inner.state == SessionState::Active || inner.warm.slot.is_some() {
                log::debug!("[warm] rewarm skipped: session active or already warm");
                return;
            }
            match inner.tokens.get_cached_token() {
                Some(token) => token,
                None => {
                    log::debug!("[warm] rewarm skipped: no valid cached token");
                    return;
                }
            }
        };

        let options = ResolvedOptions { token, ..options };
        match self.open_warm(options, false).await {
            Ok(()) => log::info!("[warm] rewarm succeeded"),
            Err(StreamingError::Cancelled) => {}
            Err(e) => {
                log::warn!("[warm] rewarm failed: {}", e);
                let mut inner = self.lock();
                if inner.state != SessionState::Active && inner.warm.slot.is_none() {
                    self.schedule_rewarm(&mut inner);
                }
            }
        }
    }
}
