pub mod assemblyai;
pub mod session;
pub(crate) mod socket;
pub(crate) mod warm;

use crate::error::StreamingError;
use crate::stats::AudioStats;
use serde::Serialize;
use tokio::sync::mpsc;

/// Options accepted by `warmup` and `connect`. Only `token` is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub sample_rate: Option<u32>,
    pub language: Option<String>,
    pub token: String,
}

impl ConnectOptions {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Options with manager defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub sample_rate: u32,
    pub language: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Terminating,
    Closed,
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingEvent {
    /// Raw text of a turn still being recognized.
    Partial(String),
    /// Accumulated transcript after a turn was added or corrected.
    Final(String),
    Error {
        error: StreamingError,
        /// The active session is gone; stop any in-progress recording.
        connection_lost: bool,
    },
    SessionEnd(DisconnectResult),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisconnectResult {
    pub audio_duration_seconds: Option<f64>,
    pub text: String,
    pub audio_stats: AudioStats,
    pub termination_timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub is_connected: bool,
    pub session_id: Option<String>,
    pub has_warm_connection: bool,
    pub has_valid_token: bool,
}

pub type EventStream = mpsc::UnboundedReceiver<StreamingEvent>;

/// Fan-out of events to every live subscriber.
#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<StreamingEvent>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&mut self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    /// Dropped receivers are pruned here.
    pub(crate) fn emit(&mut self, event: StreamingEvent) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
