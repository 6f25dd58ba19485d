//! Real-time speech-to-text streaming connection manager.
//!
//! [`StreamingManager`] owns one active WebSocket session to a streaming
//! transcription service plus a pre-warmed spare connection, assembles turn
//! fragments into an accumulated transcript, and shuts sessions down without
//! ever hanging the caller.

pub mod error;
pub mod provider;
pub mod settings;
pub mod stats;
pub mod token;
pub mod transcript;
pub mod usage;

pub use error::StreamingError;
pub use provider::session::StreamingManager;
pub use provider::warm::rewarm_delay;
pub use provider::{
    ConnectOptions, DisconnectResult, EventStream, ManagerStatus, SessionState, StreamingEvent,
};
pub use settings::{ManagerConfig, Settings};
pub use stats::AudioStats;
