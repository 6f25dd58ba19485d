//! AssemblyAI Universal Streaming (v3) wire format.

use super::ResolvedOptions;
use crate::error::StreamingError;
use serde::{Deserialize, Serialize};
use url::Url;

pub const PCM_ENCODING: &str = "pcm_s16le";

/// Inbound control frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Begin {
        id: String,
        #[serde(default)]
        expires_at: Option<u64>,
    },
    Turn {
        #[serde(default)]
        transcript: String,
        #[serde(default)]
        end_of_turn: bool,
        #[serde(default)]
        turn_is_formatted: bool,
    },
    Termination {
        #[serde(default)]
        audio_duration_seconds: Option<f64>,
    },
    #[serde(alias = "error")]
    Error {
        #[serde(default)]
        error: String,
    },
    #[serde(other)]
    Unknown,
}

/// Outbound control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    ForceEndpoint,
    Terminate,
}

impl ClientMessage {
    pub fn to_json(self) -> String {
        match self {
            ClientMessage::ForceEndpoint => r#"{"type":"ForceEndpoint"}"#.to_string(),
            ClientMessage::Terminate => r#"{"type":"Terminate"}"#.to_string(),
        }
    }
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("parse error: {}", e))
}

fn speech_model_for(language: &str) -> &'static str {
    if language.eq_ignore_ascii_case("en") || language.to_ascii_lowercase().starts_with("en-") {
        "universal-streaming-english"
    } else {
        "universal-streaming-multilingual"
    }
}

pub fn build_streaming_url(
    endpoint: &str,
    options: &ResolvedOptions,
    format_turns: bool,
) -> Result<Url, StreamingError> {
    let mut url =
        Url::parse(endpoint).map_err(|e| StreamingError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("sample_rate", &options.sample_rate.to_string())
            .append_pair("encoding", PCM_ENCODING)
            .append_pair("format_turns", if format_turns { "true" } else { "false" })
            .append_pair("token", &options.token);
        if let Some(language) = options.language.as_deref() {
            query.append_pair("speech_model", speech_model_for(language));
        }
    }
    Ok(url)
}
