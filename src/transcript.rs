//! Merges end-of-turn fragments into one accumulated transcript.
//!
//! Streaming ASR re-sends an utterance verbatim before finalizing and later
//! sends a formatted (punctuated, capitalized) version of it. Repeats are
//! absorbed; formatted corrections replace the last turn in place.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub text: String,
    /// Comparison-only form, never shown to a user.
    pub normalized_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnAction {
    Added,
    ReplacedPrevious,
    IgnoredDuplicate,
    IgnoredEmpty,
}

impl TurnAction {
    /// Whether subscribers should see a new final transcript.
    pub fn changed_text(self) -> bool {
        matches!(self, TurnAction::Added | TurnAction::ReplacedPrevious)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnUpdate {
    pub action: TurnAction,
    pub accumulated_text: String,
    pub last_turn_text: String,
}

/// Lowercase, keep only letters, digits and whitespace, collapse runs of
/// whitespace.
pub fn normalize_transcript(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            cleaned.extend(ch.to_lowercase());
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn join_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn last_text(turns: &[Turn]) -> String {
    turns.last().map(|t| t.text.clone()).unwrap_or_default()
}

pub fn apply_end_of_turn_transcript(
    turns: &mut Vec<Turn>,
    transcript: &str,
    is_formatted: bool,
) -> TurnUpdate {
    let text = transcript.trim();
    if text.is_empty() {
        return TurnUpdate {
            action: TurnAction::IgnoredEmpty,
            accumulated_text: join_turns(turns),
            last_turn_text: last_text(turns),
        };
    }

    let normalized_text = normalize_transcript(text);
    let action = match turns.last_mut() {
        Some(previous) if previous.normalized_text == normalized_text => {
            if is_formatted && previous.text != text {
                previous.text = text.to_string();
                TurnAction::ReplacedPrevious
            } else {
                TurnAction::IgnoredDuplicate
            }
        }
        _ => {
            turns.push(Turn {
                text: text.to_string(),
                normalized_text,
            });
            TurnAction::Added
        }
    };

    TurnUpdate {
        action,
        accumulated_text: join_turns(turns),
        last_turn_text: last_text(turns),
    }
}
