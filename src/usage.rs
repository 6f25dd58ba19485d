use crate::stats::AudioStats;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Max lines to keep in usage-session.jsonl (one line per session).
const MAX_SESSION_LOG_LINES: usize = 500;

const SESSION_LOG_FILE: &str = "usage-session.jsonl";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    /// RFC 3339 local time the session ended.
    pub ended_at: String,
    pub audio_duration_seconds: Option<f64>,
    pub text_chars: usize,
    pub termination_timed_out: bool,
    pub audio_stats: AudioStats,
}

pub fn session_usage_path(dir: &Path) -> PathBuf {
    dir.join(SESSION_LOG_FILE)
}

pub fn append_session_summary(dir: &Path, summary: &SessionSummary) -> Result<(), String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create usage dir: {}", e))?;
    let path = session_usage_path(dir);
    let mut text = serde_json::to_string(summary)
        .map_err(|e| format!("Failed to serialize usage: {}", e))?;
    text.push('\n');
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, text.as_bytes()))
        .map_err(|e| format!("Failed to append usage log: {}", e))?;
    truncate_log(&path, MAX_SESSION_LOG_LINES);
    Ok(())
}

/// If `path` has more than `max_lines` lines, rewrite it keeping only the last `max_lines`.
fn truncate_log(path: &Path, max_lines: usize) {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return,
    };
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return;
    }
    let mut out = lines[lines.len() - max_lines..].join("\n");
    out.push('\n');
    let _ = fs::write(path, out.as_bytes());
}

/// Most recent `max` sessions, newest first. Unparseable lines are skipped.
pub fn load_recent_sessions(dir: &Path, max: usize) -> Vec<SessionSummary> {
    let text = match fs::read_to_string(session_usage_path(dir)) {
        Ok(t) => t,
        Err(_) => return vec![],
    };
    text.lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .take(max)
        .collect()
}
