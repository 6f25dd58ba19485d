use livescribe::{settings, ConnectOptions, StreamingEvent, StreamingManager};
use serde::Deserialize;
use std::time::Duration;

const TOKEN_URL: &str = "https://streaming.assemblyai.com/v3/token";
const CHUNK_MS: u64 = 50;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Exchange an API key for a temporary streaming token.
async fn fetch_token(api_key: &str, expires_in_secs: u64) -> Result<String, String> {
    let client = reqwest::Client::new();
    let resp = client
        .get(TOKEN_URL)
        .query(&[("expires_in_seconds", expires_in_secs)])
        .header("Authorization", api_key)
        .send()
        .await
        .map_err(|e| format!("token request failed: {}", e))?;
    if !resp.status().is_success() {
        return Err(format!("token request returned {}", resp.status()));
    }
    resp.json::<TokenResponse>()
        .await
        .map(|r| r.token)
        .map_err(|e| format!("invalid token response: {}", e))
}

async fn resolve_token(expires_in_secs: u64) -> Result<String, String> {
    if let Ok(token) = std::env::var("LIVESCRIBE_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(token);
        }
    }
    let api_key = std::env::var("ASSEMBLYAI_API_KEY")
        .map_err(|_| "set LIVESCRIBE_TOKEN or ASSEMBLYAI_API_KEY".to_string())?;
    fetch_token(&api_key, expires_in_secs).await
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: livescribe <raw-pcm-s16le-file>");
            std::process::exit(2);
        }
    };
    if let Err(e) = run(&path).await {
        eprintln!("[livescribe] {}", e);
        std::process::exit(1);
    }
}

async fn run(path: &str) -> Result<(), String> {
    let settings = settings::load();
    let pcm = std::fs::read(path).map_err(|e| format!("Failed to read {}: {}", path, e))?;
    let token = resolve_token(settings.token_expiry_ms / 1000).await?;

    let manager = StreamingManager::from_settings(&settings);
    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamingEvent::Partial(text) => println!("[partial] {}", text),
                StreamingEvent::Final(text) => println!("[final] {}", text),
                StreamingEvent::Error {
                    error,
                    connection_lost,
                } => eprintln!("[error] {} (connection_lost={})", error, connection_lost),
                StreamingEvent::SessionEnd(result) => {
                    println!("[end] {:.1}s of audio", result.audio_duration_seconds.unwrap_or(0.0));
                    break;
                }
            }
        }
    });

    let options = ConnectOptions::new(token).with_sample_rate(settings.sample_rate);
    if let Err(e) = manager.warmup(options.clone()).await {
        log::warn!("[livescribe] {}, falling back to cold start", e);
    }
    let session_id = manager.connect(options).await.map_err(|e| e.to_string())?;
    println!("[livescribe] session {}", session_id);

    let chunk_bytes = (settings.sample_rate as usize * 2 * CHUNK_MS as usize / 1000).max(2);
    let mut ticker = tokio::time::interval(Duration::from_millis(CHUNK_MS));
    for chunk in pcm.chunks(chunk_bytes) {
        ticker.tick().await;
        if !manager.send_audio(chunk) && !manager.status().is_connected {
            break;
        }
    }
    manager.force_endpoint();

    let result = manager.disconnect(true).await;
    manager.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| format!("Failed to serialize result: {}", e))?;
    println!("{}", json);
    Ok(())
}
