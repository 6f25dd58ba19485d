use crate::error::StreamingError;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::{connect_async, tungstenite};
use url::Url;

const USER_AGENT: &str = concat!("livescribe/", env!("CARGO_PKG_VERSION"));

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

/// What a socket reports back to whoever currently owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SocketEvent {
    Text(String),
    Closed { code: u16, reason: String },
}

/// A spawned task that is aborted when this value is dropped.
pub(crate) struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    pub(crate) fn after<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        })
    }

    /// Forget the task without aborting it. Used by a task that is about to
    /// run past its own slot being cleared.
    pub(crate) fn release(mut self) {
        self.handle.take();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Owned end of an open WebSocket. Dropping it closes the socket.
pub(crate) struct SocketHandle {
    id: u64,
    outbound: mpsc::UnboundedSender<tungstenite::Message>,
    buffered: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

fn payload_len(msg: &tungstenite::Message) -> u64 {
    match msg {
        tungstenite::Message::Text(t) => t.len() as u64,
        tungstenite::Message::Binary(b) => b.len() as u64,
        _ => 0,
    }
}

impl SocketHandle {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Bytes queued for the writer task but not yet flushed to the network.
    pub(crate) fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send(&self, msg: tungstenite::Message) -> bool {
        if !self.is_open() {
            return false;
        }
        let len = payload_len(&msg);
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.outbound.send(msg).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn send_text(&self, text: String) -> bool {
        self.send(tungstenite::Message::Text(text.into()))
    }

    pub(crate) fn send_binary(&self, data: Vec<u8>) -> bool {
        self.send(tungstenite::Message::Binary(data.into()))
    }

    pub(crate) fn ping(&self) -> bool {
        self.send(tungstenite::Message::Ping(Vec::new().into()))
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            log::debug!("[socket] closing socket {}", self.id);
            let _ = self.outbound.send(tungstenite::Message::Close(None));
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

pub(crate) fn build_ws_request(url: &Url) -> Result<Request<()>, StreamingError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamingError::InvalidUrl(e.to_string()))?;
    request
        .headers_mut()
        .insert("User-Agent", HeaderValue::from_static(USER_AGENT));
    Ok(request)
}

/// Token-bearing query values are not logged.
pub(crate) fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}

/// Open a socket and start its writer and reader tasks. Every inbound text
/// frame and the final close are handed to `dispatch` tagged with `id`.
pub(crate) async fn open<F>(url: Url, id: u64, dispatch: F) -> Result<SocketHandle, StreamingError>
where
    F: Fn(u64, SocketEvent) + Send + Sync + 'static,
{
    let request = build_ws_request(&url)?;
    log::debug!("[socket] opening socket {}: {}", id, redact(&url));

    let ws_stream = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => return Err(StreamingError::Connect(e.to_string())),
    };
    log::debug!("[socket] socket {} connected", id);

    let (ws_tx, ws_rx) = ws_stream.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicU64::new(0));
    let open = Arc::new(AtomicBool::new(true));

    tokio::spawn(write_loop(id, ws_tx, outbound_rx, buffered.clone(), open.clone()));
    let reader = tokio::spawn(read_loop(id, ws_rx, open.clone(), dispatch));

    Ok(SocketHandle {
        id,
        outbound,
        buffered,
        open,
        reader: Some(reader),
    })
}

async fn write_loop(
    id: u64,
    mut ws_tx: WsSink,
    mut outbound_rx: mpsc::UnboundedReceiver<tungstenite::Message>,
    buffered: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
) {
    while let Some(msg) = outbound_rx.recv().await {
        let len = payload_len(&msg);
        let closing = matches!(msg, tungstenite::Message::Close(_));
        let result = ws_tx.send(msg).await;
        buffered.fetch_sub(len, Ordering::SeqCst);
        if let Err(e) = result {
            log::debug!("[socket] socket {} write failed: {}", id, e);
            break;
        }
        if closing {
            break;
        }
    }
    open.store(false, Ordering::SeqCst);
    let _ = ws_tx.close().await;
}

async fn read_loop<F>(id: u64, mut ws_rx: WsSource, open: Arc<AtomicBool>, dispatch: F)
where
    F: Fn(u64, SocketEvent) + Send + Sync + 'static,
{
    let mut code = StreamingError::ABNORMAL_CLOSE;
    let mut reason = String::new();
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(tungstenite::Message::Text(text)) => {
                dispatch(id, SocketEvent::Text(text.to_string()));
            }
            Ok(tungstenite::Message::Close(frame)) => {
                if let Some(frame) = frame {
                    code = frame.code.into();
                    reason = frame.reason.to_string();
                } else {
                    code = 1005;
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                reason = e.to_string();
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    log::debug!("[socket] socket {} closed: {} {}", id, code, reason);
    dispatch(id, SocketEvent::Closed { code, reason });
}
