use serde::{Deserialize, Serialize};

/// Per-session audio forwarding counters.
///
/// Every chunk handed to the forwarder is counted exactly once as either sent
/// or dropped, so `chunks_received == chunks_sent + chunks_dropped`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStats {
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub chunks_dropped: u64,
    pub bytes_dropped: u64,
    pub first_chunk_at_ms: Option<u64>,
    pub last_chunk_at_ms: Option<u64>,
    pub first_drop_at_ms: Option<u64>,
    pub last_drop_at_ms: Option<u64>,
    /// Bytes queued on the socket but not yet flushed, at the last send.
    pub last_buffered_amount: u64,
    pub max_buffered_amount: u64,
}

impl AudioStats {
    pub(crate) fn record_received(&mut self, bytes: usize, now_ms: u64) {
        self.chunks_received = self.chunks_received.saturating_add(1);
        self.bytes_received = self.bytes_received.saturating_add(bytes as u64);
        self.first_chunk_at_ms.get_or_insert(now_ms);
        self.last_chunk_at_ms = Some(now_ms);
    }

    pub(crate) fn record_dropped(&mut self, bytes: usize, now_ms: u64) {
        self.chunks_dropped = self.chunks_dropped.saturating_add(1);
        self.bytes_dropped = self.bytes_dropped.saturating_add(bytes as u64);
        self.first_drop_at_ms.get_or_insert(now_ms);
        self.last_drop_at_ms = Some(now_ms);
    }

    pub(crate) fn record_sent(&mut self, bytes: usize, buffered_amount: u64) {
        self.chunks_sent = self.chunks_sent.saturating_add(1);
        self.bytes_sent = self.bytes_sent.saturating_add(bytes as u64);
        self.last_buffered_amount = buffered_amount;
        self.max_buffered_amount = self.max_buffered_amount.max(buffered_amount);
    }

    /// Milliseconds of 16-bit mono PCM the sent bytes represent.
    pub fn sent_audio_ms(&self, sample_rate: u32) -> u64 {
        let bytes_per_sec = (sample_rate.max(1) as u64) * 2;
        self.bytes_sent.saturating_mul(1000) / bytes_per_sec
    }

    pub fn is_balanced(&self) -> bool {
        self.chunks_received == self.chunks_sent.saturating_add(self.chunks_dropped)
    }
}
