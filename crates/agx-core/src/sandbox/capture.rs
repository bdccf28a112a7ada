//! Bounded incremental capture of a child's output stream.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

/// Keeps at most `cap` bytes; anything beyond is counted and dropped.
#[derive(Debug)]
pub(crate) struct CaptureBuffer {
    bytes: Vec<u8>,
    cap: usize,
    dropped: u64,
}

impl CaptureBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    /// Append a chunk. Returns `true` the first time the cap is exceeded.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> bool {
        let was_truncated = self.truncated();
        let room = self.cap.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        self.dropped += (chunk.len() - take) as u64;
        !was_truncated && self.truncated()
    }

    pub(crate) fn truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Decoded text, never longer than the cap in bytes.
    pub(crate) fn text(&self) -> String {
        within_bytes(String::from_utf8_lossy(&self.bytes).into_owned(), self.cap)
    }
}

/// Cut `text` to at most `max` bytes on a char boundary.
pub(crate) fn within_bytes(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

pub(crate) type SharedCapture = Arc<Mutex<CaptureBuffer>>;

pub(crate) fn shared(cap: usize) -> SharedCapture {
    Arc::new(Mutex::new(CaptureBuffer::new(cap)))
}

/// Read `reader` to EOF into `sink`, signalling `overflow` once when the cap
/// is first exceeded. Keeps reading after overflow so the child never blocks
/// on a full pipe.
pub(crate) async fn drain<R>(
    mut reader: R,
    sink: SharedCapture,
    overflow: Arc<Notify>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let first_overflow = sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(&buf[..n]);
        if first_overflow {
            overflow.notify_one();
        }
    }
}

/// Snapshot of a shared capture: text and truncation flag.
pub(crate) fn snapshot(sink: &SharedCapture) -> (String, bool) {
    let guard = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    (guard.text(), guard.truncated())
}
