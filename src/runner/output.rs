//! Bounded output capture
//!
//! Each stream of a command is collected into its own [`BoundedBuffer`].
//! Bytes past the limit are counted and dropped, never buffered; the reader
//! keeps draining so the producing process does not block on a full pipe.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Default per-stream capture limit (10 MiB).
pub const DEFAULT_OUTPUT_LIMIT: usize = 10 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// A byte sink that keeps at most `limit` bytes.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    /// Append as much of `data` as fits. Always reports the full length as
    /// consumed.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let room = self.limit.saturating_sub(self.buf.len());
        let take = room.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        self.dropped += data.len() - take;
        data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Bytes that did not fit.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Lossy UTF-8 text, with a marker line when output was cut.
    pub fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.is_truncated() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!(
                "[output truncated: {} bytes dropped]\n",
                self.dropped
            ));
        }
        text
    }
}

impl std::io::Write for BoundedBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        Ok(self.push(data))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A buffer shared between a draining task and the code awaiting the
/// process, so partial output survives cancellation.
pub type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

pub fn shared_buffer(limit: usize) -> SharedBuffer {
    Arc::new(Mutex::new(BoundedBuffer::new(limit)))
}

/// Read `reader` to EOF into `sink`.
pub async fn drain<R>(mut reader: R, sink: SharedBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        if let Ok(mut buf) = sink.lock() {
            buf.push(&chunk[..n]);
        }
    }
}

/// Snapshot a shared buffer's text.
pub fn shared_text(buf: &SharedBuffer) -> String {
    buf.lock().map(|b| b.to_text()).unwrap_or_default()
}

/// stdout followed by stderr.
pub fn combine(stdout: String, stderr: String) -> String {
    if stderr.is_empty() {
        return stdout;
    }
    let mut out = stdout;
    out.push_str(&stderr);
    out
}
