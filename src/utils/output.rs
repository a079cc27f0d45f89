/// Output boundaries
///
/// `OutputBuffer` is the worker-side capture target for script output;
/// `collect_streams` is the supervisor-side bounded reader for the worker's
/// pipes.
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

/// Whether a stream was read to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamIntegrity {
    Complete,
    /// Reader stopped at its byte limit; the writer may have had more.
    Truncated,
    /// Read failed part-way, or the reader never reported back.
    ReadError,
}

/// In-memory capture buffer that keeps the earliest `limit` bytes.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append text, dropping whatever would cross the limit. The cut always
    /// lands on a char boundary so the buffer stays valid UTF-8.
    pub fn push_str(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.data.len());
        if text.len() <= room {
            self.data.push_str(text);
            return;
        }
        self.data.push_str(&text[..floor_char_boundary(text, room)]);
        self.truncated = true;
    }

    pub fn push_line(&mut self, text: &str) {
        self.push_str(text);
        self.push_str("\n");
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }

    pub fn into_string(self) -> String {
        self.data
    }
}

/// Largest index `<= at` that is a char boundary of `text`.
pub fn floor_char_boundary(text: &str, at: usize) -> usize {
    if at >= text.len() {
        return text.len();
    }
    let mut idx = at;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Clip `text` to at most `limit` bytes at a char boundary.
pub fn truncate_utf8(mut text: String, limit: usize) -> String {
    let cut = floor_char_boundary(&text, limit);
    text.truncate(cut);
    text
}

/// Bytes collected from one pipe.
#[derive(Debug, Clone)]
pub struct CollectedStream {
    pub data: Vec<u8>,
    pub integrity: StreamIntegrity,
}

impl CollectedStream {
    fn missing() -> Self {
        Self {
            data: Vec::new(),
            integrity: StreamIntegrity::ReadError,
        }
    }

    pub fn into_lossy_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Start a reader thread that drains `stream` into memory, keeping at most
/// `limit` bytes. The remainder is still drained so the writer never blocks
/// on a full pipe.
pub fn spawn_reader<R>(stream: R, limit: usize) -> Receiver<CollectedStream>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = tx.send(read_bounded(stream, limit));
    });
    rx
}

fn read_bounded<R: Read>(mut stream: R, limit: usize) -> CollectedStream {
    let mut data = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut integrity = StreamIntegrity::Complete;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let remaining = limit.saturating_sub(data.len());
                if n > remaining {
                    data.extend_from_slice(&chunk[..remaining]);
                    integrity = StreamIntegrity::Truncated;
                } else {
                    data.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("pipe read failed: {e}");
                integrity = StreamIntegrity::ReadError;
                break;
            }
        }
    }

    CollectedStream { data, integrity }
}

/// Wait for both readers, giving up after `timeout` overall. A reader that
/// has not reported in time yields an empty `ReadError` stream.
pub fn collect_streams(
    stdout: Receiver<CollectedStream>,
    stderr: Receiver<CollectedStream>,
    timeout: Duration,
) -> (CollectedStream, CollectedStream) {
    let deadline = Instant::now() + timeout;
    let wait = |rx: Receiver<CollectedStream>, name: &str| {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(stream) => stream,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("{name} reader did not finish within {timeout:?}");
                CollectedStream::missing()
            }
            Err(RecvTimeoutError::Disconnected) => CollectedStream::missing(),
        }
    };
    let out = wait(stdout, "stdout");
    let err = wait(stderr, "stderr");
    (out, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn buffer_keeps_earliest_bytes() {
        let mut buf = OutputBuffer::new(8);
        buf.push_str("abcd");
        buf.push_str("efghij");
        buf.push_str("zzz");
        assert_eq!(buf.as_str(), "abcdefgh");
        assert!(buf.is_truncated());
    }

    #[test]
    fn buffer_cuts_on_char_boundary() {
        let mut buf = OutputBuffer::new(5);
        buf.push_str("ab\u{00e9}\u{00e9}");
        // "ab" + one two-byte char fits in 4 bytes; the next would need 6.
        assert_eq!(buf.as_str(), "ab\u{00e9}");
        assert!(buf.len() <= 5);
    }

    #[test]
    fn push_line_appends_newline() {
        let mut buf = OutputBuffer::new(64);
        buf.push_line("hello");
        buf.push_line("world");
        assert_eq!(buf.into_string(), "hello\nworld\n");
    }

    #[test]
    fn truncate_utf8_never_splits_chars() {
        assert_eq!(truncate_utf8("h\u{00e9}llo".to_string(), 2), "h");
        assert_eq!(truncate_utf8("short".to_string(), 64), "short");
    }

    #[test]
    fn reader_truncates_at_limit() {
        let rx = spawn_reader(Cursor::new(vec![b'x'; 20_000]), 1000);
        let collected = rx.recv().unwrap();
        assert_eq!(collected.data.len(), 1000);
        assert_eq!(collected.integrity, StreamIntegrity::Truncated);
    }

    #[test]
    fn collect_streams_returns_both() {
        let out = spawn_reader(Cursor::new(b"out".to_vec()), 64);
        let err = spawn_reader(Cursor::new(b"err".to_vec()), 64);
        let (out, err) = collect_streams(out, err, Duration::from_secs(1));
        assert_eq!(out.integrity, StreamIntegrity::Complete);
        assert_eq!(out.into_lossy_string(), "out");
        assert_eq!(err.into_lossy_string(), "err");
    }
}
