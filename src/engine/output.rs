//! Bounded output capture
//!
//! A reader keeps the first `limit` bytes of a stream and drains the rest so the
//! child never blocks on a full pipe. Collection stops at EOF or when the supervisor
//! signals that the drain grace period is over.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::debug;

const CHUNK_SIZE: usize = 8 * 1024;

/// Bytes captured from one stream
#[derive(Debug, Default, Clone)]
pub struct CapturedOutput {
    pub data: Vec<u8>,
    /// Total bytes observed on the stream, including discarded ones
    pub total_bytes: usize,
    pub truncated: bool,
}

impl CapturedOutput {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        self.total_bytes += chunk.len();
        let room = limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Read `reader` until EOF, an I/O error, or `stop` flips.
pub async fn capture<R>(mut reader: R, limit: usize, mut stop: watch::Receiver<bool>) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let mut captured = CapturedOutput::default();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            biased;
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => captured.push(&chunk[..n], limit),
                Err(e) => {
                    debug!("Output reader stopped on error: {}", e);
                    break;
                }
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    captured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_under_limit() {
        let (_tx, rx) = watch::channel(false);
        let out = capture(&b"hello world"[..], 64, rx).await;

        assert_eq!(out.data, b"hello world");
        assert_eq!(out.total_bytes, 11);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_capture_truncates_deterministically() {
        let (_tx, rx) = watch::channel(false);
        let input = vec![b'x'; 100_000];
        let out = capture(&input[..], 1000, rx).await;

        assert_eq!(out.data.len(), 1000);
        assert_eq!(out.total_bytes, 100_000);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_capture_stops_on_signal() {
        let (tx, rx) = watch::channel(false);
        // A duplex stream that never reaches EOF while the writer half is alive
        let (_writer, reader) = tokio::io::duplex(64);

        let handle = tokio::spawn(capture(reader, 64, rx));
        tx.send(true).unwrap();

        let out = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("reader did not stop")
            .unwrap();
        assert!(out.data.is_empty());
    }
}
