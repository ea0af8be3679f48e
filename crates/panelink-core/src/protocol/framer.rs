//! Line framing on top of the byte transport

use std::time::Duration;

use tokio::time::Instant;

use super::transport::ByteReader;
use super::Result;

/// Frame delimiter on the wire
pub const FRAME_DELIMITER: &[u8] = b"\n";

/// Accumulates transport bytes into delimiter-terminated frames.
///
/// Bytes that arrive after a delimiter in the same read are kept for the next
/// call, so frames are never split or merged.
pub struct LineReader {
    reader: ByteReader,
    pending: Vec<u8>,
    poll: Duration,
}

impl LineReader {
    pub fn new(reader: ByteReader, poll: Duration) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// Read until the buffer ends with `delimiter`, or until `timeout` (measured
    /// from the start of this call) elapses.
    ///
    /// On timeout the partial, possibly delimiter-less buffer is returned.
    /// With no timeout this waits for a delimiter indefinitely.
    pub async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(frame) = self.take_frame(delimiter) {
                return Ok(frame);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(std::mem::take(&mut self.pending));
                    }
                    self.poll.min(deadline - now)
                }
                None => self.poll,
            };

            let bytes = self.reader.read_available(wait).await?;
            self.pending.extend_from_slice(&bytes);
        }
    }

    /// Discard stale bytes left in the transport from an earlier session
    pub async fn flush_input(&mut self) -> Result<usize> {
        let mut discarded = std::mem::take(&mut self.pending).len();
        loop {
            let bytes = self.reader.read_available(self.poll).await?;
            if bytes.is_empty() {
                break;
            }
            discarded += bytes.len();
        }
        if discarded > 0 {
            tracing::debug!(len = discarded, "flushed stale input");
        }
        Ok(discarded)
    }

    fn take_frame(&mut self, delimiter: &[u8]) -> Option<Vec<u8>> {
        if delimiter.is_empty() || self.pending.len() < delimiter.len() {
            return None;
        }
        let end = self
            .pending
            .windows(delimiter.len())
            .position(|w| w == delimiter)?
            + delimiter.len();
        let rest = self.pending.split_off(end);
        Some(std::mem::replace(&mut self.pending, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::split;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    fn line_reader(stream: tokio::io::DuplexStream) -> LineReader {
        let (reader, _writer) = split(stream, 128);
        LineReader::new(reader, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_frame_fed_one_byte_at_a_time() {
        let (client, mut panel) = tokio::io::duplex(64);
        let mut lines = line_reader(client);
        let frame = b"{\"event\":\"x\"}\n";

        let (done_tx, mut done_rx) = tokio::sync::watch::channel(false);
        let feeder = tokio::spawn(async move {
            for (i, byte) in frame.iter().enumerate() {
                // Nothing may come back before the final byte is written
                assert!(!*done_rx.borrow_and_update(), "returned early at byte {i}");
                panel.write_all(&[*byte]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            panel
        });

        let got = lines.read_until(FRAME_DELIMITER, None).await.unwrap();
        let _ = done_tx.send(true);
        assert_eq!(got, frame.to_vec());
        let _panel = feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_buffer() {
        let (client, mut panel) = tokio::io::duplex(64);
        let mut lines = line_reader(client);
        panel.write_all(b"{\"event\":").await.unwrap();

        let start = std::time::Instant::now();
        let got = lines
            .read_until(FRAME_DELIMITER, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(got, b"{\"event\":".to_vec());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_timeout_with_silent_link_returns_empty() {
        let (client, _panel) = tokio::io::duplex(64);
        let mut lines = line_reader(client);
        let got = lines
            .read_until(FRAME_DELIMITER, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_back_to_back_frames_are_split() {
        let (client, mut panel) = tokio::io::duplex(64);
        let mut lines = line_reader(client);
        panel.write_all(b"one\r\ntwo\nthr").await.unwrap();

        assert_eq!(
            lines.read_until(FRAME_DELIMITER, None).await.unwrap(),
            b"one\r\n".to_vec()
        );
        assert_eq!(
            lines.read_until(FRAME_DELIMITER, None).await.unwrap(),
            b"two\n".to_vec()
        );
        panel.write_all(b"ee\n").await.unwrap();
        assert_eq!(
            lines.read_until(FRAME_DELIMITER, None).await.unwrap(),
            b"three\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_flush_input_discards_stale_bytes() {
        let (client, mut panel) = tokio::io::duplex(64);
        let mut lines = line_reader(client);
        panel.write_all(b"garbage from last session").await.unwrap();

        let discarded = lines.flush_input().await.unwrap();
        assert_eq!(discarded, 25);

        panel.write_all(b"{\"event\":\"fresh\"}\n").await.unwrap();
        assert_eq!(
            lines.read_until(FRAME_DELIMITER, None).await.unwrap(),
            b"{\"event\":\"fresh\"}\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_eof_surfaces_as_link_broken() {
        let (client, panel) = tokio::io::duplex(64);
        let mut lines = line_reader(client);
        drop(panel);
        let err = lines.read_until(FRAME_DELIMITER, None).await.unwrap_err();
        assert!(err.is_link_broken());
    }
}
