//! Fixed-capacity in-memory byte sink.
//!
//! Writes never fail and never block: bytes past the capacity are dropped
//! and the sink is marked truncated. This keeps a child that floods its
//! output pipe from stalling on a full pipe or exhausting memory.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

#[derive(Debug, Clone)]
pub struct BoundedSink {
    buf: Vec<u8>,
    capacity: usize,
    truncated: bool,
    /// Bytes offered, including dropped ones.
    offered: u64,
}

impl BoundedSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(8192)),
            capacity,
            truncated: false,
            offered: 0,
        }
    }

    /// Append as much of `bytes` as fits.
    pub fn append(&mut self, bytes: &[u8]) {
        self.offered = self.offered.saturating_add(bytes.len() as u64);
        let remaining = self.capacity.saturating_sub(self.buf.len());
        let take = bytes.len().min(remaining);
        self.buf.extend_from_slice(&bytes[..take]);
        if take < bytes.len() {
            self.truncated = true;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn offered(&self) -> u64 {
        self.offered
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the sink, returning the kept bytes and the truncated flag.
    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.buf, self.truncated)
    }
}

impl io::Write for BoundedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncWrite for BoundedSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().append(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn keeps_everything_under_capacity() {
        let mut sink = BoundedSink::new(16);
        sink.append(b"hello ");
        sink.append(b"world");
        assert_eq!(sink.as_bytes(), b"hello world");
        assert!(!sink.is_truncated());
        assert_eq!(sink.offered(), 11);
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let mut sink = BoundedSink::new(4);
        sink.append(b"abcd");
        assert_eq!(sink.len(), 4);
        assert!(!sink.is_truncated());
    }

    #[test]
    fn overflow_is_dropped_and_flagged() {
        let mut sink = BoundedSink::new(4);
        sink.append(b"abc");
        sink.append(b"defg");
        sink.append(b"hij");
        assert_eq!(sink.as_bytes(), b"abcd");
        assert!(sink.is_truncated());
        assert_eq!(sink.offered(), 10);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut sink = BoundedSink::new(0);
        sink.append(b"x");
        assert!(sink.is_empty());
        assert!(sink.is_truncated());
    }

    #[test]
    fn write_reports_full_acceptance_past_capacity() {
        let mut sink = BoundedSink::new(2);
        let written = io::Write::write(&mut sink, b"abcdef").unwrap();
        assert_eq!(written, 6);
        let (bytes, truncated) = sink.into_parts();
        assert_eq!(bytes, b"ab");
        assert!(truncated);
    }

    #[tokio::test]
    async fn async_writes_never_exceed_capacity() {
        let mut sink = BoundedSink::new(1024);
        let chunk = vec![b'x'; 300];
        for _ in 0..10 {
            sink.write_all(&chunk).await.unwrap();
        }
        sink.shutdown().await.unwrap();
        assert_eq!(sink.len(), 1024);
        assert_eq!(sink.capacity(), 1024);
        assert!(sink.is_truncated());
        assert_eq!(sink.offered(), 3000);
    }
}
