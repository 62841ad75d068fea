/// Transport plumbing shared by the protocol clients
///
/// This module handles TCP connection setup with error classification, the
/// id-keyed table of in-flight requests and decoding of chunked text streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::{ProbeError, Result};

/// Open a TCP connection, mapping failures onto the retryable error kinds
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    log::debug!("CONNECT: {} (timeout {:?})", addr, timeout);

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Err(_) => Err(ProbeError::ConnectTimeout { addr, timeout }),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(ProbeError::ConnectRefused { addr, source: e })
        }
        Ok(Err(e)) => Err(ProbeError::Io(e)),
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            log::debug!("CONNECT: {} established", addr);
            Ok(stream)
        }
    }
}

struct PendingInner<T> {
    waiters: HashMap<u32, oneshot::Sender<Result<T>>>,
    closed: bool,
}

/// In-flight requests of one protocol session, keyed by request id.
///
/// Every registered id owns exactly one waiter until a response arrives, the
/// caller gives up, or the session closes and rejects all of them.
pub struct PendingRequests<T> {
    next_id: Arc<AtomicU32>,
    inner: Arc<Mutex<PendingInner<T>>>,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            next_id: self.next_id.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU32::new(1)),
            inner: Arc::new(Mutex::new(PendingInner {
                waiters: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Allocate a fresh id and register its waiter before anything is sent
    pub fn register(&self) -> Result<(u32, oneshot::Receiver<Result<T>>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();

        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(ProbeError::ConnectionClosed);
        }
        inner.waiters.insert(id, sender);
        Ok((id, receiver))
    }

    /// Deliver a response; returns false if nobody is waiting for `id`
    pub fn complete(&self, id: u32, value: Result<T>) -> bool {
        let sender = self.inner.lock().unwrap().waiters.remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(value);
                true
            }
            None => {
                log::warn!("RECV[{}]: No pending request found for id!", id);
                false
            }
        }
    }

    pub fn remove(&self, id: u32) {
        self.inner.lock().unwrap().waiters.remove(&id);
    }

    /// Reject every outstanding request and refuse new ones
    pub fn fail_all<F>(&self, error: F)
    where
        F: Fn() -> ProbeError,
    {
        let waiters: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.waiters.drain().collect()
        };
        for (id, sender) in waiters {
            log::debug!("RECV[{}]: Rejecting pending request", id);
            let _ = sender.send(Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Wait for the response registered under `id`
    pub async fn wait(
        &self,
        id: u32,
        receiver: oneshot::Receiver<Result<T>>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.remove(id);
                    return Err(ProbeError::ProbeTimeout { after: limit });
                }
            },
            None => receiver.await,
        };
        outcome.map_err(|_| ProbeError::ConnectionClosed)?
    }
}

/// Turns a chunked byte stream into text without splitting characters.
///
/// A multibyte character cut off at the end of a chunk is held back until
/// the next chunk completes it.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // only an unfinished sequence at the very end is held back
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    /// Whatever is still held back, lossily decoded
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Drop the front of `text` so at most `max_bytes` remain
pub fn keep_tail(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = text.len() - max_bytes;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_out_of_order_completion() {
        let pending: PendingRequests<&'static str> = PendingRequests::new();
        let (first, rx1) = pending.register().unwrap();
        let (second, rx2) = pending.register().unwrap();
        assert!(second > first);

        assert!(pending.complete(second, Ok("two")));
        assert!(pending.complete(first, Ok("one")));

        assert_eq!(pending.wait(first, rx1, None).await.unwrap(), "one");
        assert_eq!(pending.wait(second, rx2, None).await.unwrap(), "two");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_rejects_and_closes() {
        let pending: PendingRequests<()> = PendingRequests::new();
        let (id, rx) = pending.register().unwrap();
        pending.fail_all(|| ProbeError::ConnectionClosed);

        let err = pending.wait(id, rx, None).await.unwrap_err();
        assert!(matches!(err, ProbeError::ConnectionClosed));
        assert!(pending.is_closed());
        assert!(matches!(pending.register(), Err(ProbeError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_wait_timeout_removes_waiter() {
        let pending: PendingRequests<()> = PendingRequests::new();
        let (id, rx) = pending.register().unwrap();
        let err = pending
            .wait(id, rx, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ProbeTimeout { .. }));
        assert!(pending.is_empty());
        assert!(!pending.complete(id, Ok(())));
    }

    #[tokio::test]
    async fn test_connect_refused_is_classified() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_tcp("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ConnectRefused { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_text_decoder_holds_split_character() {
        let mut decoder = TextDecoder::new();
        let bytes = "héllo ✓".as_bytes();
        // cut inside the three-byte check mark
        let (head, tail) = bytes.split_at(bytes.len() - 2);
        assert_eq!(decoder.push(head), "héllo ");
        assert_eq!(decoder.push(tail), "✓");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_text_decoder_flushes_invalid_bytes() {
        let mut decoder = TextDecoder::new();
        assert_eq!(decoder.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");
        assert_eq!(decoder.push(&[0xe2, 0x9c]), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn test_keep_tail_respects_char_boundaries() {
        let mut text = "ab✓cd".to_string();
        keep_tail(&mut text, 4);
        assert_eq!(text, "cd");
        let mut short = "abc".to_string();
        keep_tail(&mut short, 10);
        assert_eq!(short, "abc");
    }
}
