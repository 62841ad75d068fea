/// Line-oriented text protocol client (ruby-debug-ide)
///
/// A benign command is written as soon as the socket opens; the debuggee is
/// considered live once its answer shows up in the accumulated transcript.

use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::communication::{connect_tcp, keep_tail, TextDecoder};
use crate::{ProbeError, Result};

/// Most recent bytes of the peer's output kept for marker matching
const MAX_TRANSCRIPT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LineTextConfig {
    /// Command written right after connecting
    pub probe_command: String,
    /// Regex that marks a recognizable response
    pub ready_pattern: String,
    /// Pause after the marker before reporting success
    pub settle_delay: Duration,
}

impl Default for LineTextConfig {
    fn default() -> Self {
        Self {
            probe_command: "thread list".to_string(),
            ready_pattern: r"<threads?\b".to_string(),
            settle_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReadProgress {
    bytes: usize,
    closed: bool,
}

pub struct LineTextClient {
    peer: String,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    transcript: Arc<Mutex<String>>,
    progress: watch::Receiver<ReadProgress>,
    reader: Mutex<Option<JoinHandle<()>>>,
    marker: Regex,
    settle_delay: Duration,
    detached: AtomicBool,
}

impl LineTextClient {
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        config: LineTextConfig,
    ) -> Result<Self> {
        let marker = Regex::new(&config.ready_pattern).map_err(|e| {
            ProbeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid ready pattern: {}", e),
            ))
        })?;

        let stream = connect_tcp(host, port, timeout).await?;
        let peer = format!("{}:{}", host, port);
        let (read_half, mut write_half) = stream.into_split();

        let line = format!("{}\n", config.probe_command);
        write_half.write_all(line.as_bytes()).await?;
        log::debug!("SEND: {} -> {}", peer, config.probe_command);

        let transcript = Arc::new(Mutex::new(String::new()));
        let (progress_tx, progress) = watch::channel(ReadProgress::default());
        let reader = tokio::spawn(read_loop(read_half, transcript.clone(), progress_tx, peer.clone()));

        Ok(LineTextClient {
            peer,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            transcript,
            progress,
            reader: Mutex::new(Some(reader)),
            marker,
            settle_delay: config.settle_delay,
            detached: AtomicBool::new(false),
        })
    }

    /// Wait for the ready marker, then let the debuggee settle
    pub async fn probe_liveness(&self, timeout: Duration) -> Result<()> {
        let mut progress = self.progress.clone();
        let wait = async {
            loop {
                let closed = progress.borrow_and_update().closed;
                if self.marker.is_match(&self.transcript.lock().unwrap()) {
                    return Ok(());
                }
                if closed || progress.changed().await.is_err() {
                    return Err(ProbeError::ConnectionClosed);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ProbeError::ProbeTimeout { after: timeout })??;

        log::debug!("{}: ready marker seen, settling for {:?}", self.peer, self.settle_delay);
        tokio::time::sleep(self.settle_delay).await;
        log::info!("ruby debugger {} live", self.peer);
        Ok(())
    }

    /// The most recent output received, up to 64 KiB
    pub fn transcript(&self) -> String {
        self.transcript.lock().unwrap().clone()
    }

    /// Close the socket; the debugger keeps waiting for the next client
    pub async fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                log::warn!("{}: socket shutdown failed: {}", self.peer, e);
            }
        }
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

impl Drop for LineTextClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    transcript: Arc<Mutex<String>>,
    progress: watch::Sender<ReadProgress>,
    peer: String,
) {
    let mut chunk = [0u8; 4096];
    let mut decoder = TextDecoder::new();
    loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&chunk[..n]);
                log::debug!("RECV: {} <- {}", peer, text.trim_end());
                {
                    let mut transcript = transcript.lock().unwrap();
                    transcript.push_str(&text);
                    keep_tail(&mut transcript, MAX_TRANSCRIPT_BYTES);
                }
                progress.send_modify(|p| p.bytes += n);
            }
            Err(e) => {
                log::debug!("{}: read error: {}", peer, e);
                break;
            }
        }
    }
    transcript.lock().unwrap().push_str(&decoder.finish());
    progress.send_modify(|p| p.closed = true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn fast_config() -> LineTextConfig {
        LineTextConfig {
            settle_delay: Duration::from_millis(10),
            ..LineTextConfig::default()
        }
    }

    #[tokio::test]
    async fn test_probe_succeeds_on_marker_split_across_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await.unwrap();
            write_half.write_all(b"<thr").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write_half
                .write_all(b"eads><thread id=\"1\" status=\"run\"/></threads>")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            line
        });

        let client = LineTextClient::connect("127.0.0.1", port, Duration::from_secs(2), fast_config())
            .await
            .unwrap();
        client.probe_liveness(Duration::from_secs(2)).await.unwrap();
        assert!(client.transcript().contains("<threads>"));
        client.detach().await;

        assert_eq!(server.await.unwrap(), "thread list\n");
    }

    #[tokio::test]
    async fn test_probe_times_out_without_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"starting up...\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let client = LineTextClient::connect("127.0.0.1", port, Duration::from_secs(2), fast_config())
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let err = client
            .probe_liveness(Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ProbeTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_probe_fails_fast_when_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = LineTextClient::connect("127.0.0.1", port, Duration::from_secs(2), fast_config())
            .await
            .unwrap();
        let err = client.probe_liveness(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ProbeError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_transcript_is_bounded_and_keeps_split_characters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let noise = vec![b'.'; MAX_TRANSCRIPT_BYTES];
            stream.write_all(&noise).await.unwrap();
            let thread = "<threads><thread name=\"wörker\"/></threads>".as_bytes();
            let split = thread.iter().position(|b| *b == 0xc3).unwrap() + 1;
            stream.write_all(&thread[..split]).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(&thread[split..]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let client = LineTextClient::connect("127.0.0.1", port, Duration::from_secs(2), fast_config())
            .await
            .unwrap();
        client.probe_liveness(Duration::from_secs(2)).await.unwrap();

        let mut transcript = client.transcript();
        for _ in 0..100 {
            if transcript.ends_with("</threads>") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            transcript = client.transcript();
        }
        assert!(transcript.len() <= MAX_TRANSCRIPT_BYTES);
        assert!(transcript.ends_with("<threads><thread name=\"wörker\"/></threads>"));
    }
}
