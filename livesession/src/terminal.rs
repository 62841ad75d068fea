/// Remote terminal surface
///
/// A [`RemoteTerminal`] presents one continuously addressable terminal backed
/// by a sequence of child processes, never more than one alive at a time.
/// Output goes to a single event sink that survives restarts, so a host UI
/// subscribes once and keeps the same handle for the whole session.

use debugprobe::communication::{keep_tail, TextDecoder};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::process::{PipedProcess, SpawnCommand};
use crate::{Result, SessionError};

/// Byte written to ask the process to stop (Ctrl-C)
pub const INTERRUPT: u8 = 0x03;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);
/// Per stream, for diagnosing an unexpected exit
pub const MAX_CAPTURED_BYTES: usize = 16 * 1024;

/// Everything the surface shows, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Display text with `\r\n` line endings
    Output(String),
    /// Clear the visible surface
    Clear,
    /// A process was bound to the surface
    Bound { pid: Option<u32> },
    /// The bound process exited and was released
    Unbound { exit_code: Option<i32> },
}

/// Tail of what the bound process wrote, before display normalization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type ExitState = Option<Option<i32>>;

struct Binding {
    generation: u64,
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<ExitState>,
}

struct Inner {
    name: String,
    command: SpawnCommand,
    grace: Duration,
    sink: Mutex<Option<mpsc::UnboundedSender<TerminalEvent>>>,
    binding: Mutex<Option<Binding>>,
    stdin: tokio::sync::Mutex<Option<(u64, ChildStdin)>>,
    captured: Mutex<CapturedOutput>,
    on_close: Box<dyn Fn(Option<i32>) + Send + Sync>,
    generation: AtomicU64,
    disposed: AtomicBool,
}

impl Inner {
    fn emit(&self, event: TerminalEvent) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            let _ = sink.send(event);
        }
    }
}

#[derive(Clone)]
pub struct RemoteTerminal {
    inner: Arc<Inner>,
}

impl RemoteTerminal {
    /// Open the surface by spawning `command`.
    ///
    /// `on_close` runs every time a bound process exits, including exits
    /// caused by [`RemoteTerminal::restart`].
    pub async fn create<F>(
        command: SpawnCommand,
        name: impl Into<String>,
        on_close: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TerminalEvent>)>
    where
        F: Fn(Option<i32>) + Send + Sync + 'static,
    {
        Self::create_with_grace(command, name, DEFAULT_GRACE_PERIOD, on_close).await
    }

    pub async fn create_with_grace<F>(
        command: SpawnCommand,
        name: impl Into<String>,
        grace: Duration,
        on_close: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TerminalEvent>)>
    where
        F: Fn(Option<i32>) + Send + Sync + 'static,
    {
        let (sink, events) = mpsc::unbounded_channel();
        let terminal = RemoteTerminal {
            inner: Arc::new(Inner {
                name: name.into(),
                command,
                grace,
                sink: Mutex::new(Some(sink)),
                binding: Mutex::new(None),
                stdin: tokio::sync::Mutex::new(None),
                captured: Mutex::new(CapturedOutput::default()),
                on_close: Box::new(on_close),
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        };
        terminal.bind().await?;
        Ok((terminal, events))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_bound(&self) -> bool {
        self.inner.binding.lock().unwrap().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.binding.lock().unwrap().as_ref().and_then(|b| b.pid)
    }

    /// Output of the current or most recently exited process
    pub fn captured_output(&self) -> CapturedOutput {
        self.inner.captured.lock().unwrap().clone()
    }

    /// Forward input to the bound process; a no-op when nothing is bound
    pub async fn write(&self, input: &str) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.inner.stdin.lock().await;
        if let Some((_, stdin)) = slot.as_mut() {
            let written = match stdin.write_all(input.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                log::debug!("Terminal '{}': input dropped: {}", self.inner.name, e);
            }
        }
    }

    /// Send Ctrl-C, close stdin and wait for the process to exit.
    ///
    /// The process is force-killed once the grace period passes. Returns
    /// when the exit has been observed or the kill could not be confirmed.
    pub async fn send_interrupt(&self) {
        let (generation, exited) = match self.inner.binding.lock().unwrap().as_ref() {
            Some(binding) => (binding.generation, binding.exited.clone()),
            None => return,
        };

        let stdin = {
            let mut slot = self.inner.stdin.lock().await;
            match slot.as_ref() {
                Some((g, _)) if *g == generation => slot.take(),
                _ => None,
            }
        };
        if let Some((_, mut stdin)) = stdin {
            let written = match stdin.write_all(&[INTERRUPT]).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                log::debug!("Terminal '{}': interrupt not delivered: {}", self.inner.name, e);
            }
        }

        if wait_exit(exited.clone(), self.inner.grace).await {
            return;
        }
        log::warn!(
            "Terminal '{}': process did not exit within {:?}, killing",
            self.inner.name,
            self.inner.grace
        );
        self.kill_generation(generation);
        if !wait_exit(exited, self.inner.grace).await {
            log::error!("Terminal '{}': process still running after kill", self.inner.name);
        }
    }

    /// Replace the bound process with a fresh one under the same command
    pub async fn restart(&self) -> Result<()> {
        log::info!("Terminal '{}': restarting", self.inner.name);
        self.send_interrupt().await;
        self.inner.emit(TerminalEvent::Clear);
        self.inner.emit(TerminalEvent::Output(format!(
            "\x1b[1;33m*** restarting: {} ***\x1b[0m\r\n",
            self.inner.command
        )));
        self.bind().await
    }

    /// Kill any bound process and release the event sink; idempotent
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Terminal '{}': disposing", self.inner.name);
        if let Some(binding) = self.inner.binding.lock().unwrap().as_mut() {
            if let Some(kill) = binding.kill.take() {
                let _ = kill.send(());
            }
        }
        if let Ok(mut slot) = self.inner.stdin.try_lock() {
            slot.take();
        }
        self.inner.sink.lock().unwrap().take();
    }

    /// Wait until no process is bound, up to `limit`
    pub async fn wait_closed(&self, limit: Duration) -> bool {
        let exited = self
            .inner
            .binding
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.exited.clone());
        match exited {
            Some(exited) => wait_exit(exited, limit).await,
            None => true,
        }
    }

    fn kill_generation(&self, generation: u64) {
        if let Some(binding) = self.inner.binding.lock().unwrap().as_mut() {
            if binding.generation == generation {
                if let Some(kill) = binding.kill.take() {
                    let _ = kill.send(());
                }
            }
        }
    }

    async fn bind(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SessionError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "terminal disposed",
            )));
        }
        if self.is_bound() {
            return Err(SessionError::Spawn(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "terminal already has a live process",
            )));
        }

        let mut process = PipedProcess::start(&self.inner.command)?;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = process.id();
        let stdin = process.take_stdin();
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        if let Some(stdin) = stdin {
            *self.inner.stdin.lock().await = Some((generation, stdin));
        }
        *self.inner.captured.lock().unwrap() = CapturedOutput::default();
        *self.inner.binding.lock().unwrap() = Some(Binding {
            generation,
            pid,
            kill: Some(kill_tx),
            exited: exit_rx,
        });
        self.inner.emit(TerminalEvent::Bound { pid });
        log::debug!(
            "Terminal '{}': bound PID {:?} (generation {})",
            self.inner.name,
            pid,
            generation
        );

        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(forward_output(stdout, Stream::Stdout, self.inner.clone())));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(forward_output(stderr, Stream::Stderr, self.inner.clone())));
        }
        tokio::spawn(supervise(
            self.inner.clone(),
            generation,
            process.into_child(),
            kill_rx,
            exit_tx,
            readers,
        ));
        Ok(())
    }
}

/// Normalize process output for terminal display
pub fn to_terminal_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

async fn wait_exit(mut exited: watch::Receiver<ExitState>, limit: Duration) -> bool {
    tokio::time::timeout(limit, exited.wait_for(|state| state.is_some()))
        .await
        .is_ok()
}

async fn forward_output<R>(mut reader: R, stream: Stream, inner: Arc<Inner>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let mut decoder = TextDecoder::new();
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => publish(&inner, stream, &decoder.push(&chunk[..n])),
            Err(e) => {
                log::debug!("Terminal '{}': read error: {}", inner.name, e);
                break;
            }
        }
    }
    publish(&inner, stream, &decoder.finish());
}

fn publish(inner: &Inner, stream: Stream, text: &str) {
    if text.is_empty() {
        return;
    }
    {
        let mut captured = inner.captured.lock().unwrap();
        let tail = match stream {
            Stream::Stdout => &mut captured.stdout,
            Stream::Stderr => &mut captured.stderr,
        };
        tail.push_str(text);
        keep_tail(tail, MAX_CAPTURED_BYTES);
    }
    inner.emit(TerminalEvent::Output(to_terminal_text(text)));
}

async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<ExitState>,
    readers: Vec<JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            log::debug!("Terminal '{}': force-killing generation {}", inner.name, generation);
            if let Err(e) = child.kill().await {
                log::warn!("Terminal '{}': kill failed: {}", inner.name, e);
            }
            child.wait().await
        }
    };
    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("Terminal '{}': failed to collect exit status: {}", inner.name, e);
            None
        }
    };

    // let buffered output reach the surface before the banner
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN, reader).await.is_err() {
            abort.abort();
        }
    }

    {
        let mut binding = inner.binding.lock().unwrap();
        if binding.as_ref().map(|b| b.generation) == Some(generation) {
            *binding = None;
        }
    }
    {
        let mut stdin = inner.stdin.lock().await;
        if stdin.as_ref().map(|(g, _)| *g) == Some(generation) {
            *stdin = None;
        }
    }

    log::debug!("Terminal '{}': process exited with {:?}", inner.name, exit_code);
    inner.emit(TerminalEvent::Unbound { exit_code });
    inner.emit(TerminalEvent::Output(match exit_code {
        Some(code) => format!("\r\n\x1b[1;31m*** terminal closed (exit code {}) ***\x1b[0m\r\n", code),
        None => "\r\n\x1b[1;31m*** terminal closed ***\x1b[0m\r\n".to_string(),
    }));
    (inner.on_close)(exit_code);
    let _ = exit_tx.send(Some(exit_code));
}
