/// Live-reload watcher
///
/// Combines editor save notifications with the remote sync-status feed and
/// fires a reload callback once a manual save that changed something has been
/// synchronized, i.e. the first `idle` status after the save.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::process::{PipedProcess, SpawnCommand};
use crate::{Result, SessionError};

const MAX_DIAGNOSTIC_LINES: usize = 64;
const STDERR_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveReason {
    /// Explicit save by the user
    Manual,
    AfterDelay,
    FocusOut,
}

/// Local editor notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    DocumentChanged { path: PathBuf },
    WillSave { path: PathBuf, reason: SaveReason },
}

/// One line of the sync-status feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: String,
    #[serde(default)]
    pub msg: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SyncStatus {
    pub fn is_idle(&self) -> bool {
        self.status == "idle"
    }
}

/// Where sync-status lines come from
pub enum SyncFeed {
    /// A watch subprocess printing one JSON object per line
    Process(SpawnCommand),
    /// An already-open line stream
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

#[derive(Debug, Clone)]
struct ProcessFailure {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl ProcessFailure {
    fn to_error(&self) -> SessionError {
        SessionError::ProcessExit {
            code: self.code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

#[derive(Default)]
struct ReloadState {
    changed_since_save: bool,
    pending_save: bool,
    blocking: Option<oneshot::Sender<Result<()>>>,
    failure: Option<ProcessFailure>,
}

type Tail = Arc<Mutex<VecDeque<String>>>;

pub struct LiveReloadWatcher {
    name: String,
    state: Arc<Mutex<ReloadState>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    disposed: AtomicBool,
}

impl LiveReloadWatcher {
    /// Start watching; `on_reload` runs once per qualifying save
    pub fn start<F>(
        name: impl Into<String>,
        editor: mpsc::UnboundedReceiver<EditorEvent>,
        feed: SyncFeed,
        on_reload: F,
    ) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        // bookkeeping always starts disarmed, an idle status right after
        // connecting must not look like a finished sync
        let state = Arc::new(Mutex::new(ReloadState::default()));
        let stdout_tail: Tail = Arc::new(Mutex::new(VecDeque::new()));

        let (lines, kill): (Box<dyn AsyncRead + Send + Unpin>, Option<oneshot::Sender<()>>) = match feed {
            SyncFeed::Stream(stream) => (stream, None),
            SyncFeed::Process(command) => {
                let mut process = PipedProcess::start(&command)?;
                log::info!("{}: watching sync status via {}", name, command);
                drop(process.take_stdin());
                let stdout = process.take_stdout().ok_or_else(|| {
                    SessionError::Spawn(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "sync-status process has no stdout",
                    ))
                })?;
                let stderr_tail: Tail = Arc::new(Mutex::new(VecDeque::new()));
                let stderr_task = process
                    .take_stderr()
                    .map(|stderr| tokio::spawn(collect_tail(stderr, stderr_tail.clone())));

                let (kill_tx, kill_rx) = oneshot::channel();
                tokio::spawn(monitor(
                    name.clone(),
                    state.clone(),
                    process.into_child(),
                    kill_rx,
                    stdout_tail.clone(),
                    stderr_tail,
                    stderr_task,
                ));
                (Box::new(stdout) as Box<dyn AsyncRead + Send + Unpin>, Some(kill_tx))
            }
        };

        let driver = tokio::spawn(drive(
            name.clone(),
            state.clone(),
            editor,
            lines,
            stdout_tail,
            Box::new(on_reload),
        ));

        Ok(LiveReloadWatcher {
            name,
            state,
            driver: Mutex::new(Some(driver)),
            kill: Mutex::new(kill),
            disposed: AtomicBool::new(false),
        })
    }

    /// Whether a save is waiting for the next idle status
    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().pending_save
    }

    /// Wait until a pending save has been synchronized.
    ///
    /// Fails with [`SessionError::Cancelled`] when `cancel` fires or the
    /// watcher is disposed, and with [`SessionError::ProcessExit`] when the
    /// watch subprocess exited abnormally.
    pub async fn wait_for_sync_after_save(&self, cancel: &CancellationToken) -> Result<()> {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            if let Some(failure) = &state.failure {
                return Err(failure.to_error());
            }
            if self.disposed.load(Ordering::SeqCst) {
                return Err(SessionError::Cancelled);
            }
            let (tx, rx) = oneshot::channel();
            if let Some(previous) = state.blocking.replace(tx) {
                let _ = previous.send(Err(SessionError::Cancelled));
            }
            rx
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let mut state = self.state.lock().unwrap();
                state.pending_save = false;
                state.blocking = None;
                log::debug!("{}: sync wait cancelled", self.name);
                Err(SessionError::Cancelled)
            }
            result = waiter => result.unwrap_or(Err(SessionError::Cancelled)),
        }
    }

    /// Stop the watch subprocess and editor subscription; idempotent
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("{}: disposing live-reload watcher", self.name);
        if let Some(kill) = self.kill.lock().unwrap().take() {
            let _ = kill.send(());
        }
        if let Some(driver) = self.driver.lock().unwrap().take() {
            driver.abort();
        }
        let mut state = self.state.lock().unwrap();
        state.pending_save = false;
        if let Some(blocking) = state.blocking.take() {
            let _ = blocking.send(Err(SessionError::Cancelled));
        }
    }
}

impl Drop for LiveReloadWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn push_tail(tail: &Tail, line: String) {
    let mut tail = tail.lock().unwrap();
    if tail.len() == MAX_DIAGNOSTIC_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn join_tail(tail: &Tail) -> String {
    tail.lock().unwrap().iter().cloned().collect::<Vec<_>>().join("\n")
}

async fn collect_tail<R>(reader: R, tail: Tail)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        push_tail(&tail, line);
    }
}

async fn next_editor_event(
    editor: &mut Option<mpsc::UnboundedReceiver<EditorEvent>>,
) -> Option<EditorEvent> {
    match editor {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn drive(
    name: String,
    state: Arc<Mutex<ReloadState>>,
    editor: mpsc::UnboundedReceiver<EditorEvent>,
    feed: Box<dyn AsyncRead + Send + Unpin>,
    stdout_tail: Tail,
    on_reload: Box<dyn Fn() + Send + Sync>,
) {
    let mut editor = Some(editor);
    let mut lines = BufReader::new(feed).lines();
    loop {
        tokio::select! {
            biased;
            event = next_editor_event(&mut editor) => match event {
                Some(event) => handle_editor_event(&name, &state, event),
                None => editor = None,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    handle_status_line(&name, &state, &line, on_reload.as_ref());
                    push_tail(&stdout_tail, line);
                }
                Ok(None) => {
                    log::debug!("{}: sync-status feed ended", name);
                    break;
                }
                Err(e) => {
                    log::warn!("{}: sync-status feed failed: {}", name, e);
                    break;
                }
            },
        }
    }
}

fn handle_editor_event(name: &str, state: &Mutex<ReloadState>, event: EditorEvent) {
    let mut state = state.lock().unwrap();
    match event {
        EditorEvent::DocumentChanged { .. } => state.changed_since_save = true,
        EditorEvent::WillSave { path, reason: SaveReason::Manual } => {
            if state.changed_since_save {
                state.changed_since_save = false;
                state.pending_save = true;
                log::info!("{}: saved {}, reloading after sync", name, path.display());
            } else {
                log::debug!("{}: {} saved without changes", name, path.display());
            }
        }
        EditorEvent::WillSave { path, reason } => {
            log::trace!("{}: ignoring {:?} save of {}", name, reason, path.display());
        }
    }
}

fn handle_status_line(
    name: &str,
    state: &Mutex<ReloadState>,
    line: &str,
    on_reload: &(dyn Fn() + Send + Sync),
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let status: SyncStatus = match serde_json::from_str(line) {
        Ok(status) => status,
        Err(e) => {
            log::debug!("{}: skipping sync-status line {:?}: {}", name, line, e);
            return;
        }
    };
    log::trace!("{}: sync status {} {}", name, status.status, status.msg);
    if !status.is_idle() {
        return;
    }

    let blocking = {
        let mut state = state.lock().unwrap();
        if !state.pending_save {
            return;
        }
        state.pending_save = false;
        state.blocking.take()
    };
    log::info!("{}: sync idle, triggering reload", name);
    on_reload();
    if let Some(blocking) = blocking {
        let _ = blocking.send(Ok(()));
    }
}

async fn monitor(
    name: String,
    state: Arc<Mutex<ReloadState>>,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    stdout_tail: Tail,
    stderr_tail: Tail,
    stderr_task: Option<JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                log::warn!("{}: failed to kill sync-status process: {}", name, e);
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("{}: failed to collect sync-status exit: {}", name, e);
            return;
        }
    };
    if let Some(task) = stderr_task {
        let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
    }

    match code {
        Some(0) | None => log::debug!("{}: sync-status process exited ({:?})", name, code),
        Some(code) => {
            let failure = ProcessFailure {
                code: Some(code),
                stdout: join_tail(&stdout_tail),
                stderr: join_tail(&stderr_tail),
            };
            log::error!(
                "{}: sync-status process exited with code {}: {}",
                name,
                code,
                failure.stderr
            );
            let mut state = state.lock().unwrap();
            state.pending_save = false;
            if let Some(blocking) = state.blocking.take() {
                let _ = blocking.send(Err(failure.to_error()));
            }
            state.failure = Some(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct Harness {
        watcher: LiveReloadWatcher,
        editor: mpsc::UnboundedSender<EditorEvent>,
        reloads: Arc<AtomicUsize>,
    }

    fn start(feed: SyncFeed) -> Harness {
        let (editor, editor_rx) = mpsc::unbounded_channel();
        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = reloads.clone();
        let watcher = LiveReloadWatcher::start("test", editor_rx, feed, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        Harness { watcher, editor, reloads }
    }

    fn start_with_pipe() -> (Harness, DuplexStream) {
        let (feed, writer) = {
            let (reader, writer) = tokio::io::duplex(4096);
            (SyncFeed::Stream(Box::new(reader)), writer)
        };
        (start(feed), writer)
    }

    fn change() -> EditorEvent {
        EditorEvent::DocumentChanged { path: "src/main.go".into() }
    }

    fn save(reason: SaveReason) -> EditorEvent {
        EditorEvent::WillSave { path: "src/main.go".into(), reason }
    }

    async fn wait_armed(watcher: &LiveReloadWatcher) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !watcher.is_armed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("save never armed a reload");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_change_save_idle_reloads_once() {
        let (h, mut writer) = start_with_pipe();
        h.editor.send(change()).unwrap();
        h.editor.send(save(SaveReason::Manual)).unwrap();
        wait_armed(&h.watcher).await;

        writer.write_all(b"{\"status\":\"syncing\",\"msg\":\"2 files\"}\n").await.unwrap();
        writer.write_all(b"{\"status\":\"idle\",\"msg\":\"\"}\n").await.unwrap();
        writer.write_all(b"{\"status\":\"idle\",\"msg\":\"\"}\n").await.unwrap();
        settle().await;

        assert_eq!(h.reloads.load(Ordering::SeqCst), 1);
        assert!(!h.watcher.is_armed());
    }

    #[tokio::test]
    async fn test_save_without_change_does_not_reload() {
        let (h, mut writer) = start_with_pipe();
        h.editor.send(save(SaveReason::Manual)).unwrap();
        settle().await;
        assert!(!h.watcher.is_armed());

        writer.write_all(b"{\"status\":\"idle\"}\n").await.unwrap();
        settle().await;
        assert_eq!(h.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_two_saves_before_idle_reload_once() {
        let (h, mut writer) = start_with_pipe();
        h.editor.send(change()).unwrap();
        h.editor.send(save(SaveReason::Manual)).unwrap();
        h.editor.send(change()).unwrap();
        h.editor.send(save(SaveReason::Manual)).unwrap();
        wait_armed(&h.watcher).await;

        writer.write_all(b"{\"status\":\"idle\"}\n{\"status\":\"idle\"}\n").await.unwrap();
        settle().await;
        assert_eq!(h.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_programmatic_save_is_ignored() {
        let (h, mut writer) = start_with_pipe();
        h.editor.send(change()).unwrap();
        h.editor.send(save(SaveReason::AfterDelay)).unwrap();
        h.editor.send(save(SaveReason::FocusOut)).unwrap();
        settle().await;
        assert!(!h.watcher.is_armed());

        writer.write_all(b"{\"status\":\"idle\"}\n").await.unwrap();
        settle().await;
        assert_eq!(h.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_idle_on_connect_is_not_reload_readiness() {
        let feed = tokio_test::io::Builder::new()
            .read(b"{\"status\":\"idle\",\"msg\":\"connected\"}\n")
            .wait(Duration::from_millis(300))
            .read(b"{\"status\":\"idle\",\"msg\":\"\"}\n")
            .build();
        let h = start(SyncFeed::Stream(Box::new(feed)));

        settle().await;
        assert_eq!(h.reloads.load(Ordering::SeqCst), 0);

        h.editor.send(change()).unwrap();
        h.editor.send(save(SaveReason::Manual)).unwrap();
        wait_armed(&h.watcher).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_resolves_after_reload() {
        let (h, mut writer) = start_with_pipe();
        let token = CancellationToken::new();
        h.editor.send(change()).unwrap();
        h.editor.send(save(SaveReason::Manual)).unwrap();
        wait_armed(&h.watcher).await;

        let feed = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.write_all(b"{\"status\":\"idle\"}\n").await.unwrap();
            writer
        });
        h.watcher.wait_for_sync_after_save(&token).await.unwrap();
        assert_eq!(h.reloads.load(Ordering::SeqCst), 1);
        drop(feed.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_is_cancelled() {
        let (h, _writer) = start_with_pipe();
        let token = CancellationToken::new();
        h.editor.send(change()).unwrap();
        h.editor.send(save(SaveReason::Manual)).unwrap();
        wait_armed(&h.watcher).await;

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = h.watcher.wait_for_sync_after_save(&token).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert!(!h.watcher.is_armed());
    }

    #[tokio::test]
    async fn test_garbage_lines_are_skipped() {
        let (h, mut writer) = start_with_pipe();
        h.editor.send(change()).unwrap();
        h.editor.send(save(SaveReason::Manual)).unwrap();
        wait_armed(&h.watcher).await;

        writer
            .write_all(b"Forwarding from 127.0.0.1\n\n{\"msg\":\"no status\"}\n{\"status\":\"idle\"}\n")
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.reloads.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abnormal_exit_rejects_waiter() {
        let command = SpawnCommand::new("sh")
            .arg("-c")
            .arg("echo '{\"status\":\"syncing\"}'; echo boom >&2; sleep 0.2; exit 3");
        let h = start(SyncFeed::Process(command));
        let token = CancellationToken::new();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            h.watcher.wait_for_sync_after_save(&token),
        )
        .await
        .unwrap()
        .unwrap_err();
        match err {
            SessionError::ProcessExit { code, stdout, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stdout.contains("syncing"));
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // later waits fail immediately
        let again = h.watcher.wait_for_sync_after_save(&token).await;
        assert!(matches!(again, Err(SessionError::ProcessExit { .. })));
    }

    #[tokio::test]
    async fn test_dispose_rejects_waiter_and_is_idempotent() {
        let (h, _writer) = start_with_pipe();
        let token = CancellationToken::new();
        let watcher = Arc::new(h.watcher);
        let waiting = watcher.clone();
        let wait = tokio::spawn(async move { waiting.wait_for_sync_after_save(&token).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher.dispose();
        watcher.dispose();
        assert!(matches!(wait.await.unwrap(), Err(SessionError::Cancelled)));
    }
}
