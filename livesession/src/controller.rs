/// Debug session state machine
///
/// [`DebugSessionController::launch`] drives one session from tunnel setup to
/// teardown:
///
/// TunnelPending -> TerminalStarting -> ProbingLiveness -> Attaching ->
/// Debugging, looping back through Restarting on every live reload.
///
/// Every exit path (clean end, failure, cancellation) goes through a single
/// teardown so no child process, socket or tunnel outlives the session.
///
/// The probe connection is closed as soon as liveness is confirmed: debug
/// agents generally serve one client at a time and the editor's debugger
/// attaches next. Halt and detach go over a fresh connection once the editor
/// has let go.

use debugprobe::{DebugClient, ProtocolVariant};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{DebugProfile, DebugTarget, SessionConfig};
use crate::events::{ProgressEvent, SessionEvents, SessionState};
use crate::external::{AttachRequest, AttachUi, RemoteCommandBuilder, Tunnel, TunnelProvider};
use crate::terminal::{RemoteTerminal, TerminalEvent};
use crate::watcher::{EditorEvent, LiveReloadWatcher};
use crate::{Result, SessionError};

/// Local address of the debuggee's debug port
#[derive(Debug, Clone)]
struct Endpoint {
    variant: ProtocolVariant,
    host: String,
    port: u16,
}

/// Everything a session owns; released by teardown
#[derive(Default)]
struct Resources {
    tunnel: Option<Tunnel>,
    watcher: Option<LiveReloadWatcher>,
    terminal: Option<RemoteTerminal>,
    /// Set while a probed debugger may need halting
    live: Option<Endpoint>,
    attached: bool,
}

impl Drop for Resources {
    fn drop(&mut self) {
        if let Some(terminal) = self.terminal.take() {
            terminal.dispose();
        }
    }
}

pub struct DebugSessionController {
    config: SessionConfig,
    tunnels: Arc<dyn TunnelProvider>,
    commands: Arc<dyn RemoteCommandBuilder>,
    events: SessionEvents,
    cancel: CancellationToken,
    editor_events: Mutex<Option<mpsc::UnboundedReceiver<EditorEvent>>>,
    terminal_sink: Mutex<Option<mpsc::UnboundedSender<TerminalEvent>>>,
    terminal: Mutex<Option<RemoteTerminal>>,
    launched: AtomicBool,
}

impl DebugSessionController {
    pub fn new(
        config: SessionConfig,
        tunnels: Arc<dyn TunnelProvider>,
        commands: Arc<dyn RemoteCommandBuilder>,
    ) -> Self {
        Self {
            config,
            tunnels,
            commands,
            events: SessionEvents::new(),
            cancel: CancellationToken::new(),
            editor_events: Mutex::new(None),
            terminal_sink: Mutex::new(None),
            terminal: Mutex::new(None),
            launched: AtomicBool::new(false),
        }
    }

    /// Editor notifications that drive live reload
    pub fn with_editor_events(self, events: mpsc::UnboundedReceiver<EditorEvent>) -> Self {
        *self.editor_events.lock().unwrap() = Some(events);
        self
    }

    /// Where the debug terminal's output goes
    pub fn with_terminal_sink(self, sink: mpsc::UnboundedSender<TerminalEvent>) -> Self {
        *self.terminal_sink.lock().unwrap() = Some(sink);
        self
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.events.on_progress(callback);
    }

    pub fn state(&self) -> SessionState {
        self.events.state()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the session; reported as Cancelled even if something else fails
    pub fn cancel(&self) {
        log::info!("Debug session cancellation requested");
        self.cancel.cancel();
    }

    /// The debug terminal, once started
    pub fn terminal(&self) -> Option<RemoteTerminal> {
        self.terminal.lock().unwrap().clone()
    }

    /// Run the session until the editor ends it, the debuggee exits, an
    /// attempt fails or the session is cancelled.
    pub async fn launch(
        &self,
        target: DebugTarget,
        profile: DebugProfile,
        attach: Arc<dyn AttachUi>,
    ) -> Result<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Config("session already launched".to_string()));
        }
        let session_name = target.session_name();
        log::info!(
            "Launching {} debug session for {} (container {})",
            profile.language,
            session_name,
            target.container_name
        );

        let mut resources = Resources::default();
        let outcome = self
            .run(&target, &profile, attach.as_ref(), &mut resources)
            .await;
        self.teardown(&session_name, attach.as_ref(), &mut resources)
            .await;
        self.finish(outcome)
    }

    fn enter(&self, state: SessionState, message: impl Into<String>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.events.transition(state, message);
        Ok(())
    }

    async fn run(
        &self,
        target: &DebugTarget,
        profile: &DebugProfile,
        attach: &dyn AttachUi,
        res: &mut Resources,
    ) -> Result<()> {
        let variant = profile.variant()?;
        let session_name = target.session_name();

        self.enter(
            SessionState::TunnelPending,
            format!("forwarding debug port {} of {}", profile.remote_port, session_name),
        )?;
        let tunnel = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            tunnel = self.tunnels.open(target, profile.remote_port) => tunnel?,
        };
        let endpoint = Endpoint {
            variant,
            host: tunnel.host.clone(),
            port: tunnel.port,
        };
        log::info!(
            "Debug port {} reachable at {}:{}",
            profile.remote_port,
            endpoint.host,
            endpoint.port
        );
        res.tunnel = Some(tunnel);

        let (reload_tx, mut reload_rx) = mpsc::unbounded_channel::<()>();
        if self.config.live_reload {
            res.watcher = self.start_watcher(target, reload_tx.clone());
        }

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<Option<i32>>();
        let reloading = Arc::new(AtomicBool::new(false));
        let mut attempt: Option<CancellationToken> = None;

        loop {
            // one live token per attempt
            if let Some(previous) = attempt.take() {
                previous.cancel();
            }
            let token = self.cancel.child_token();
            attempt = Some(token.clone());

            self.enter(SessionState::TerminalStarting, format!("running `{}`", profile.command))?;
            if let Some(terminal) = res.terminal.clone() {
                let restarted = terminal.restart().await;
                reloading.store(false, Ordering::SeqCst);
                restarted?;
                // the new process already sees everything synced so far
                while reload_rx.try_recv().is_ok() {}
            } else {
                let command = self.commands.exec(target, &profile.command);
                let ignore_exit = reloading.clone();
                let exits = exit_tx.clone();
                let (terminal, output) = RemoteTerminal::create_with_grace(
                    command,
                    format!("{} (debug)", session_name),
                    self.config.interrupt_grace(),
                    move |code| {
                        if ignore_exit.load(Ordering::SeqCst) {
                            log::debug!("Debuggee exit during reload ignored ({:?})", code);
                            return;
                        }
                        let _ = exits.send(code);
                    },
                )
                .await?;
                self.forward_terminal_output(output);
                *self.terminal.lock().unwrap() = Some(terminal.clone());
                res.terminal = Some(terminal);
            }

            self.enter(
                SessionState::ProbingLiveness,
                format!(
                    "waiting for the {} debugger at {}:{}",
                    variant, endpoint.host, endpoint.port
                ),
            )?;
            let client = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SessionError::Cancelled),
                code = exit_rx.recv() => return debuggee_exited(code.flatten(), res.terminal.as_ref()),
                client = self.connect_and_probe(&endpoint) => client?,
            };
            client.close().await;
            res.live = Some(endpoint.clone());

            self.enter(SessionState::Attaching, format!("attaching editor debugger to {}", session_name))?;
            let request = AttachRequest {
                session_name: session_name.clone(),
                host: endpoint.host.clone(),
                port: endpoint.port,
                remote_working_dir: target.work_dir.clone(),
                variant,
            };
            let mut session = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SessionError::Cancelled),
                code = exit_rx.recv() => return debuggee_exited(code.flatten(), res.terminal.as_ref()),
                session = attach.attach(&request) => session?,
            };
            res.attached = true;

            self.enter(SessionState::Debugging, format!("debugging {}", session_name))?;
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SessionError::Cancelled),
                code = exit_rx.recv() => return debuggee_exited(code.flatten(), res.terminal.as_ref()),
                _ = &mut session.terminated => {
                    log::info!("Editor ended the debug session for {}", session_name);
                    return Ok(());
                }
                _ = reload_rx.recv() => {}
            }
            // saves queued while restarting collapse into this one
            while reload_rx.try_recv().is_ok() {}

            // the old process is expected to go away from here on
            reloading.store(true, Ordering::SeqCst);
            self.enter(SessionState::Restarting, "sources synchronized, restarting debuggee")?;
            if std::mem::take(&mut res.attached) {
                attach.stop(&session_name).await;
            }
            if let Some(live) = res.live.take() {
                self.release_debugger(&live).await;
            }
        }
    }

    fn start_watcher(
        &self,
        target: &DebugTarget,
        reload: mpsc::UnboundedSender<()>,
    ) -> Option<LiveReloadWatcher> {
        let Some(editor) = self.editor_events.lock().unwrap().take() else {
            log::debug!("Live reload off: no editor events");
            return None;
        };
        let Some(feed) = self.commands.sync_status(target) else {
            log::debug!("Live reload off: no sync status for {}", target.session_name());
            return None;
        };
        match LiveReloadWatcher::start(target.session_name(), editor, feed, move || {
            let _ = reload.send(());
        }) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("Live reload unavailable: {}", e);
                None
            }
        }
    }

    fn forward_terminal_output(&self, mut output: mpsc::UnboundedReceiver<TerminalEvent>) {
        let Some(sink) = self.terminal_sink.lock().unwrap().clone() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = output.recv().await {
                if sink.send(event).is_err() {
                    break;
                }
            }
        });
    }

    /// Connect and probe, with bounded backoff while the failures are
    /// connection-level. A peer that answers wrongly or not at all ends the
    /// attempt.
    async fn connect_and_probe(&self, endpoint: &Endpoint) -> Result<DebugClient> {
        let Endpoint { variant, host, port } = endpoint;
        let deadline = Instant::now() + self.config.retry_budget();
        let mut backoff = self.config.retry_initial();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let failure = match DebugClient::connect(*variant, host, *port, self.config.connect_timeout()).await {
                Ok(client) => match client.probe_liveness(self.config.probe_timeout()).await {
                    Ok(()) => {
                        log::debug!("Debugger at {}:{} live after {} attempt(s)", host, port, attempts);
                        return Ok(client);
                    }
                    // dropped before any reply: nothing listening behind the tunnel yet
                    Err(e) if e.is_retryable() => e,
                    Err(e) => {
                        log::debug!("Liveness probe failed: {:?}", e);
                        return Err(e.into());
                    }
                },
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e.into()),
            };

            if Instant::now() + backoff > deadline {
                log::warn!(
                    "Debugger at {}:{} unreachable after {} attempts: {}",
                    host,
                    port,
                    attempts,
                    failure
                );
                return Err(failure.into());
            }
            log::debug!("Debugger at {}:{} not ready ({}), retrying in {:?}", host, port, failure, backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.retry_max());
        }
    }

    /// Halt and detach the debuggee over a connection of our own
    async fn release_debugger(&self, endpoint: &Endpoint) {
        match DebugClient::connect(
            endpoint.variant,
            &endpoint.host,
            endpoint.port,
            self.config.connect_timeout(),
        )
        .await
        {
            Ok(client) => client.detach_with_timeout(self.config.detach_step_timeout()).await,
            Err(e) => log::debug!(
                "Debugger at {}:{} not reachable for detach: {}",
                endpoint.host,
                endpoint.port,
                e
            ),
        }
    }

    async fn teardown(&self, session_name: &str, attach: &dyn AttachUi, res: &mut Resources) {
        self.events.transition(SessionState::Detaching, "releasing session resources");

        if let Some(watcher) = res.watcher.take() {
            watcher.dispose();
        }
        if std::mem::take(&mut res.attached) {
            attach.stop(session_name).await;
        }
        if let Some(live) = res.live.take() {
            self.release_debugger(&live).await;
        }
        if let Some(terminal) = res.terminal.take() {
            terminal.dispose();
            if !terminal.wait_closed(self.config.interrupt_grace()).await {
                log::warn!("Terminal '{}' still has a live process", terminal.name());
            }
        }
        if let Some(mut tunnel) = res.tunnel.take() {
            tunnel.dispose();
        }
    }

    fn finish(&self, outcome: Result<()>) -> Result<()> {
        let cancelled =
            self.cancel.is_cancelled() || matches!(outcome, Err(SessionError::Cancelled));
        if cancelled {
            self.events
                .transition(SessionState::Cancelled, SessionError::Cancelled.user_message());
            return Err(SessionError::Cancelled);
        }
        match outcome {
            Ok(()) => {
                self.events.transition(SessionState::Terminated, "debug session ended");
                Ok(())
            }
            Err(e) => {
                log::error!("Debug session failed: {}", e);
                self.events.transition(SessionState::Failed, e.user_message());
                Err(e)
            }
        }
    }
}

fn debuggee_exited(code: Option<i32>, terminal: Option<&RemoteTerminal>) -> Result<()> {
    if code == Some(0) {
        log::info!("Debug command exited cleanly");
        return Ok(());
    }
    let output = terminal.map(RemoteTerminal::captured_output).unwrap_or_default();
    Err(SessionError::ProcessExit {
        code,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debuggee_exit_classification() {
        assert!(debuggee_exited(Some(0), None).is_ok());
        assert!(matches!(
            debuggee_exited(Some(3), None),
            Err(SessionError::ProcessExit { code: Some(3), .. })
        ));
        assert!(matches!(
            debuggee_exited(None, None),
            Err(SessionError::ProcessExit { code: None, .. })
        ));
    }
}
