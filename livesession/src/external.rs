/// Contracts for the collaborators a session depends on
///
/// The tunnel into the cluster, the remote exec command line and the
/// editor's debugger attach are all provided by the host; the session only
/// sees them through these types.

use async_trait::async_trait;
use debugprobe::ProtocolVariant;
use std::fmt;
use tokio::sync::oneshot;

use crate::config::DebugTarget;
use crate::process::SpawnCommand;
use crate::watcher::SyncFeed;
use crate::Result;

/// A local endpoint forwarded to the container's debug port
pub struct Tunnel {
    pub host: String,
    pub port: u16,
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl Tunnel {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            disposer: None,
        }
    }

    /// Run `disposer` when the tunnel is torn down
    pub fn with_disposer<F>(mut self, disposer: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.disposer = Some(Box::new(disposer));
        self
    }

    /// Tear the tunnel down; idempotent
    pub fn dispose(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            log::debug!("Closing tunnel {}:{}", self.host, self.port);
            disposer();
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Make `remote_port` in the target container reachable locally.
    ///
    /// Fails with [`crate::SessionError::TunnelUnavailable`].
    async fn open(&self, target: &DebugTarget, remote_port: u16) -> Result<Tunnel>;
}

/// Builds command lines that run inside the target container
pub trait RemoteCommandBuilder: Send + Sync {
    fn exec(&self, target: &DebugTarget, shell_command: &str) -> SpawnCommand;

    /// Feed of sync-status lines for the target, if file sync is available
    fn sync_status(&self, target: &DebugTarget) -> Option<SyncFeed>;
}

/// What the editor needs to attach its debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub session_name: String,
    pub host: String,
    pub port: u16,
    pub remote_working_dir: String,
    pub variant: ProtocolVariant,
}

/// A running editor-side debug session
pub struct AttachedSession {
    /// Resolves (or closes) once the editor ends the debug session
    pub terminated: oneshot::Receiver<()>,
}

impl AttachedSession {
    pub fn channel() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (AttachedSession { terminated: rx }, tx)
    }
}

#[async_trait]
pub trait AttachUi: Send + Sync {
    async fn attach(&self, request: &AttachRequest) -> Result<AttachedSession>;

    /// Stop the editor-side session before the debuggee goes away
    async fn stop(&self, _session_name: &str) {}
}
