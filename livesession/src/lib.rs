/// Live debug sessions for processes running in remote containers
///
/// This crate keeps a terminal surface, a debugger attachment and a
/// live-reload watcher alive across restarts of the debuggee, sequenced by
/// [`DebugSessionController`].

use thiserror::Error;

pub mod config;
pub mod controller;
pub mod events;
pub mod external;
pub mod process;
pub mod terminal;
pub mod watcher;

pub use config::{DebugProfile, DebugTarget, SessionConfig};
pub use controller::DebugSessionController;
pub use events::{ProgressEvent, SessionEvents, SessionState};
pub use external::{AttachRequest, AttachUi, AttachedSession, RemoteCommandBuilder, Tunnel, TunnelProvider};
pub use process::SpawnCommand;
pub use terminal::{CapturedOutput, RemoteTerminal, TerminalEvent};
pub use watcher::{EditorEvent, LiveReloadWatcher, SaveReason, SyncFeed, SyncStatus};

pub use debugprobe::{ProbeError, ProtocolVariant};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Tunnel unavailable: {0}")]
    TunnelUnavailable(String),
    #[error("Debug protocol error: {0}")]
    Probe(#[from] ProbeError),
    #[error("Process exited unexpectedly with code {code:?}")]
    ProcessExit {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("Failed to start process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Attach failed: {0}")]
    Attach(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Cancelled")]
    Cancelled,
}

impl SessionError {
    /// Short, actionable text for the host UI
    pub fn user_message(&self) -> String {
        match self {
            SessionError::TunnelUnavailable(reason) => {
                format!("Could not reach the container's debug port ({}). Check the workload is running and retry.", reason)
            }
            SessionError::Probe(_) => {
                "The debugger in the container did not respond. Stop the debugger process running in the container and retry.".to_string()
            }
            SessionError::ProcessExit { code, .. } => match code {
                Some(code) => format!("The debug command exited with code {}. Check the terminal output and retry.", code),
                None => "The debug command was terminated. Check the terminal output and retry.".to_string(),
            },
            SessionError::Spawn(e) => format!("Could not start the remote command: {}", e),
            SessionError::Attach(reason) => format!("The debugger could not attach: {}", reason),
            SessionError::Config(reason) => format!("Invalid debug configuration: {}", reason),
            SessionError::Cancelled => "Debug session cancelled.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
