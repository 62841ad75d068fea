/// Debug protocol probe for remote debuggees
///
/// This crate connects to a debuggee's (tunneled) debug port, confirms that
/// the debugger inside the container is live with a side-effect-free query,
/// and detaches gracefully. Three wire protocols are supported: JDWP
/// (binary frames), delve (JSON-RPC over a socket) and ruby-debug-ide (text
/// lines).

use std::time::Duration;
use thiserror::Error;

pub mod codec;
pub mod communication;
pub mod jdwp;
pub mod jsonrpc;
pub mod linetext;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod types;

pub use codec::PacketCodec;
pub use jdwp::JdwpClient;
pub use jsonrpc::JsonRpcClient;
pub use linetext::{LineTextClient, LineTextConfig};
pub use types::*;

/// Bound applied to each halt/detach request when none is given
pub const DEFAULT_DETACH_STEP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("Connection to {addr} refused: {source}")]
    ConnectRefused {
        addr: String,
        source: std::io::Error,
    },
    #[error("Handshake mismatch, peer sent {received:?}")]
    HandshakeMismatch { received: String },
    #[error("Failed to decode protocol frame: {reason}")]
    ProtocolDecode {
        reason: String,
        /// Base64 of the buffer that failed to decode
        raw: String,
    },
    #[error("Debuggee did not respond within {after:?}")]
    ProbeTimeout { after: Duration },
    #[error("VM returned error code {0}")]
    VmError(u16),
    #[error("RPC {method} failed: {message}")]
    Rpc { method: String, message: String },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Build a decode error that carries the offending bytes
    pub fn decode(reason: impl Into<String>, raw: &[u8]) -> Self {
        use base64::Engine;
        ProbeError::ProtocolDecode {
            reason: reason.into(),
            raw: base64::engine::general_purpose::STANDARD.encode(raw),
        }
    }

    /// Whether a connection-level failure is worth another attempt.
    ///
    /// This also covers a first probe on a socket the peer dropped before
    /// answering, which is how a port forward looks while nothing listens
    /// behind it yet.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProbeError::ConnectTimeout { .. }
            | ProbeError::ConnectRefused { .. }
            | ProbeError::ConnectionClosed => true,
            ProbeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// A connected debug protocol session, one variant per wire protocol
pub enum DebugClient {
    BinaryFramed(JdwpClient),
    JsonRpc(JsonRpcClient),
    LineText(LineTextClient),
}

impl DebugClient {
    /// Connect to `host:port` using the given protocol
    pub async fn connect(
        variant: ProtocolVariant,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        log::debug!("Connecting {} client to {}:{}", variant, host, port);
        let client = match variant {
            ProtocolVariant::BinaryFramed => {
                DebugClient::BinaryFramed(JdwpClient::connect(host, port, timeout).await?)
            }
            ProtocolVariant::JsonRpc => {
                DebugClient::JsonRpc(JsonRpcClient::connect(host, port, timeout).await?)
            }
            ProtocolVariant::LineText => DebugClient::LineText(
                LineTextClient::connect(host, port, timeout, LineTextConfig::default()).await?,
            ),
        };
        Ok(client)
    }

    pub fn variant(&self) -> ProtocolVariant {
        match self {
            DebugClient::BinaryFramed(_) => ProtocolVariant::BinaryFramed,
            DebugClient::JsonRpc(_) => ProtocolVariant::JsonRpc,
            DebugClient::LineText(_) => ProtocolVariant::LineText,
        }
    }

    /// Succeeds iff the debuggee answers a benign query within `timeout`
    pub async fn probe_liveness(&self, timeout: Duration) -> Result<()> {
        match self {
            DebugClient::BinaryFramed(client) => client.probe_liveness(timeout).await.map(|_| ()),
            DebugClient::JsonRpc(client) => client.probe_liveness(timeout).await.map(|_| ()),
            DebugClient::LineText(client) => client.probe_liveness(timeout).await,
        }
    }

    /// Best-effort graceful stop; failures are only logged
    pub async fn detach(&self) {
        self.detach_with_timeout(DEFAULT_DETACH_STEP_TIMEOUT).await
    }

    pub async fn detach_with_timeout(&self, step_timeout: Duration) {
        match self {
            DebugClient::BinaryFramed(client) => client.detach(step_timeout).await,
            DebugClient::JsonRpc(client) => client.detach(step_timeout).await,
            DebugClient::LineText(client) => client.detach().await,
        }
    }

    /// Release the socket without halting anything, leaving the debug port
    /// free for the next client
    pub async fn close(&self) {
        match self {
            DebugClient::BinaryFramed(client) => client.close().await,
            DebugClient::JsonRpc(client) => client.close().await,
            DebugClient::LineText(client) => client.detach().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_for_language() {
        assert_eq!(ProtocolVariant::for_language("java"), Some(ProtocolVariant::BinaryFramed));
        assert_eq!(ProtocolVariant::for_language("Go"), Some(ProtocolVariant::JsonRpc));
        assert_eq!(ProtocolVariant::for_language("golang"), Some(ProtocolVariant::JsonRpc));
        assert_eq!(ProtocolVariant::for_language("ruby"), Some(ProtocolVariant::LineText));
        assert_eq!(ProtocolVariant::for_language("cobol"), None);
    }

    #[test]
    fn test_retry_classification() {
        let timeout = ProbeError::ConnectTimeout {
            addr: "127.0.0.1:5005".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(!ProbeError::HandshakeMismatch { received: "nope".into() }.is_retryable());
        assert!(!ProbeError::ProbeTimeout { after: Duration::from_secs(1) }.is_retryable());
        assert!(!ProbeError::decode("bad", &[1, 2, 3]).is_retryable());
    }

    #[tokio::test]
    async fn test_debug_client_dispatch_binary() {
        let server = mock::MockJdwpServer::spawn().await.unwrap();
        let client = DebugClient::connect(
            ProtocolVariant::BinaryFramed,
            "127.0.0.1",
            server.port(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(client.variant(), ProtocolVariant::BinaryFramed);
        client.probe_liveness(Duration::from_secs(2)).await.unwrap();
        client.detach().await;
        // second detach is a no-op
        client.detach().await;
    }
}
