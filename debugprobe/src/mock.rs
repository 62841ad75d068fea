/// In-process JDWP peer for tests
///
/// Performs the handshake, records every command it receives and answers
/// VirtualMachine.Version with a well-formed reply. Other commands get an
/// empty success reply. Behaviour can be tuned with [`MockJdwpConfig`]; with
/// `single_client` set it behaves like a `server=y` agent and serves one
/// debugger at a time, leaving later connections unanswered until the
/// current one closes.

use bytes::BytesMut;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::codec::{PacketCodec, HANDSHAKE, VIRTUAL_MACHINE, VM_VERSION};
use crate::types::{Packet, PacketKind, VersionReply};

#[derive(Debug, Clone)]
pub struct MockJdwpConfig {
    /// Bytes sent back in place of the handshake echo
    pub handshake_reply: Vec<u8>,
    /// Whether commands are answered at all
    pub respond: bool,
    /// Delay before each reply
    pub reply_delay: Duration,
    pub version: VersionReply,
    pub single_client: bool,
}

impl Default for MockJdwpConfig {
    fn default() -> Self {
        Self {
            handshake_reply: HANDSHAKE.to_vec(),
            respond: true,
            reply_delay: Duration::ZERO,
            version: VersionReply {
                description: "Java Debug Wire Protocol (Reference Implementation) version 17.0"
                    .to_string(),
                jdwp_major: 17,
                jdwp_minor: 0,
                vm_version: "17.0.9".to_string(),
                vm_name: "OpenJDK 64-Bit Server VM".to_string(),
            },
            single_client: false,
        }
    }
}

struct State {
    config: MockJdwpConfig,
    commands: Mutex<Vec<(u8, u8)>>,
    connections: AtomicUsize,
}

pub struct MockJdwpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

impl MockJdwpServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockJdwpConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockJdwpConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State {
            config,
            commands: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
        });

        tokio::spawn(run(listener, state.clone(), shutdown.clone()));

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `(command_set, command)` pairs in arrival order
    pub fn received_commands(&self) -> Vec<(u8, u8)> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockJdwpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    log::debug!("mock jdwp: accept failed: {}", e);
                    return;
                }
            },
        };
        state.connections.fetch_add(1, Ordering::SeqCst);

        let connection = serve_until_shutdown(stream, state.clone(), shutdown.clone());
        if state.config.single_client {
            connection.await;
        } else {
            tokio::spawn(connection);
        }
    }
}

async fn serve_until_shutdown(stream: TcpStream, state: Arc<State>, shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        res = serve(stream, state) => {
            if let Err(e) = res {
                log::debug!("mock jdwp: connection ended: {}", e);
            }
        }
    }
}

async fn serve(mut stream: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let mut handshake = [0u8; HANDSHAKE.len()];
    stream.read_exact(&mut handshake).await?;
    stream.write_all(&state.config.handshake_reply).await?;

    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::new();
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        let packets = codec
            .decode_all(&mut buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        for packet in packets {
            let PacketKind::Command { command_set, command } = packet.kind else {
                continue;
            };
            state.commands.lock().unwrap().push((command_set, command));
            if !state.config.respond {
                continue;
            }
            if !state.config.reply_delay.is_zero() {
                tokio::time::sleep(state.config.reply_delay).await;
            }

            let payload = if (command_set, command) == (VIRTUAL_MACHINE, VM_VERSION) {
                state.config.version.to_payload()
            } else {
                Vec::new()
            };
            let frame = codec
                .encode_to_vec(Packet::reply(packet.id, 0, payload))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            stream.write_all(&frame).await?;
        }
    }
}
