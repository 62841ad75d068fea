/// Binary-framed (JDWP) protocol client
///
/// After the TCP connect both sides exchange the literal `JDWP-Handshake`
/// token; every later byte is a length-prefixed frame handled by
/// [`PacketCodec`]. Replies are routed to their waiter purely by id.

use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::codec::{PacketCodec, HANDSHAKE, VIRTUAL_MACHINE, VM_DISPOSE, VM_SUSPEND, VM_VERSION};
use crate::communication::{connect_tcp, PendingRequests};
use crate::types::{Packet, PacketKind, VersionReply};
use crate::{ProbeError, Result};

pub struct JdwpClient {
    peer: String,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: PendingRequests<Packet>,
    reader: Mutex<Option<JoinHandle<()>>>,
    detached: AtomicBool,
}

impl JdwpClient {
    /// Connect and perform the handshake
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let mut stream = connect_tcp(host, port, timeout).await?;
        let peer = format!("{}:{}", host, port);
        handshake(&mut stream, &peer, timeout).await?;

        let (read_half, write_half) = stream.into_split();
        let pending = PendingRequests::new();
        let reader = tokio::spawn(read_loop(read_half, pending.clone(), peer.clone()));

        Ok(JdwpClient {
            peer,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending,
            reader: Mutex::new(Some(reader)),
            detached: AtomicBool::new(false),
        })
    }

    /// Send a command and wait for the reply carrying the same id
    pub async fn send_command(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Packet> {
        let (id, receiver) = self.pending.register()?;
        let frame = PacketCodec::new().encode_to_vec(Packet::command(id, command_set, command, payload))?;

        {
            let mut writer = self.writer.lock().await;
            let write = match writer.as_mut() {
                Some(writer) => writer.write_all(&frame).await,
                None => Err(std::io::ErrorKind::NotConnected.into()),
            };
            if let Err(e) = write {
                self.pending.remove(id);
                return Err(match e.kind() {
                    std::io::ErrorKind::NotConnected => ProbeError::ConnectionClosed,
                    _ => ProbeError::Io(e),
                });
            }
        }
        log::debug!("SEND[{}]: command {}/{} ({} bytes)", id, command_set, command, frame.len());

        let reply = self.pending.wait(id, receiver, Some(timeout)).await?;
        match reply.error_code() {
            Some(0) => Ok(reply),
            Some(code) => {
                log::debug!("RECV[{}]: VM error {}", id, code);
                Err(ProbeError::VmError(code))
            }
            None => Err(ProbeError::decode(
                "command packet delivered as reply",
                &reply.payload,
            )),
        }
    }

    /// Query VirtualMachine.Version
    pub async fn probe_liveness(&self, timeout: Duration) -> Result<VersionReply> {
        let reply = self
            .send_command(VIRTUAL_MACHINE, VM_VERSION, Vec::new(), timeout)
            .await?;
        let version = VersionReply::parse(&reply.payload)?;
        log::info!(
            "JDWP {} live: {} (jdwp {}.{}, {} {})",
            self.peer,
            version.description,
            version.jdwp_major,
            version.jdwp_minor,
            version.vm_name,
            version.vm_version
        );
        Ok(version)
    }

    /// Suspend, dispose and close; never fails
    pub async fn detach(&self, step_timeout: Duration) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("JDWP {}: detaching", self.peer);

        if let Err(e) = self
            .send_command(VIRTUAL_MACHINE, VM_SUSPEND, Vec::new(), step_timeout)
            .await
        {
            log::warn!("JDWP {}: halt failed: {}", self.peer, e);
        }
        if let Err(e) = self
            .send_command(VIRTUAL_MACHINE, VM_DISPOSE, Vec::new(), step_timeout)
            .await
        {
            log::warn!("JDWP {}: dispose failed: {}", self.peer, e);
        }
        self.shutdown().await;
    }

    /// Drop the connection without touching the VM so the agent accepts
    /// its next debugger
    pub async fn close(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("JDWP {}: closing", self.peer);
        self.shutdown().await;
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                log::debug!("JDWP {}: socket shutdown failed: {}", self.peer, e);
            }
        }
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        self.pending.fail_all(|| ProbeError::ConnectionClosed);
    }
}

impl Drop for JdwpClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

async fn handshake(stream: &mut TcpStream, peer: &str, timeout: Duration) -> Result<()> {
    let timed_out = || ProbeError::ConnectTimeout {
        addr: peer.to_string(),
        timeout,
    };

    tokio::time::timeout(timeout, stream.write_all(HANDSHAKE))
        .await
        .map_err(|_| timed_out())??;

    let mut received = [0u8; HANDSHAKE.len()];
    match tokio::time::timeout(timeout, stream.read_exact(&mut received)).await {
        Err(_) => return Err(timed_out()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProbeError::ConnectionClosed)
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(_)) => {}
    }

    if &received != HANDSHAKE {
        return Err(ProbeError::HandshakeMismatch {
            received: String::from_utf8_lossy(&received).into_owned(),
        });
    }
    log::debug!("JDWP {}: handshake complete", peer);
    Ok(())
}

async fn read_loop(mut read_half: OwnedReadHalf, pending: PendingRequests<Packet>, peer: String) {
    log::debug!("JDWP {}: reader started", peer);
    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                log::debug!("JDWP {}: EOF reached", peer);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("JDWP {}: read error: {}", peer, e);
                break;
            }
        }

        let packets = match codec.decode_all(&mut buf) {
            Ok(packets) => packets,
            Err(ProbeError::ProtocolDecode { reason, raw }) => {
                log::debug!("JDWP {}: decode error: {} raw={}", peer, reason, raw);
                pending.fail_all(|| ProbeError::ProtocolDecode {
                    reason: reason.clone(),
                    raw: raw.clone(),
                });
                return;
            }
            Err(e) => {
                log::error!("JDWP {}: framing failed: {}", peer, e);
                break;
            }
        };

        for packet in packets {
            match packet.kind {
                PacketKind::Reply { error_code } => {
                    log::debug!("RECV[{}]: reply error_code={}", packet.id, error_code);
                    pending.complete(packet.id, Ok(packet));
                }
                PacketKind::Command { command_set, command } => {
                    log::debug!(
                        "JDWP {}: ignoring VM command {}/{} id={}",
                        peer,
                        command_set,
                        command,
                        packet.id
                    );
                }
            }
        }
    }

    pending.fail_all(|| ProbeError::ConnectionClosed);
    log::debug!("JDWP {}: reader finished", peer);
}
