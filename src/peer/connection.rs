//! Connection socket layer (§4.7): connect with timeout, framed
//! read/write, optional transparent RC4, idle timeout.
use super::PeerError;
use rc4::{Rc4, StreamCipher};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    Data(Vec<u8>),
    Close { had_error: bool },
    Error(String),
    Timeout,
}

/// Transparent RC4 over a raw `TcpStream`: one cipher per direction, as
/// required by §4.9 (two independent stream states).
pub struct RcFour {
    pub encrypt: Rc4<rc4::consts::U20>,
    pub decrypt: Rc4<rc4::consts::U20>,
}

pub struct Connection {
    stream: TcpStream,
    state: ConnectionState,
    cipher: Option<RcFour>,
    cancel: CancellationToken,
    /// Bytes already pulled off the socket (e.g. trailing MSE handshake
    /// data beyond PadD) that reads must drain before touching the
    /// socket again. Already in "logical" (decrypted) form.
    pending: std::collections::VecDeque<u8>,
}

impl Connection {
    pub async fn connect(addr: SocketAddr, cancel: CancellationToken) -> Result<Self, PeerError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout)??;
        Ok(Self { stream, state: ConnectionState::Connected, cipher: None, cancel, pending: Default::default() })
    }

    pub fn from_stream(stream: TcpStream, cancel: CancellationToken) -> Self {
        Self { stream, state: ConnectionState::Connected, cipher: None, cancel, pending: Default::default() }
    }

    pub fn install_cipher(&mut self, cipher: RcFour) {
        self.cipher = Some(cipher);
    }

    /// Queue already-decrypted bytes ahead of the socket, used to
    /// deliver the MSE handshake's trailing remainder (§4.9) to the
    /// protocol layer without losing it.
    pub fn inject_plaintext(&mut self, bytes: Vec<u8>) {
        self.pending.extend(bytes);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A single non-exact read, used by the MSE handshake's VC search
    /// which doesn't know its target length up front.
    pub async fn read_some_raw(&mut self, buf: &mut [u8]) -> Result<usize, PeerError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PeerError::Cancelled),
            result = timeout(IDLE_TIMEOUT, self.stream.read(buf)) => {
                match result {
                    Ok(Ok(n)) => Ok(n),
                    Ok(Err(e)) => {
                        self.state = ConnectionState::Closed;
                        Err(PeerError::from(e))
                    }
                    Err(_) => {
                        self.state = ConnectionState::Closed;
                        Err(PeerError::IdleTimeout)
                    }
                }
            }
        }
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap();
        }
        n
    }

    /// Read exactly `buf.len()` bytes, honoring the idle timeout and
    /// cancellation, decrypting transparently if a cipher is installed.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), PeerError> {
        let from_pending = self.drain_pending(buf);
        if from_pending == buf.len() {
            return Ok(());
        }
        let rest = &mut buf[from_pending..];
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PeerError::Cancelled),
            result = timeout(IDLE_TIMEOUT, self.stream.read_exact(rest)) => {
                match result {
                    Ok(Ok(_)) => {
                        if let Some(cipher) = &mut self.cipher {
                            cipher.decrypt.apply_keystream(rest);
                        }
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        self.state = ConnectionState::Closed;
                        Err(PeerError::from(e))
                    }
                    Err(_) => {
                        self.state = ConnectionState::Closed;
                        Err(PeerError::IdleTimeout)
                    }
                }
            }
        }
    }

    /// Write all bytes and wait for the OS to accept them (backpressure:
    /// resolves only once `write_all` drains into the socket buffer).
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        let mut outgoing = bytes.to_vec();
        if let Some(cipher) = &mut self.cipher {
            cipher.encrypt.apply_keystream(&mut outgoing);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PeerError::Cancelled),
            result = timeout(IDLE_TIMEOUT, self.stream.write_all(&outgoing)) => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        self.state = ConnectionState::Closed;
                        Err(PeerError::from(e))
                    }
                    Err(_) => {
                        self.state = ConnectionState::Closed;
                        Err(PeerError::IdleTimeout)
                    }
                }
            }
        }
    }

    /// Read and write bytes that bypass the installed cipher — used
    /// during the MSE handshake itself, before any cipher exists.
    pub async fn read_exact_raw(&mut self, buf: &mut [u8]) -> Result<(), PeerError> {
        let from_pending = self.drain_pending(buf);
        if from_pending == buf.len() {
            return Ok(());
        }
        let rest = &mut buf[from_pending..];
        timeout(IDLE_TIMEOUT, self.stream.read_exact(rest)).await.map_err(|_| PeerError::IdleTimeout)??;
        Ok(())
    }

    pub async fn write_all_raw(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        timeout(IDLE_TIMEOUT, self.stream.write_all(bytes)).await.map_err(|_| PeerError::IdleTimeout)??;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.state = ConnectionState::Closing;
        let _ = self.stream.shutdown().await;
        self.state = ConnectionState::Closed;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Splits into independent read/write halves once the handshake
    /// (plaintext or MSE/PE) is complete, so a reader task and a writer
    /// task can each hold exclusive, cancellation-safe access to their
    /// own direction — §5's rule that a wire FSM owns its connection's
    /// buffer and RC4 streams extends naturally to "its half".
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (decrypt, encrypt) = match self.cipher {
            Some(c) => (Some(c.decrypt), Some(c.encrypt)),
            None => (None, None),
        };
        let (read_half, write_half) = self.stream.into_split();
        (
            ConnectionReader { stream: read_half, cipher: decrypt, cancel: self.cancel.clone(), pending: self.pending },
            ConnectionWriter { stream: write_half, cipher: encrypt, cancel: self.cancel },
        )
    }
}

pub struct ConnectionReader {
    stream: OwnedReadHalf,
    cipher: Option<Rc4<rc4::consts::U20>>,
    cancel: CancellationToken,
    pending: VecDeque<u8>,
}

impl ConnectionReader {
    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap();
        }
        n
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), PeerError> {
        let from_pending = self.drain_pending(buf);
        if from_pending == buf.len() {
            return Ok(());
        }
        let rest = &mut buf[from_pending..];
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PeerError::Cancelled),
            result = timeout(IDLE_TIMEOUT, self.stream.read_exact(rest)) => {
                match result {
                    Ok(Ok(_)) => {
                        if let Some(cipher) = &mut self.cipher {
                            cipher.apply_keystream(rest);
                        }
                        Ok(())
                    }
                    Ok(Err(e)) => Err(PeerError::from(e)),
                    Err(_) => Err(PeerError::IdleTimeout),
                }
            }
        }
    }
}

pub struct ConnectionWriter {
    stream: OwnedWriteHalf,
    cipher: Option<Rc4<rc4::consts::U20>>,
    cancel: CancellationToken,
}

impl ConnectionWriter {
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        let mut outgoing = bytes.to_vec();
        if let Some(cipher) = &mut self.cipher {
            cipher.apply_keystream(&mut outgoing);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PeerError::Cancelled),
            result = timeout(IDLE_TIMEOUT, self.stream.write_all(&outgoing)) => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(PeerError::from(e)),
                    Err(_) => Err(PeerError::IdleTimeout),
                }
            }
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
