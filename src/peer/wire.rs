//! Wire protocol state machine (§4.8): `WaitingHandshake → Active →
//! Closed`, framing regular messages on top of a [`Connection`].
use super::connection::{Connection, ConnectionReader, ConnectionWriter};
use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::{Message, MAX_MESSAGE_LEN};
use super::PeerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    WaitingHandshake,
    Active,
    Closed,
}

pub struct Wire {
    connection: Connection,
    state: WireState,
    piece_count: usize,
    /// §5: bitfield must precede any have/request from the same peer;
    /// once any other message arrives this flips permanently.
    seen_non_bitfield_message: bool,
}

impl Wire {
    pub fn new(connection: Connection, piece_count: usize) -> Self {
        Self { connection, state: WireState::WaitingHandshake, piece_count, seen_non_bitfield_message: false }
    }

    pub fn state(&self) -> WireState {
        self.state
    }

    /// Only outbound action permitted in `WaitingHandshake` (§4.8). Goes
    /// through the cipher-aware path so an already-installed MSE/PE
    /// cipher (if any) transparently encrypts it; on a fresh plaintext
    /// connection there is no cipher installed yet, so this is a no-op
    /// pass-through.
    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.connection.write_all(&handshake.serialize()).await
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        if self.state != WireState::WaitingHandshake {
            return Err(PeerError::Protocol("handshake already completed".into()));
        }
        let mut buf = [0u8; HANDSHAKE_LEN];
        self.connection.read_exact(&mut buf).await?;
        match Handshake::parse(&buf) {
            Ok(handshake) => {
                self.state = WireState::Active;
                Ok(handshake)
            }
            Err(e) => {
                self.state = WireState::Closed;
                self.connection.close().await;
                Err(e)
            }
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        if self.state != WireState::Active {
            return Err(PeerError::Protocol("send attempted before handshake completed".into()));
        }
        self.connection.write_all(&message.encode()).await
    }

    /// Read exactly one frame: a 4-byte length prefix, then (if
    /// non-zero) that many bytes of `id + payload`, dispatched per
    /// §4.8's per-message validation rules.
    pub async fn receive(&mut self) -> Result<Message, PeerError> {
        if self.state != WireState::Active {
            return Err(PeerError::Protocol("receive attempted before handshake completed".into()));
        }
        let mut len_buf = [0u8; 4];
        if let Err(e) = self.connection.read_exact(&mut len_buf).await {
            self.state = WireState::Closed;
            return Err(e);
        }
        let length = u32::from_be_bytes(len_buf);
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_MESSAGE_LEN {
            self.state = WireState::Closed;
            self.connection.close().await;
            return Err(PeerError::MessageTooLarge(length as usize));
        }
        let mut body = vec![0u8; length as usize];
        if let Err(e) = self.connection.read_exact(&mut body).await {
            self.state = WireState::Closed;
            return Err(e);
        }
        let id = body[0];
        let payload = &body[1..];

        if id == super::message::ID_BITFIELD && self.seen_non_bitfield_message {
            self.state = WireState::Closed;
            self.connection.close().await;
            return Err(PeerError::Protocol("bitfield received after an earlier message".into()));
        }
        if id != super::message::ID_BITFIELD {
            self.seen_non_bitfield_message = true;
        }

        match Message::parse(id, payload, self.piece_count) {
            Ok(message) => Ok(message),
            Err(e) => {
                self.state = WireState::Closed;
                self.connection.close().await;
                Err(e)
            }
        }
    }

    pub async fn close(&mut self) {
        self.state = WireState::Closed;
        self.connection.close().await;
    }

    /// Splits into a reader/writer pair once the handshake has already
    /// completed, so the connection's two directions can be driven by
    /// independent tasks without racing cancellation inside `select!`
    /// on a single shared `Connection` (§4.10: the manager drives reads
    /// and writes concurrently per peer).
    pub fn split(self) -> (WireReader, WireWriter) {
        let (reader, writer) = self.connection.split();
        (
            WireReader { connection: reader, piece_count: self.piece_count, seen_non_bitfield_message: self.seen_non_bitfield_message },
            WireWriter { connection: writer },
        )
    }
}

pub struct WireReader {
    connection: ConnectionReader,
    piece_count: usize,
    seen_non_bitfield_message: bool,
}

impl WireReader {
    pub async fn receive(&mut self) -> Result<Message, PeerError> {
        let mut len_buf = [0u8; 4];
        self.connection.read_exact(&mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf);
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLarge(length as usize));
        }
        let mut body = vec![0u8; length as usize];
        self.connection.read_exact(&mut body).await?;
        let id = body[0];
        let payload = &body[1..];

        if id == super::message::ID_BITFIELD && self.seen_non_bitfield_message {
            return Err(PeerError::Protocol("bitfield received after an earlier message".into()));
        }
        if id != super::message::ID_BITFIELD {
            self.seen_non_bitfield_message = true;
        }

        Message::parse(id, payload, self.piece_count)
    }
}

pub struct WireWriter {
    connection: ConnectionWriter,
}

impl WireWriter {
    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        self.connection.write_all(&message.encode()).await
    }

    pub async fn close(&mut self) {
        self.connection.shutdown().await;
    }
}
