//! Session dispatcher: an established, encrypted connection to the server.
//!
//! The send side and the receive side each sit behind their own async mutex.
//! Sealing a frame, advancing the nonce counter and writing the frame happen
//! under one guard, so frames leave in nonce order even with concurrent
//! senders. Key lookups and end-to-end sealing happen before the guard is
//! taken.
//!
//! A send that is cancelled after its frame was sealed closes the session:
//! the nonce is spent and the peer may hold a partial frame. Receiving is
//! cancel safe; partial frames stay buffered until the next
//! [`Session::recv_packet`].

use bytes::{Buf, BytesMut};
use rand::rngs::OsRng;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tessel_core::packet::{
    encode_frame, frame_len, AckPacket, EchoPacket, MessagePacket, Packet, PacketType,
    FRAME_HEADER_SIZE, MAX_FRAME_LEN, SERVER_HELLO_SIZE,
};
use tessel_core::{CodecError, IdString, Message, BOX_TAG_LEN};
use tessel_crypto::{
    envelope::{open_asymmetric, seal_end_to_end},
    ClientHandshake, CryptoError, HandshakeError, LocalIdentity, Nonce, PublicKey,
    TransportOpener, TransportSealer,
};
use thiserror::Error;

use crate::directory::{resolve_public_key, ContactDirectory, IdentityLookup, LookupError};

/// A decrypted transport packet received from the server.
pub type InboundPacket = Packet;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("transport crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("key lookup failed: {0}")]
    Lookup(#[from] LookupError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// End-to-end seal or open of a single message failed.
    #[error("end-to-end crypto error: {0}")]
    EndToEnd(CryptoError),

    /// A single message could not be encoded or decoded.
    #[error("message content error: {0}")]
    Content(CodecError),

    /// Every echo counter value has been used.
    #[error("echo counter exhausted")]
    EchoExhausted,

    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Whether the session can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::Crypto(_)
            | Self::Protocol(_)
            | Self::Handshake(_)
            | Self::Closed => true,
            Self::Lookup(_) | Self::EndToEnd(_) | Self::Content(_) | Self::EchoExhausted => {
                false
            }
        }
    }
}

struct SendHalf<W> {
    writer: W,
    sealer: TransportSealer,
    echo_counter: u64,
}

impl<W: AsyncWrite + Unpin> SendHalf<W> {
    async fn write_packet(&mut self, plaintext: &[u8]) -> Result<(), SessionError> {
        let ciphertext = self.sealer.seal(plaintext)?;
        let frame = encode_frame(&ciphertext)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Echo counter following `current`.
fn next_echo_counter(current: u64) -> Result<u64, SessionError> {
    current.checked_add(1).ok_or(SessionError::EchoExhausted)
}

/// Closes the session if dropped before the frame's I/O completes.
struct FrameInFlight<'a> {
    closed: &'a AtomicBool,
    done: bool,
}

impl<'a> FrameInFlight<'a> {
    fn start(closed: &'a AtomicBool) -> Self {
        Self {
            closed,
            done: false,
        }
    }

    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for FrameInFlight<'_> {
    fn drop(&mut self) {
        if !self.done && !self.closed.swap(true, Ordering::SeqCst) {
            warn!("send interrupted after sealing a frame; session closed");
        }
    }
}

struct RecvHalf<R> {
    reader: R,
    opener: TransportOpener,
    /// Bytes of frames not yet complete.
    pending: BytesMut,
}

impl<R: AsyncRead + Unpin> RecvHalf<R> {
    /// Only `read_buf` awaits, so dropping this future loses no bytes.
    async fn read_packet(&mut self) -> Result<Packet, SessionError> {
        loop {
            if let Some(ciphertext) = self.take_frame() {
                let plaintext = self.opener.open(&ciphertext)?;
                return Ok(Packet::decode(&plaintext)?);
            }
            self.pending.reserve(FRAME_HEADER_SIZE + BOX_TAG_LEN);
            if self.reader.read_buf(&mut self.pending).await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    fn take_frame(&mut self) -> Option<BytesMut> {
        let header: [u8; FRAME_HEADER_SIZE] =
            self.pending.get(..FRAME_HEADER_SIZE)?.try_into().ok()?;
        let len = frame_len(header);
        if self.pending.len() < FRAME_HEADER_SIZE + len {
            return None;
        }
        self.pending.advance(FRAME_HEADER_SIZE);
        Some(self.pending.split_to(len))
    }
}

/// An authenticated session with the server over any byte stream.
pub struct Session<S> {
    identity: LocalIdentity,
    directory: Arc<dyn ContactDirectory>,
    lookup: Arc<dyn IdentityLookup>,
    send: Mutex<SendHalf<WriteHalf<S>>>,
    recv: Mutex<RecvHalf<ReadHalf<S>>>,
    closed: AtomicBool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the handshake over `stream` and return the established session.
    ///
    /// Dropping the future mid-handshake drops all handshake state.
    pub async fn connect(
        mut stream: S,
        identity: LocalIdentity,
        server_public_key: PublicKey,
        directory: Arc<dyn ContactDirectory>,
        lookup: Arc<dyn IdentityLookup>,
    ) -> Result<Self, SessionError> {
        let mut handshake = ClientHandshake::new(&mut OsRng, identity.clone(), server_public_key);

        let hello = handshake.client_hello()?;
        stream.write_all(&hello).await?;
        stream.flush().await?;

        let mut server_hello = [0u8; SERVER_HELLO_SIZE];
        stream.read_exact(&mut server_hello).await?;
        handshake.process_server_hello(&server_hello)?;

        let auth = handshake.auth(&mut OsRng)?;
        stream.write_all(auth.as_bytes()).await?;
        stream.flush().await?;

        let (sealer, opener) = handshake.into_transport()?.split();
        info!(identity = %identity.id, "session established");

        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            identity,
            directory,
            lookup,
            send: Mutex::new(SendHalf {
                writer,
                sealer,
                echo_counter: 0,
            }),
            recv: Mutex::new(RecvHalf {
                reader,
                opener,
                pending: BytesMut::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next counter values of the send and receive nonces.
    pub async fn nonce_counters(&self) -> (Option<u64>, Option<u64>) {
        let send = self.send.lock().await.sealer.counter().counter();
        let recv = self.recv.lock().await.opener.counter().counter();
        (send, recv)
    }

    /// Seal `message` end to end and deliver it to the server.
    pub async fn send_message(&self, message: &Message) -> Result<(), SessionError> {
        self.ensure_open()?;
        let packet = self.seal_message(message)?;
        debug!(
            id = message.id(),
            recipient = %message.recipient(),
            kind = ?message.message_type(),
            "sending message"
        );
        self.send_packet(&Packet::Message(packet)).await
    }

    /// Send each message in order, stopping at the first error.
    pub async fn send_messages(&self, messages: &[Message]) -> Result<(), SessionError> {
        for message in messages {
            self.send_message(message).await?;
        }
        Ok(())
    }

    /// Acknowledge an incoming message to the server.
    pub async fn send_ack(&self, packet: &MessagePacket) -> Result<(), SessionError> {
        let ack = AckPacket::client(packet.sender, packet.id);
        debug!(id = packet.id, sender = %packet.sender, "sending ack");
        self.send_packet(&Packet::Ack(ack)).await
    }

    /// Send an echo request and return its counter.
    pub async fn send_echo(&self) -> Result<u64, SessionError> {
        self.ensure_open()?;
        let mut send = self.send.lock().await;
        self.ensure_open()?;
        let counter = next_echo_counter(send.echo_counter)?;
        let in_flight = FrameInFlight::start(&self.closed);
        let result = send
            .write_packet(&EchoPacket::request(counter).encode())
            .await;
        in_flight.finish();
        self.check(result)?;
        send.echo_counter = counter;
        debug!(counter, "sent echo request");
        Ok(counter)
    }

    /// Read and decrypt the next packet from the server.
    ///
    /// Cancel safe: a partially received frame is kept for the next call.
    pub async fn recv_packet(&self) -> Result<InboundPacket, SessionError> {
        self.ensure_open()?;
        let mut recv = self.recv.lock().await;
        self.ensure_open()?;
        let result = recv.read_packet().await;
        let packet = self.check(result)?;
        debug!(kind = ?packet.packet_type(), "received packet");
        Ok(packet)
    }

    /// Decrypt and decode the body of a received message packet.
    pub fn open_message(&self, packet: &MessagePacket) -> Result<Message, SessionError> {
        if packet.packet_type != PacketType::IncomingMessage {
            warn!(kind = ?packet.packet_type, "opening a message packet not addressed to us");
        }
        let sender_key = self.resolve(&packet.sender)?;
        let body = open_asymmetric(
            &packet.ciphertext,
            &sender_key,
            self.identity.keys.secret(),
            &Nonce::from_bytes(packet.nonce),
        )
        .map_err(SessionError::EndToEnd)?;
        Message::decode(packet.header(), &body).map_err(SessionError::Content)
    }

    /// Close the write side and mark the session closed.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut send = self.send.lock().await;
        send.writer.shutdown().await?;
        info!(identity = %self.identity.id, "session shut down");
        Ok(())
    }

    fn seal_message(&self, message: &Message) -> Result<MessagePacket, SessionError> {
        let recipient_key = self.resolve(&message.recipient())?;
        let body = message.encode(&mut OsRng);
        let (nonce, ciphertext) = seal_end_to_end(
            &mut OsRng,
            &body,
            &recipient_key,
            self.identity.keys.secret(),
        )
        .map_err(SessionError::EndToEnd)?;
        Ok(MessagePacket::outgoing(
            &message.header,
            message.body.default_flags(),
            nonce.to_bytes(),
            ciphertext,
        ))
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), SessionError> {
        let plaintext = packet.encode();
        // Oversized frames are rejected before a nonce is spent.
        if plaintext.len() + BOX_TAG_LEN > MAX_FRAME_LEN {
            return Err(SessionError::Content(CodecError::FrameTooLarge(
                plaintext.len() + BOX_TAG_LEN,
            )));
        }

        self.ensure_open()?;
        let mut send = self.send.lock().await;
        self.ensure_open()?;
        let in_flight = FrameInFlight::start(&self.closed);
        let result = send.write_packet(&plaintext).await;
        in_flight.finish();
        self.check(result)
    }

    fn resolve(&self, id: &IdString) -> Result<PublicKey, SessionError> {
        Ok(resolve_public_key(
            self.directory.as_ref(),
            self.lookup.as_ref(),
            id,
        )?)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn check<T>(&self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.closed.swap(true, Ordering::SeqCst) {
                warn!(error = %e, "session closed after fatal error");
            }
        }
        result
    }
}
