//! Client and server handshake state machines.
//!
//! ```text
//! client                                   server
//!   | -- ClientHello (eph pk, prefix) ------> |
//!   | <----- ServerHello (prefix, box) ------ |   box: server eph pk, client prefix
//!   | -- Auth (box of AuthPayload) ---------> |   inner box: client eph pk
//! ```
//!
//! The server hello box is sealed with the server's long-term key, which
//! the client has pinned; that authenticates the server. The inner box of
//! the auth payload is sealed with the client's long-term key, which
//! authenticates the client. Transport traffic then uses the two ephemeral
//! keys only.
//!
//! Neither side retries. Any failure moves the machine to its `Failed`
//! state and the connection must be dropped.

use crypto_box::PublicKey;
use rand::{CryptoRng, RngCore};
use tessel_core::packet::{
    AUTH_INNER_SIZE, AUTH_SIZE, CLIENT_HELLO_SIZE, SERVER_HELLO_BOX_SIZE, SERVER_HELLO_SIZE,
    SYSTEM_DATA_LEN,
};
use tessel_core::{
    AuthPacket, AuthPayload, ClientHello, CodecError, IdString, ServerHello, ServerHelloBody,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::{open_asymmetric, seal_asymmetric, CryptoError};
use crate::keys::{KeyPair, LocalIdentity};
use crate::nonce::{Nonce, NonceCounter};
use crate::transport::TransportCipher;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("cannot {operation} in state {state}")]
    InvalidTransition {
        state: &'static str,
        operation: &'static str,
    },

    #[error("peer echoed the wrong nonce prefix")]
    PrefixMismatch,

    #[error("inner auth box does not carry the client ephemeral key")]
    EphemeralMismatch,

    #[error("unknown identity: {0}")]
    UnknownIdentity(IdString),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Client-side handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting to send the client hello
    Init,
    /// Sent the client hello, waiting for the server hello
    ClientHelloSent,
    /// Server authenticated, ready to send auth
    ServerHelloReceived,
    /// Auth sent, transport keys ready
    Established,
    /// A step failed; the connection is unusable
    Failed,
}

impl HandshakeState {
    fn name(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::ClientHelloSent => "ClientHelloSent",
            Self::ServerHelloReceived => "ServerHelloReceived",
            Self::Established => "Established",
            Self::Failed => "Failed",
        }
    }
}

pub struct ClientHandshake {
    state: HandshakeState,
    identity: LocalIdentity,
    server_long_term: PublicKey,
    ephemeral: KeyPair,
    client_nonce: NonceCounter,
    server_nonce: Option<NonceCounter>,
    server_ephemeral: Option<PublicKey>,
}

impl ClientHandshake {
    /// Start a handshake with a fresh ephemeral key pair and nonce prefix.
    pub fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        identity: LocalIdentity,
        server_long_term: PublicKey,
    ) -> Self {
        Self {
            state: HandshakeState::Init,
            identity,
            server_long_term,
            ephemeral: KeyPair::generate(rng),
            client_nonce: NonceCounter::random(rng),
            server_nonce: None,
            server_ephemeral: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn ephemeral_public(&self) -> &PublicKey {
        self.ephemeral.public()
    }

    fn expect(&self, state: HandshakeState, operation: &'static str) -> Result<(), HandshakeError> {
        if self.state == state {
            Ok(())
        } else {
            Err(HandshakeError::InvalidTransition {
                state: self.state.name(),
                operation,
            })
        }
    }

    fn fail<T>(&mut self, err: HandshakeError) -> Result<T, HandshakeError> {
        warn!("client handshake failed in {}: {}", self.state.name(), err);
        self.state = HandshakeState::Failed;
        Err(err)
    }

    /// Produce the 48-byte client hello.
    pub fn client_hello(&mut self) -> Result<[u8; CLIENT_HELLO_SIZE], HandshakeError> {
        self.expect(HandshakeState::Init, "send client hello")?;
        let hello = ClientHello {
            ephemeral_pk: self.ephemeral.public_bytes(),
            nonce_prefix: *self.client_nonce.prefix(),
        };
        self.state = HandshakeState::ClientHelloSent;
        debug!("client hello ready");
        Ok(hello.encode())
    }

    /// Authenticate the server and learn its ephemeral key.
    pub fn process_server_hello(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        self.expect(HandshakeState::ClientHelloSent, "process server hello")?;
        match self.open_server_hello(data) {
            Ok(()) => {
                self.state = HandshakeState::ServerHelloReceived;
                debug!("server hello verified");
                Ok(())
            }
            Err(err) => self.fail(err),
        }
    }

    fn open_server_hello(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        let hello = ServerHello::decode(data)?;
        let mut server_nonce = NonceCounter::new(hello.nonce_prefix);

        let plaintext = open_asymmetric(
            &hello.sealed,
            &self.server_long_term,
            self.ephemeral.secret(),
            &server_nonce.next()?,
        )?;
        let body = ServerHelloBody::decode(&plaintext)?;
        if &body.client_prefix != self.client_nonce.prefix() {
            return Err(HandshakeError::PrefixMismatch);
        }

        self.server_ephemeral = Some(PublicKey::from(body.ephemeral_pk));
        self.server_nonce = Some(server_nonce);
        Ok(())
    }

    /// Produce the 144-byte auth packet and finish the handshake.
    pub fn auth<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<AuthPacket, HandshakeError> {
        self.expect(HandshakeState::ServerHelloReceived, "send auth")?;
        match self.seal_auth(rng) {
            Ok(packet) => {
                self.state = HandshakeState::Established;
                debug!(identity = %self.identity.id, "auth sealed, handshake established");
                Ok(packet)
            }
            Err(err) => self.fail(err),
        }
    }

    fn seal_auth<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<AuthPacket, HandshakeError> {
        let (server_ephemeral, server_prefix) = match (&self.server_ephemeral, &self.server_nonce) {
            (Some(pk), Some(counter)) => (pk.clone(), *counter.prefix()),
            _ => {
                return Err(HandshakeError::InvalidTransition {
                    state: self.state.name(),
                    operation: "send auth",
                })
            }
        };

        let inner_nonce = Nonce::random(rng);
        let inner = seal_asymmetric(
            self.ephemeral.public().as_bytes(),
            &self.server_long_term,
            self.identity.keys.secret(),
            &inner_nonce,
        )?;
        let sealed_ephemeral: [u8; AUTH_INNER_SIZE] =
            exact_len("auth inner box", inner, AUTH_INNER_SIZE)?;

        let payload = AuthPayload {
            identity: self.identity.id,
            system_data: [0u8; SYSTEM_DATA_LEN],
            server_prefix,
            nonce: inner_nonce.to_bytes(),
            sealed_ephemeral,
        };

        self.client_nonce.set_counter(1);
        let outer = seal_asymmetric(
            &payload.encode(),
            &server_ephemeral,
            self.ephemeral.secret(),
            &self.client_nonce.next()?,
        )?;
        let ciphertext: [u8; AUTH_SIZE] = exact_len("auth packet", outer, AUTH_SIZE)?;
        Ok(AuthPacket { ciphertext })
    }

    /// Hand over the transport keys of an established handshake.
    pub fn into_transport(self) -> Result<TransportCipher, HandshakeError> {
        self.expect(HandshakeState::Established, "start transport")?;
        match (self.server_ephemeral, self.server_nonce) {
            (Some(server_ephemeral), Some(server_nonce)) => Ok(TransportCipher::new(
                &server_ephemeral,
                self.ephemeral.secret(),
                self.client_nonce,
                server_nonce,
            )),
            _ => Err(HandshakeError::InvalidTransition {
                state: "Established",
                operation: "start transport",
            }),
        }
    }
}

/// Server-side handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHandshakeState {
    /// Waiting for the client hello
    Init,
    /// Sent the server hello, waiting for auth
    ServerHelloSent,
    /// Client authenticated
    Established,
    Failed,
}

impl ServerHandshakeState {
    fn name(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::ServerHelloSent => "ServerHelloSent",
            Self::Established => "Established",
            Self::Failed => "Failed",
        }
    }
}

/// Responder side of the handshake.
pub struct ServerHandshake {
    state: ServerHandshakeState,
    long_term: KeyPair,
    ephemeral: KeyPair,
    server_nonce: NonceCounter,
    client_nonce: Option<NonceCounter>,
    client_ephemeral: Option<PublicKey>,
    client_identity: Option<IdString>,
}

impl ServerHandshake {
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R, long_term: KeyPair) -> Self {
        Self {
            state: ServerHandshakeState::Init,
            long_term,
            ephemeral: KeyPair::generate(rng),
            server_nonce: NonceCounter::random(rng),
            client_nonce: None,
            client_ephemeral: None,
            client_identity: None,
        }
    }

    pub fn state(&self) -> ServerHandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ServerHandshakeState::Established
    }

    /// Identity the client authenticated as.
    pub fn client_identity(&self) -> Option<IdString> {
        self.client_identity
    }

    fn expect(&self, state: ServerHandshakeState, operation: &'static str) -> Result<(), HandshakeError> {
        if self.state == state {
            Ok(())
        } else {
            Err(HandshakeError::InvalidTransition {
                state: self.state.name(),
                operation,
            })
        }
    }

    fn fail<T>(&mut self, err: HandshakeError) -> Result<T, HandshakeError> {
        warn!("server handshake failed in {}: {}", self.state.name(), err);
        self.state = ServerHandshakeState::Failed;
        Err(err)
    }

    /// Consume the client hello and produce the 80-byte server hello.
    pub fn process_client_hello(
        &mut self,
        data: &[u8],
    ) -> Result<[u8; SERVER_HELLO_SIZE], HandshakeError> {
        self.expect(ServerHandshakeState::Init, "process client hello")?;
        match self.seal_server_hello(data) {
            Ok(hello) => {
                self.state = ServerHandshakeState::ServerHelloSent;
                debug!("server hello ready");
                Ok(hello)
            }
            Err(err) => self.fail(err),
        }
    }

    fn seal_server_hello(
        &mut self,
        data: &[u8],
    ) -> Result<[u8; SERVER_HELLO_SIZE], HandshakeError> {
        let hello = ClientHello::decode(data)?;
        let client_ephemeral = PublicKey::from(hello.ephemeral_pk);

        let body = ServerHelloBody {
            ephemeral_pk: self.ephemeral.public_bytes(),
            client_prefix: hello.nonce_prefix,
        };
        let sealed = seal_asymmetric(
            &body.encode(),
            &client_ephemeral,
            self.long_term.secret(),
            &self.server_nonce.next()?,
        )?;
        let sealed = exact_len("server hello box", sealed, SERVER_HELLO_BOX_SIZE)?;

        self.client_nonce = Some(NonceCounter::new(hello.nonce_prefix));
        self.client_ephemeral = Some(client_ephemeral);
        Ok(ServerHello {
            nonce_prefix: *self.server_nonce.prefix(),
            sealed,
        }
        .encode())
    }

    /// Open and verify the auth packet.
    ///
    /// `lookup` returns the long-term public key registered for an identity.
    pub fn process_auth<F>(&mut self, data: &[u8], lookup: F) -> Result<IdString, HandshakeError>
    where
        F: FnOnce(&IdString) -> Option<PublicKey>,
    {
        self.expect(ServerHandshakeState::ServerHelloSent, "process auth")?;
        match self.open_auth(data, lookup) {
            Ok(identity) => {
                self.client_identity = Some(identity);
                self.state = ServerHandshakeState::Established;
                debug!(%identity, "client authenticated");
                Ok(identity)
            }
            Err(err) => self.fail(err),
        }
    }

    fn open_auth<F>(&mut self, data: &[u8], lookup: F) -> Result<IdString, HandshakeError>
    where
        F: FnOnce(&IdString) -> Option<PublicKey>,
    {
        let packet = AuthPacket::from_ciphertext(data)?;
        let (client_ephemeral, client_nonce) =
            match (&self.client_ephemeral, self.client_nonce.as_mut()) {
                (Some(pk), Some(counter)) => (pk.clone(), counter),
                _ => {
                    return Err(HandshakeError::InvalidTransition {
                        state: self.state.name(),
                        operation: "process auth",
                    })
                }
            };

        client_nonce.set_counter(1);
        let plaintext = open_asymmetric(
            packet.as_bytes(),
            &client_ephemeral,
            self.ephemeral.secret(),
            &client_nonce.next()?,
        )?;
        let payload = AuthPayload::decode(&plaintext)?;
        if &payload.server_prefix != self.server_nonce.prefix() {
            return Err(HandshakeError::PrefixMismatch);
        }

        let client_long_term =
            lookup(&payload.identity).ok_or(HandshakeError::UnknownIdentity(payload.identity))?;
        let inner = open_asymmetric(
            &payload.sealed_ephemeral,
            &client_long_term,
            self.long_term.secret(),
            &Nonce::from_bytes(payload.nonce),
        )?;
        if inner.as_slice() != client_ephemeral.as_bytes() {
            return Err(HandshakeError::EphemeralMismatch);
        }

        Ok(payload.identity)
    }

    pub fn into_transport(self) -> Result<TransportCipher, HandshakeError> {
        self.expect(ServerHandshakeState::Established, "start transport")?;
        match (self.client_ephemeral, self.client_nonce) {
            (Some(client_ephemeral), Some(client_nonce)) => Ok(TransportCipher::new(
                &client_ephemeral,
                self.ephemeral.secret(),
                self.server_nonce,
                client_nonce,
            )),
            _ => Err(HandshakeError::InvalidTransition {
                state: "Established",
                operation: "start transport",
            }),
        }
    }
}

fn exact_len<const N: usize>(
    what: &'static str,
    data: Vec<u8>,
    expected: usize,
) -> Result<[u8; N], CryptoError> {
    let actual = data.len();
    data.try_into()
        .map_err(|_| CryptoError::UnexpectedLength {
            what,
            expected,
            actual,
        })
}
