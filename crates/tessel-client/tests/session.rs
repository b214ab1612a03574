//! Session dispatcher against an in-process server over `tokio::io::duplex`.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use rand::rngs::OsRng;
use tessel_client::{compose, Contact, MemoryDirectory, NoRemoteLookup, Session, SessionError};
use tessel_core::packet::{encode_frame, frame_len, AUTH_SIZE, CLIENT_HELLO_SIZE};
use tessel_core::{
    EchoPacket, Group, GroupHeader, IdString, MessageBody, MessageHeader, Packet, PacketType,
    PubNick,
};
use tessel_crypto::envelope::{open_asymmetric, seal_end_to_end};
use tessel_crypto::{
    HandshakeError, KeyPair, LocalIdentity, Nonce, PublicKey, ServerHandshake, TransportCipher,
};

fn id(s: &str) -> IdString {
    IdString::parse(s).unwrap()
}

/// Server side of one connection: handshake, then framed packets.
struct FakeServer {
    stream: DuplexStream,
    transport: TransportCipher,
}

impl FakeServer {
    async fn accept(mut stream: DuplexStream, keys: KeyPair, client_key: PublicKey) -> Self {
        let mut server = ServerHandshake::new(&mut OsRng, keys);

        let mut hello = [0u8; CLIENT_HELLO_SIZE];
        stream.read_exact(&mut hello).await.unwrap();
        let reply = server.process_client_hello(&hello).unwrap();
        stream.write_all(&reply).await.unwrap();

        let mut auth = [0u8; AUTH_SIZE];
        stream.read_exact(&mut auth).await.unwrap();
        server.process_auth(&auth, move |_| Some(client_key)).unwrap();

        Self {
            stream,
            transport: server.into_transport().unwrap(),
        }
    }

    async fn recv(&mut self) -> Packet {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await.unwrap();
        let mut ciphertext = vec![0u8; frame_len(header)];
        self.stream.read_exact(&mut ciphertext).await.unwrap();
        Packet::decode(&self.transport.open(&ciphertext).unwrap()).unwrap()
    }

    async fn send(&mut self, packet: &Packet) {
        let ciphertext = self.transport.seal(&packet.encode()).unwrap();
        let frame = encode_frame(&ciphertext).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }
}

struct Fixture {
    session: Session<DuplexStream>,
    server: FakeServer,
    client: LocalIdentity,
    echo: LocalIdentity,
    friend: LocalIdentity,
    neighbour: LocalIdentity,
}

async fn connect() -> Fixture {
    connect_with_capacity(64 * 1024).await
}

async fn connect_with_capacity(capacity: usize) -> Fixture {
    let server_keys = KeyPair::generate(&mut OsRng);
    let server_public = server_keys.public().clone();
    let client = LocalIdentity::new(id("TESTTEST"), KeyPair::generate(&mut OsRng), PubNick::new("test"));
    let echo = LocalIdentity::new(id("ECHOECHO"), KeyPair::generate(&mut OsRng), PubNick::default());
    let friend = LocalIdentity::new(id("FRIEND01"), KeyPair::generate(&mut OsRng), PubNick::default());
    let neighbour = LocalIdentity::new(id("FRIEND02"), KeyPair::generate(&mut OsRng), PubNick::default());

    let directory = Arc::new(MemoryDirectory::with_contacts([
        Contact::new(echo.id, echo.keys.public().clone()),
        Contact::new(friend.id, friend.keys.public().clone()),
        Contact::new(neighbour.id, neighbour.keys.public().clone()),
    ]));

    let (client_io, server_io) = duplex(capacity);
    let (session, server) = tokio::join!(
        Session::connect(
            client_io,
            client.clone(),
            server_public,
            directory,
            Arc::new(NoRemoteLookup),
        ),
        FakeServer::accept(server_io, server_keys, client.keys.public().clone()),
    );

    Fixture {
        session: session.unwrap(),
        server,
        client,
        echo,
        friend,
        neighbour,
    }
}

#[tokio::test]
async fn test_message_round_trip() {
    let mut f = connect().await;
    assert_eq!(f.session.nonce_counters().await, (Some(2), Some(2)));

    let outgoing = compose::text(&mut OsRng, &f.client, f.echo.id, "hi");
    f.session.send_message(&outgoing).await.unwrap();

    let Packet::Message(delivered) = f.server.recv().await else {
        panic!("expected a message packet");
    };
    assert_eq!(delivered.packet_type, PacketType::OutgoingMessage);
    assert_eq!(delivered.sender, f.client.id);
    assert_eq!(delivered.recipient, f.echo.id);
    assert_eq!(delivered.id, outgoing.id());
    let body = open_asymmetric(
        &delivered.ciphertext,
        f.client.keys.public(),
        f.echo.keys.secret(),
        &Nonce::from_bytes(delivered.nonce),
    )
    .unwrap();
    assert_eq!(
        MessageBody::decode(&body).unwrap(),
        MessageBody::Text { text: "hi".into() }
    );

    // Reply from ECHOECHO, relayed by the server.
    let header = MessageHeader::new(&mut OsRng, f.echo.id, f.client.id, PubNick::default());
    let reply = MessageBody::Text { text: "hi back".into() };
    let (nonce, ciphertext) = seal_end_to_end(
        &mut OsRng,
        &reply.encode(&mut OsRng),
        f.client.keys.public(),
        f.echo.keys.secret(),
    )
    .unwrap();
    let incoming =
        tessel_core::MessagePacket::outgoing(&header, reply.default_flags(), nonce.to_bytes(), ciphertext)
            .into_incoming();
    f.server.send(&Packet::Message(incoming)).await;

    let Packet::Message(received) = f.session.recv_packet().await.unwrap() else {
        panic!("expected a message packet");
    };
    let message = f.session.open_message(&received).unwrap();
    assert_eq!(message.sender(), f.echo.id);
    assert_eq!(message.id(), header.id);
    assert_eq!(message.body, reply);

    f.session.send_ack(&received).await.unwrap();
    let Packet::Ack(ack) = f.server.recv().await else {
        panic!("expected an ack");
    };
    assert_eq!(ack.packet_type, PacketType::ClientAck);
    assert_eq!(ack.identity, f.echo.id);
    assert_eq!(ack.message_id, header.id);

    assert_eq!(f.session.nonce_counters().await, (Some(4), Some(3)));
}

#[tokio::test]
async fn test_echo_advances_counters() {
    let mut f = connect().await;

    let first = f.session.send_echo().await.unwrap();
    let second = f.session.send_echo().await.unwrap();
    assert_eq!((first, second), (1, 2));

    for expected in [1, 2] {
        let Packet::Echo(request) = f.server.recv().await else {
            panic!("expected an echo request");
        };
        assert_eq!(request.packet_type, PacketType::EchoRequest);
        assert_eq!(request.counter, expected);
        f.server.send(&Packet::Echo(request.reply())).await;
    }

    for expected in [1, 2] {
        let Packet::Echo(reply) = f.session.recv_packet().await.unwrap() else {
            panic!("expected an echo reply");
        };
        assert_eq!(reply.packet_type, PacketType::EchoReply);
        assert_eq!(reply.counter, expected);
    }
    assert_eq!(f.session.nonce_counters().await, (Some(4), Some(4)));
}

#[tokio::test]
async fn test_three_member_group_sealed_to_each_member() {
    let mut f = connect().await;
    let members = [f.echo.clone(), f.friend.clone(), f.neighbour.clone()];
    let group = Group::create(
        &mut OsRng,
        f.client.id,
        "friends",
        members.iter().map(|m| m.id).collect(),
    );

    let messages = compose::group_text(&mut OsRng, &f.client, &group, "hello all");
    assert_eq!(messages.len(), 3);
    f.session.send_messages(&messages).await.unwrap();

    let expected = MessageBody::GroupText {
        group: GroupHeader {
            creator: f.client.id,
            group_id: group.id,
        },
        text: "hello all".into(),
    };
    for member in &members {
        let Packet::Message(packet) = f.server.recv().await else {
            panic!("expected a message packet");
        };
        assert_eq!(packet.recipient, member.id);
        let body = open_asymmetric(
            &packet.ciphertext,
            f.client.keys.public(),
            member.keys.secret(),
            &Nonce::from_bytes(packet.nonce),
        )
        .unwrap();
        assert_eq!(MessageBody::decode(&body).unwrap(), expected);
    }
    assert_eq!(f.session.nonce_counters().await.0, Some(5));
}

#[tokio::test]
async fn test_unknown_recipient_leaves_session_usable() {
    let mut f = connect().await;

    let lost = compose::text(&mut OsRng, &f.client, id("NOBODY00"), "anyone?");
    let err = f.session.send_message(&lost).await.unwrap_err();
    assert!(matches!(err, SessionError::Lookup(_)));
    assert!(!err.is_fatal());
    assert!(!f.session.is_closed());
    assert_eq!(f.session.nonce_counters().await, (Some(2), Some(2)));

    let found = compose::text(&mut OsRng, &f.client, f.echo.id, "hello");
    f.session.send_message(&found).await.unwrap();
    let Packet::Message(packet) = f.server.recv().await else {
        panic!("expected a message packet");
    };
    assert_eq!(packet.id, found.id());
}

#[tokio::test]
async fn test_forged_frame_closes_session() {
    let mut f = connect().await;

    let frame = encode_frame(&[0u8; 40]).unwrap();
    f.server.stream.write_all(&frame).await.unwrap();

    let err = f.session.recv_packet().await.unwrap_err();
    assert!(matches!(err, SessionError::Crypto(_)));
    assert!(f.session.is_closed());

    assert!(matches!(
        f.session.send_echo().await,
        Err(SessionError::Closed)
    ));
    let message = compose::text(&mut OsRng, &f.client, f.echo.id, "too late");
    assert!(matches!(
        f.session.send_message(&message).await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn test_cancelled_send_closes_session() {
    // The server never reads, so the frame cannot be written in full.
    let f = connect_with_capacity(300).await;

    let message = compose::text(&mut OsRng, &f.client, f.echo.id, "x".repeat(2000));
    let sent = timeout(Duration::from_millis(100), f.session.send_message(&message)).await;
    assert!(sent.is_err());
    assert!(f.session.is_closed());

    assert!(matches!(
        f.session.send_echo().await,
        Err(SessionError::Closed)
    ));
    let again = compose::text(&mut OsRng, &f.client, f.echo.id, "retry");
    assert!(matches!(
        f.session.send_message(&again).await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn test_cancelled_receive_keeps_partial_frame() {
    let mut f = connect().await;

    let reply = Packet::Echo(EchoPacket::request(7).reply());
    let ciphertext = f.server.transport.seal(&reply.encode()).unwrap();
    let frame = encode_frame(&ciphertext).unwrap();

    f.server.stream.write_all(&frame[..5]).await.unwrap();
    let early = timeout(Duration::from_millis(50), f.session.recv_packet()).await;
    assert!(early.is_err());
    assert!(!f.session.is_closed());
    assert_eq!(f.session.nonce_counters().await.1, Some(2));

    f.server.stream.write_all(&frame[5..]).await.unwrap();
    assert_eq!(f.session.recv_packet().await.unwrap(), reply);
    assert_eq!(f.session.nonce_counters().await.1, Some(3));
}

#[tokio::test]
async fn test_closed_transport_is_fatal() {
    let f = connect().await;
    drop(f.server);

    let err = f.session.recv_packet().await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)));
    assert!(f.session.is_closed());
}

#[tokio::test]
async fn test_wrong_server_key_fails_handshake() {
    let server_keys = KeyPair::generate(&mut OsRng);
    let pinned = KeyPair::generate(&mut OsRng).public().clone();
    let client = LocalIdentity::new(id("TESTTEST"), KeyPair::generate(&mut OsRng), PubNick::default());

    let (client_io, mut server_io) = duplex(4096);
    let server = async move {
        let mut handshake = ServerHandshake::new(&mut OsRng, server_keys);
        let mut hello = [0u8; CLIENT_HELLO_SIZE];
        server_io.read_exact(&mut hello).await.unwrap();
        let reply = handshake.process_client_hello(&hello).unwrap();
        server_io.write_all(&reply).await.unwrap();
        server_io
    };

    let (result, _server_io) = tokio::join!(
        Session::connect(
            client_io,
            client,
            pinned,
            Arc::new(MemoryDirectory::new()),
            Arc::new(NoRemoteLookup),
        ),
        server,
    );
    assert!(matches!(
        result,
        Err(SessionError::Handshake(HandshakeError::Crypto(_)))
    ));
}
