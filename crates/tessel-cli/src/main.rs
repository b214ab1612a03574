//! Tessel CLI tools: key generation, sending and receiving messages.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use tessel_client::{compose, Contact, MemoryDirectory, NoRemoteLookup, Session};
use tessel_common::ClientConfig;
use tessel_core::{IdString, MessageBody, MsgStatus, Packet, PacketType, PubNick};
use tessel_crypto::{KeyPair, LocalIdentity, PublicKey};

#[derive(Parser, Debug)]
#[command(name = "tessel")]
#[command(about = "Tessel CLI tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new long-term Curve25519 key pair
    Keygen {
        /// Output file path (without extension)
        #[arg(short, long, default_value = "tessel")]
        output: String,
    },

    /// Print the hex public key for a secret key file
    ShowKey {
        /// Secret key file path
        #[arg(short, long)]
        key: PathBuf,
    },

    /// Send a text message
    SendText {
        /// Client config file
        #[arg(short, long, env = "TESSEL_CONFIG", default_value = "tessel.json")]
        config: PathBuf,

        /// Recipient identity
        #[arg(short, long)]
        to: String,

        /// Message text
        text: String,
    },

    /// Print incoming messages until interrupted
    Listen {
        #[arg(short, long, env = "TESSEL_CONFIG", default_value = "tessel.json")]
        config: PathBuf,
    },

    /// Measure an echo round trip to the server
    Ping {
        #[arg(short, long, env = "TESSEL_CONFIG", default_value = "tessel.json")]
        config: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    tessel_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Keygen { output } => {
            println!("Generating Curve25519 keypair...");

            let keypair = KeyPair::generate(&mut OsRng);
            let secret_path = format!("{}.key", output);
            let public_path = format!("{}.pub", output);

            keypair.save(Path::new(&secret_path), Path::new(&public_path))?;

            println!("Secret key: {}", secret_path);
            println!("Public key: {}", public_path);
            println!("Public hex: {}", hex::encode(keypair.public_bytes()));
        }
        Command::ShowKey { key } => {
            let keypair = KeyPair::load(&key)?;
            println!("{}", hex::encode(keypair.public_bytes()));
        }
        Command::SendText { config, to, text } => {
            let config = ClientConfig::load(&config)?;
            let recipient = IdString::parse(&to).context("invalid recipient identity")?;

            runtime()?.block_on(async {
                let session = open_session(&config).await?;
                let message = compose::text(&mut OsRng, session.identity(), recipient, text);
                session.send_message(&message).await?;
                println!("Sent message {:016x} to {}", message.id(), recipient);

                // The server acks once it has queued the message.
                let wait = Duration::from_secs(config.connect_timeout_secs);
                match timeout(wait, wait_for_ack(&session, message.id())).await {
                    Ok(result) => result?,
                    Err(_) => warn!("no server ack within {:?}", wait),
                }
                session.shutdown().await?;
                Ok::<(), anyhow::Error>(())
            })?;
        }
        Command::Listen { config } => {
            let config = ClientConfig::load(&config)?;

            runtime()?.block_on(async {
                let session = open_session(&config).await?;
                println!("Listening as {}", session.identity().id);
                loop {
                    tokio::select! {
                        packet = session.recv_packet() => handle_inbound(&session, packet?).await?,
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
                session.shutdown().await?;
                Ok::<(), anyhow::Error>(())
            })?;
        }
        Command::Ping { config } => {
            let config = ClientConfig::load(&config)?;

            runtime()?.block_on(async {
                let session = open_session(&config).await?;
                let start = tokio::time::Instant::now();
                let counter = session.send_echo().await?;

                let wait = Duration::from_secs(config.connect_timeout_secs);
                let reply = timeout(wait, async {
                    loop {
                        match session.recv_packet().await? {
                            Packet::Echo(echo)
                                if echo.packet_type == PacketType::EchoReply
                                    && echo.counter == counter =>
                            {
                                return Ok::<(), anyhow::Error>(());
                            }
                            other => handle_inbound(&session, other).await?,
                        }
                    }
                })
                .await;

                match reply {
                    Ok(result) => {
                        result?;
                        println!("Echo {} from {}: RTT={:?}", counter, config.server_addr, start.elapsed());
                    }
                    Err(_) => println!("Echo timeout for {}", config.server_addr),
                }
                session.shutdown().await?;
                Ok::<(), anyhow::Error>(())
            })?;
        }
        Command::Version => {
            println!("tessel {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

async fn open_session(config: &ClientConfig) -> Result<Session<TcpStream>> {
    let keys = KeyPair::from_secret_bytes(config.secret_key_bytes()?);
    let pub_nick = config
        .nickname
        .as_deref()
        .map(PubNick::new)
        .unwrap_or_default();
    let identity = LocalIdentity::new(config.identity, keys, pub_nick);
    let server_key = PublicKey::from(config.server_public_key_bytes()?);

    let contacts = config
        .contact_keys()?
        .into_iter()
        .map(|(id, key)| Contact::new(id, PublicKey::from(key)));
    let directory = Arc::new(MemoryDirectory::with_contacts(contacts));

    let wait = Duration::from_secs(config.connect_timeout_secs);
    let stream = timeout(wait, TcpStream::connect(&config.server_addr))
        .await
        .with_context(|| format!("timed out connecting to {}", config.server_addr))?
        .with_context(|| format!("failed to connect to {}", config.server_addr))?;
    stream.set_nodelay(true)?;

    let session = timeout(
        wait,
        Session::connect(stream, identity, server_key, directory, Arc::new(NoRemoteLookup)),
    )
    .await
    .context("handshake timed out")??;
    info!(server = %config.server_addr, "connected");
    Ok(session)
}

async fn wait_for_ack(session: &Session<TcpStream>, message_id: u64) -> Result<()> {
    loop {
        match session.recv_packet().await? {
            Packet::Ack(ack) if ack.packet_type == PacketType::ServerAck && ack.message_id == message_id => {
                println!("Server accepted message {:016x}", message_id);
                return Ok(());
            }
            other => handle_inbound(session, other).await?,
        }
    }
}

/// Print a packet from the server, acking and confirming delivered messages.
async fn handle_inbound(session: &Session<TcpStream>, packet: Packet) -> Result<()> {
    match packet {
        Packet::Message(packet) => {
            match session.open_message(&packet) {
                Ok(message) => {
                    println!("{}", message);
                    if !matches!(
                        message.body,
                        MessageBody::DeliveryReceipt { .. } | MessageBody::TypingNotification { .. }
                    ) {
                        let receipt = compose::delivery_receipt(
                            &mut OsRng,
                            session.identity(),
                            message.sender(),
                            MsgStatus::Delivered,
                            message.id(),
                        );
                        if let Err(e) = session.send_message(&receipt).await {
                            warn!(error = %e, "failed to send delivery receipt");
                        }
                    }
                }
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, sender = %packet.sender, "dropping unreadable message");
                }
                Err(e) => return Err(e.into()),
            }
            session.send_ack(&packet).await?;
        }
        Packet::Echo(echo) => {
            info!(counter = echo.counter, kind = ?echo.packet_type, "echo");
        }
        Packet::Ack(ack) => {
            info!(id = ack.message_id, kind = ?ack.packet_type, "ack");
        }
    }
    Ok(())
}
