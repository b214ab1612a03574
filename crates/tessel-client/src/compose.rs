//! Message factories.
//!
//! Media factories read the content, encrypt it, upload it and only then
//! build the message, so a failure never leaves a half-built message behind.
//! Group factories return one message per member; the protocol has no
//! server-side fan-out.

use rand::{CryptoRng, RngCore};
use std::io::{self, Read};
use tessel_core::{
    AudioBlob, Group, GroupHeader, IdString, ImageBlob, Message, MessageBody, MessageHeader,
    MsgStatus, SymmetricBlob,
};
use tessel_crypto::envelope::{
    open_asymmetric, open_blob_symmetric, seal_blob_symmetric, seal_end_to_end,
};
use tessel_crypto::{CryptoError, LocalIdentity, Nonce, PublicKey};
use thiserror::Error;
use tracing::debug;

use crate::directory::{
    resolve_public_key, BlobError, BlobRef, BlobStore, ContactDirectory, IdentityLookup,
    LookupError,
};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("content unavailable: {0}")]
    Content(#[from] io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("lookup error: {0}")]
    Lookup(#[from] LookupError),
}

fn header<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    recipient: IdString,
) -> MessageHeader {
    MessageHeader::new(rng, identity.id, recipient, identity.pub_nick)
}

fn fan_out<R, F>(rng: &mut R, identity: &LocalIdentity, group: &Group, body: F) -> Vec<Message>
where
    R: RngCore + CryptoRng,
    F: Fn() -> MessageBody,
{
    group
        .members
        .iter()
        .map(|member| Message::new(header(rng, identity, *member), body()))
        .collect()
}

fn group_header(group: &Group) -> GroupHeader {
    GroupHeader {
        creator: group.creator,
        group_id: group.id,
    }
}

fn read_content(mut source: impl Read) -> Result<Vec<u8>, ComposeError> {
    let mut data = Vec::new();
    source.read_to_end(&mut data)?;
    Ok(data)
}

fn blob_size(ciphertext: &[u8]) -> Result<u32, ComposeError> {
    u32::try_from(ciphertext.len()).map_err(|_| BlobError::TooLarge(ciphertext.len()).into())
}

/// Encrypt `source` under a fresh single-use key and upload it.
fn upload_symmetric<R: RngCore + CryptoRng>(
    rng: &mut R,
    source: impl Read,
    store: &dyn BlobStore,
) -> Result<SymmetricBlob, ComposeError> {
    let data = read_content(source)?;
    let (key, ciphertext) = seal_blob_symmetric(rng, &data)?;
    let size = blob_size(&ciphertext)?;
    let BlobRef { blob_id, .. } = store.upload_encrypted(&ciphertext)?;
    debug!(blob = %hex::encode(blob_id), size, "uploaded symmetric blob");
    Ok(SymmetricBlob { blob_id, size, key })
}

pub fn text<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    recipient: IdString,
    text: impl Into<String>,
) -> Message {
    Message::new(
        header(rng, identity, recipient),
        MessageBody::Text { text: text.into() },
    )
}

/// Image sealed to the recipient's long-term key.
///
/// The key is resolved before the content is read, so an unknown recipient
/// uploads nothing.
pub fn image<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    recipient: IdString,
    directory: &dyn ContactDirectory,
    lookup: &dyn IdentityLookup,
    source: impl Read,
    store: &dyn BlobStore,
) -> Result<Message, ComposeError> {
    let recipient_pk = resolve_public_key(directory, lookup, &recipient)?;
    let data = read_content(source)?;
    let (nonce, ciphertext) = seal_end_to_end(rng, &data, &recipient_pk, identity.keys.secret())?;
    let size = blob_size(&ciphertext)?;
    let blob = store.upload_encrypted(&ciphertext)?;
    debug!(blob = %hex::encode(blob.blob_id), size, "uploaded image blob");

    Ok(Message::new(
        header(rng, identity, recipient),
        MessageBody::Image(ImageBlob {
            blob_id: blob.blob_id,
            server_shard: blob.server_shard,
            size,
            nonce: nonce.to_bytes(),
        }),
    ))
}

pub fn audio<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    recipient: IdString,
    source: impl Read,
    store: &dyn BlobStore,
) -> Result<Message, ComposeError> {
    let blob = upload_symmetric(rng, source, store)?;
    Ok(Message::new(
        header(rng, identity, recipient),
        MessageBody::Audio(AudioBlob::new(blob)),
    ))
}

pub fn group_text<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    group: &Group,
    text: &str,
) -> Vec<Message> {
    let group_header = group_header(group);
    fan_out(rng, identity, group, || MessageBody::GroupText {
        group: group_header,
        text: text.to_string(),
    })
}

/// Group image; the blob is uploaded once and shared by every member.
pub fn group_image<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    group: &Group,
    source: impl Read,
    store: &dyn BlobStore,
) -> Result<Vec<Message>, ComposeError> {
    let blob = upload_symmetric(rng, source, store)?;
    let group_header = group_header(group);
    Ok(fan_out(rng, identity, group, || MessageBody::GroupImage {
        group: group_header,
        blob,
    }))
}

pub fn group_member_left<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    group: &Group,
) -> Vec<Message> {
    let group_header = group_header(group);
    fan_out(rng, identity, group, || MessageBody::GroupMemberLeft {
        group: group_header,
    })
}

pub fn group_set_members<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    group: &Group,
) -> Vec<Message> {
    fan_out(rng, identity, group, || MessageBody::GroupSetMembers {
        group_id: group.id,
        members: group.members.clone(),
    })
}

pub fn group_set_name<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    group: &Group,
) -> Vec<Message> {
    fan_out(rng, identity, group, || MessageBody::GroupSetName {
        group_id: group.id,
        name: group.name.clone(),
    })
}

pub fn group_set_image<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    group: &Group,
    source: impl Read,
    store: &dyn BlobStore,
) -> Result<Vec<Message>, ComposeError> {
    let blob = upload_symmetric(rng, source, store)?;
    Ok(fan_out(rng, identity, group, || MessageBody::GroupSetImage {
        group_id: group.id,
        blob,
    }))
}

pub fn delivery_receipt<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    recipient: IdString,
    status: MsgStatus,
    message_id: u64,
) -> Message {
    Message::new(
        header(rng, identity, recipient),
        MessageBody::DeliveryReceipt { status, message_id },
    )
}

pub fn typing_notification<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &LocalIdentity,
    recipient: IdString,
    typing: bool,
) -> Message {
    Message::new(
        header(rng, identity, recipient),
        MessageBody::TypingNotification { typing },
    )
}

/// Download and open the blob of a direct image.
pub fn fetch_image(
    store: &dyn BlobStore,
    image: &ImageBlob,
    sender_pk: &PublicKey,
    identity: &LocalIdentity,
) -> Result<Vec<u8>, ComposeError> {
    let ciphertext = store.download_encrypted(&image.blob_id)?;
    Ok(open_asymmetric(
        &ciphertext,
        sender_pk,
        identity.keys.secret(),
        &Nonce::from_bytes(image.nonce),
    )?)
}

/// Download and open an audio, group image or group picture blob.
pub fn fetch_symmetric_blob(
    store: &dyn BlobStore,
    blob: &SymmetricBlob,
) -> Result<Vec<u8>, ComposeError> {
    let ciphertext = store.download_encrypted(&blob.blob_id)?;
    Ok(open_blob_symmetric(&ciphertext, &blob.key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Contact, MemoryBlobStore, MemoryDirectory, NoRemoteLookup};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use tessel_core::{MessageType, MsgFlags, PubNick};
    use tessel_crypto::KeyPair;

    fn id(s: &str) -> IdString {
        IdString::parse(s).unwrap()
    }

    fn me(rng: &mut StdRng) -> LocalIdentity {
        LocalIdentity::new(id("ECHOECHO"), KeyPair::generate(rng), PubNick::new("echo"))
    }

    struct BrokenSource;

    impl Read for BrokenSource {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        }
    }

    #[test]
    fn text_message_fields() {
        let mut rng = StdRng::seed_from_u64(1);
        let identity = me(&mut rng);
        let msg = text(&mut rng, &identity, id("TESTTEST"), "hi");
        assert_eq!(msg.sender().as_str(), "ECHOECHO");
        assert_eq!(msg.recipient().as_str(), "TESTTEST");
        assert_eq!(msg.header.pub_nick.as_str(), "echo");
        assert_eq!(msg.body, MessageBody::Text { text: "hi".into() });
        assert_eq!(msg.body.default_flags(), MsgFlags::PUSH);
    }

    #[test]
    fn three_member_group_fan_out() {
        let mut rng = StdRng::seed_from_u64(2);
        let identity = me(&mut rng);
        let group = Group::create(
            &mut rng,
            identity.id,
            "Climbing",
            vec![id("AAAAAAAA"), id("BBBBBBBB"), id("CCCCCCCC")],
        );

        let messages = group_text(&mut rng, &identity, &group, "hello all");
        assert_eq!(messages.len(), 3);

        let recipients: Vec<&str> = messages.iter().map(|m| m.header.recipient.as_str()).collect();
        assert_eq!(recipients, vec!["AAAAAAAA", "BBBBBBBB", "CCCCCCCC"]);

        let ids: HashSet<u64> = messages.iter().map(Message::id).collect();
        assert_eq!(ids.len(), 3);

        for msg in &messages {
            assert_eq!(
                msg.body,
                MessageBody::GroupText {
                    group: GroupHeader {
                        creator: identity.id,
                        group_id: group.id,
                    },
                    text: "hello all".into(),
                }
            );
            assert_eq!(msg.body.default_flags(), MsgFlags::PUSH | MsgFlags::GROUP);
        }
    }

    #[test]
    fn group_management_fan_out() {
        let mut rng = StdRng::seed_from_u64(3);
        let identity = me(&mut rng);
        let group = Group::create(&mut rng, identity.id, "Team", vec![id("AAAAAAAA"), id("BBBBBBBB")]);

        let members = group_set_members(&mut rng, &identity, &group);
        assert!(members.iter().all(|m| matches!(
            &m.body,
            MessageBody::GroupSetMembers { members, .. } if members.len() == 2
        )));

        let names = group_set_name(&mut rng, &identity, &group);
        assert!(names
            .iter()
            .all(|m| m.message_type() == MessageType::GroupSetName));

        let left = group_member_left(&mut rng, &identity, &group);
        assert_eq!(left.len(), 2);
    }

    #[test]
    fn image_round_trip_through_store() {
        let mut rng = StdRng::seed_from_u64(4);
        let sender = me(&mut rng);
        let recipient = LocalIdentity::new(id("TESTTEST"), KeyPair::generate(&mut rng), PubNick::default());
        let store = MemoryBlobStore::new();
        let picture = vec![0x89u8; 2048];

        let directory =
            MemoryDirectory::with_contacts([Contact::new(recipient.id, recipient.keys.public().clone())]);

        let msg = image(
            &mut rng,
            &sender,
            recipient.id,
            &directory,
            &NoRemoteLookup,
            picture.as_slice(),
            &store,
        )
        .unwrap();

        let MessageBody::Image(blob) = &msg.body else {
            panic!("expected image body");
        };
        assert_eq!(blob.size as usize, picture.len() + 16);
        let opened = fetch_image(&store, blob, sender.keys.public(), &recipient).unwrap();
        assert_eq!(opened, picture);
    }

    #[test]
    fn audio_round_trip_through_store() {
        let mut rng = StdRng::seed_from_u64(5);
        let sender = me(&mut rng);
        let store = MemoryBlobStore::new();

        let msg = audio(&mut rng, &sender, id("TESTTEST"), &b"clip"[..], &store).unwrap();
        let MessageBody::Audio(audio) = &msg.body else {
            panic!("expected audio body");
        };
        assert_eq!(audio.duration, tessel_core::AUDIO_DURATION_UNKNOWN);
        assert_eq!(fetch_symmetric_blob(&store, &audio.blob).unwrap(), b"clip");
    }

    #[test]
    fn group_image_shares_one_blob() {
        let mut rng = StdRng::seed_from_u64(6);
        let identity = me(&mut rng);
        let group = Group::create(&mut rng, identity.id, "G", vec![id("AAAAAAAA"), id("BBBBBBBB")]);
        let store = MemoryBlobStore::new();

        let messages = group_image(&mut rng, &identity, &group, &b"pixels"[..], &store).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(messages[0].body, messages[1].body);
    }

    #[test]
    fn unreadable_content_yields_no_message() {
        let mut rng = StdRng::seed_from_u64(7);
        let identity = me(&mut rng);
        let store = MemoryBlobStore::new();

        let err = audio(&mut rng, &identity, id("TESTTEST"), BrokenSource, &store).unwrap_err();
        assert!(matches!(err, ComposeError::Content(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn image_for_unknown_recipient_uploads_nothing() {
        let mut rng = StdRng::seed_from_u64(8);
        let identity = me(&mut rng);
        let store = MemoryBlobStore::new();

        let err = image(
            &mut rng,
            &identity,
            id("NOBODY00"),
            &MemoryDirectory::new(),
            &NoRemoteLookup,
            &b"pixels"[..],
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, ComposeError::Lookup(LookupError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn missing_blob_reported() {
        let store = MemoryBlobStore::new();
        let blob = SymmetricBlob {
            blob_id: [1; 16],
            size: 10,
            key: [2; 32],
        };
        assert!(matches!(
            fetch_symmetric_blob(&store, &blob),
            Err(ComposeError::Blob(BlobError::NotFound(_)))
        ));
    }
}
