//! Collaborators the client consumes: peer keys and blob storage.
//!
//! All of these are synchronous. A remote directory or blob service plugs in
//! behind the traits; the in-memory versions serve tests and the CLI.

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use tessel_core::{BlobId, IdString};
use tessel_crypto::PublicKey;
use thiserror::Error;
use tracing::debug;

/// A peer with its long-term public key.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: IdString,
    pub public_key: PublicKey,
    pub nickname: Option<String>,
}

impl Contact {
    pub fn new(id: IdString, public_key: PublicKey) -> Self {
        Self {
            id,
            public_key,
            nickname: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no public key known for {0}")]
    NotFound(IdString),

    #[error("identity directory unavailable: {0}")]
    Unavailable(String),
}

/// Local contact store.
pub trait ContactDirectory: Send + Sync {
    fn get(&self, id: &IdString) -> Option<Contact>;
    fn add(&self, contact: Contact);
}

/// Remote identity directory.
pub trait IdentityLookup: Send + Sync {
    fn fetch_by_identity(&self, id: &IdString) -> Result<Contact, LookupError>;
}

/// Find a peer's key locally, falling back to the remote directory.
///
/// Keys fetched remotely are cached in `directory`.
pub fn resolve_public_key(
    directory: &dyn ContactDirectory,
    lookup: &dyn IdentityLookup,
    id: &IdString,
) -> Result<PublicKey, LookupError> {
    if let Some(contact) = directory.get(id) {
        return Ok(contact.public_key);
    }
    let contact = lookup.fetch_by_identity(id)?;
    if contact.id != *id {
        return Err(LookupError::NotFound(*id));
    }
    debug!(identity = %id, "cached remotely fetched public key");
    let public_key = contact.public_key.clone();
    directory.add(contact);
    Ok(public_key)
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    contacts: RwLock<HashMap<IdString, Contact>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contacts(contacts: impl IntoIterator<Item = Contact>) -> Self {
        let directory = Self::new();
        for contact in contacts {
            directory.add(contact);
        }
        directory
    }

    pub fn len(&self) -> usize {
        self.contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContactDirectory for MemoryDirectory {
    fn get(&self, id: &IdString) -> Option<Contact> {
        self.contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn add(&self, contact: Contact) {
        self.contacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(contact.id, contact);
    }
}

/// Lookup that never finds anyone, for offline use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemoteLookup;

impl IdentityLookup for NoRemoteLookup {
    fn fetch_by_identity(&self, id: &IdString) -> Result<Contact, LookupError> {
        Err(LookupError::NotFound(*id))
    }
}

/// Where an uploaded blob can be fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRef {
    pub blob_id: BlobId,
    pub server_shard: u8,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob {0} not found")]
    NotFound(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("blob of {0} bytes exceeds the 32-bit size field")]
    TooLarge(usize),
}

/// Storage for encrypted media blobs.
pub trait BlobStore: Send + Sync {
    fn upload_encrypted(&self, ciphertext: &[u8]) -> Result<BlobRef, BlobError>;
    fn download_encrypted(&self, blob_id: &BlobId) -> Result<Vec<u8>, BlobError>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobId, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn upload_encrypted(&self, ciphertext: &[u8]) -> Result<BlobRef, BlobError> {
        let mut blob_id = BlobId::default();
        OsRng.fill_bytes(&mut blob_id);
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(blob_id, ciphertext.to_vec());
        Ok(BlobRef {
            blob_id,
            server_shard: blob_id[0],
        })
    }

    fn download_encrypted(&self, blob_id: &BlobId) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(blob_id)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(hex::encode(blob_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessel_crypto::KeyPair;

    fn key(seed: u64) -> PublicKey {
        KeyPair::generate(&mut StdRng::seed_from_u64(seed)).public().clone()
    }

    fn id(s: &str) -> IdString {
        IdString::parse(s).unwrap()
    }

    struct CountingLookup {
        calls: AtomicUsize,
        key: PublicKey,
    }

    impl IdentityLookup for CountingLookup {
        fn fetch_by_identity(&self, id: &IdString) -> Result<Contact, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Contact::new(*id, self.key.clone()))
        }
    }

    #[test]
    fn local_contact_wins() {
        let directory = MemoryDirectory::with_contacts([Contact::new(id("ECHOECHO"), key(1))]);
        let found = resolve_public_key(&directory, &NoRemoteLookup, &id("ECHOECHO")).unwrap();
        assert_eq!(found.as_bytes(), key(1).as_bytes());
    }

    #[test]
    fn remote_lookup_is_cached() {
        let directory = MemoryDirectory::new();
        let lookup = CountingLookup {
            calls: AtomicUsize::new(0),
            key: key(2),
        };

        for _ in 0..3 {
            let found = resolve_public_key(&directory, &lookup, &id("TESTTEST")).unwrap();
            assert_eq!(found.as_bytes(), key(2).as_bytes());
        }
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn unknown_identity_fails() {
        let directory = MemoryDirectory::new();
        assert!(matches!(
            resolve_public_key(&directory, &NoRemoteLookup, &id("NOBODY00")),
            Err(LookupError::NotFound(_))
        ));
        assert!(directory.is_empty());
    }

    #[test]
    fn blob_store_round_trip() {
        let store = MemoryBlobStore::new();
        let blob = store.upload_encrypted(b"ciphertext").unwrap();
        assert_eq!(blob.server_shard, blob.blob_id[0]);
        assert_eq!(store.download_encrypted(&blob.blob_id).unwrap(), b"ciphertext");
        assert!(matches!(
            store.download_encrypted(&[0u8; 16]),
            Err(BlobError::NotFound(_))
        ));
    }
}
