//! Tessel client library.
//!
//! - [`directory`]: peer key lookup and the blob store contract
//! - [`compose`]: message factories, including blob upload and group fan-out
//! - [`session`]: the established connection to the server

#![forbid(unsafe_code)]

pub mod compose;
pub mod directory;
pub mod session;

pub use compose::ComposeError;
pub use directory::{
    BlobError, BlobRef, BlobStore, Contact, ContactDirectory, IdentityLookup, LookupError,
    MemoryBlobStore, MemoryDirectory, NoRemoteLookup,
};
pub use session::{InboundPacket, Session, SessionError};
