//! Key/value persistence used to survive restarts.
//!
//! The session engine stores the encoded wire form of every packet it must be
//! able to resend, under keys built from a role prefix and the packet id:
//!
//! | prefix | content                                        |
//! |--------|------------------------------------------------|
//! | `s-`   | outbound QoS 1/2 PUBLISH awaiting its ack       |
//! | `sc-`  | outbound PUBREL awaiting PUBCOMP                |
//! | `r-`   | inbound QoS 2 PUBLISH awaiting PUBREL           |
//! | `sb-`  | offline-buffered PUBLISH, keyed by sequence     |

mod file;
mod memory;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

use thiserror::Error;

pub const SENT_PREFIX: &str = "s-";
pub const SENT_PUBREL_PREFIX: &str = "sc-";
pub const RECEIVED_PREFIX: &str = "r-";
pub const BUFFERED_PREFIX: &str = "sb-";

pub fn sent_key(packet_id: u16) -> String {
    format!("{}{}", SENT_PREFIX, packet_id)
}

pub fn sent_pubrel_key(packet_id: u16) -> String {
    format!("{}{}", SENT_PUBREL_PREFIX, packet_id)
}

pub fn received_key(packet_id: u16) -> String {
    format!("{}{}", RECEIVED_PREFIX, packet_id)
}

pub fn buffered_key(sequence: u64) -> String {
    format!("{}{}", BUFFERED_PREFIX, sequence)
}

/// Role of a persisted record, recovered from its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistedKey {
    Sent(u16),
    SentPubRel(u16),
    Received(u16),
    Buffered(u64),
}

impl PersistedKey {
    pub fn parse(key: &str) -> Option<PersistedKey> {
        if let Some(rest) = key.strip_prefix(BUFFERED_PREFIX) {
            return rest.parse().ok().map(PersistedKey::Buffered);
        }
        if let Some(rest) = key.strip_prefix(SENT_PUBREL_PREFIX) {
            return parse_id(rest).map(PersistedKey::SentPubRel);
        }
        if let Some(rest) = key.strip_prefix(SENT_PREFIX) {
            return parse_id(rest).map(PersistedKey::Sent);
        }
        if let Some(rest) = key.strip_prefix(RECEIVED_PREFIX) {
            return parse_id(rest).map(PersistedKey::Received);
        }
        None
    }
}

fn parse_id(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|id| *id != 0)
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt persisted record '{key}'")]
    Corrupt { key: String },

    #[error("persistence store is not open")]
    NotOpen,

    #[error("persistence store has been closed")]
    Closed,
}

/// Durable key/value store. Implementations must be safe to call from the
/// sender, receiver and application threads concurrently.
pub trait MqttClientPersistence: Send + Sync {
    /// Prepares storage for one client connection.
    fn open(&self, client_id: &str, server_uri: &str) -> Result<(), PersistenceError>;

    fn close(&self) -> Result<(), PersistenceError>;

    fn put(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError>;

    /// Returns `Ok(None)` if the key is not present.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;

    fn contains_key(&self, key: &str) -> Result<bool, PersistenceError>;

    fn keys(&self) -> Result<Vec<String>, PersistenceError>;

    fn clear(&self) -> Result<(), PersistenceError>;
}
