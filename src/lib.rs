//! Nightdrop - forward-secure asynchronous messaging for a peer-to-peer chat network
//!
//! Two peers who are rarely online at the same time deliver messages to each
//! other through a small set of untrusted storage nodes. Storage nodes learn
//! neither participant's long-term identity nor which messages belong to the
//! same conversation, while the intended recipient can always retrieve and
//! decrypt its own traffic. Compromise of a long-term key never retroactively
//! decrypts prior messages.

pub mod error;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod epoch;
pub mod prekey;
pub mod forward;
pub mod obfuscation;
pub mod storage;
pub mod scheduler;
pub mod transport;
pub mod client;

// Re-export commonly used types
pub use error::{Error, Result};
pub use protocol::{MessageId, MessageKind, PeerId};
