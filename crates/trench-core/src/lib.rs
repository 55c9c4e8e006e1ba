//! trench-core: Shared signaling protocol library.
//!
//! Provides the JSON envelope types exchanged between clients and the
//! relay, client identifiers, peer-session state types, and the shared
//! error enum used by both sides.

pub mod envelope;
pub mod error;
pub mod peer;

// Re-export commonly used items at crate root.
pub use envelope::{ClientId, Envelope};
pub use error::{SignalError, SignalResult};
pub use peer::{LinkQuality, PeerRole, PeerState, RoomQuality};
