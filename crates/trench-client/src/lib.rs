//! Client side of the trench signaling protocol: a reconnecting
//! WebSocket client plus a table of per-peer negotiation sessions.
//!
//! The media layer itself is pluggable: embedders supply a
//! [`MediaEngine`] that creates per-peer [`MediaLink`]s, and this crate
//! drives negotiation over them according to the relayed envelopes.

pub mod capability;
pub mod client;
pub mod session;

pub use capability::{LinkEvent, LinkEventKind, MediaEngine, MediaLink};
pub use client::{ClientConfig, SignalingClient, RECONNECT_DELAY};
pub use session::{PeerSessionTable, SessionEvent};
