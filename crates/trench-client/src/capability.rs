//! Media capability boundary.
//!
//! Negotiation logic never touches a concrete media implementation:
//! it talks to a [`MediaLink`] created by the embedder's
//! [`MediaEngine`]. Links report their lifecycle back through a shared
//! event channel so the session table can track state and quality.
//!
//! The trait methods return boxed futures rather than `async fn` so
//! the table can hold links as `Box<dyn MediaLink>`.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::mpsc;
use trench_core::{ClientId, LinkQuality, SignalResult};

/// Boxed future returned by the capability traits.
pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = SignalResult<T>> + Send + 'a>>;

/// Something a link reports about itself, tagged with the peer it
/// belongs to.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub peer: ClientId,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// Media is flowing; the session is established.
    Connected,
    /// The link closed from the far side or the media layer.
    Disconnected,
    /// The link gave up; the session has failed.
    Failed,
    /// A local transport candidate to forward to the peer.
    Candidate(Value),
    /// A fresh quality reading for this link.
    Quality(LinkQuality),
}

/// Factory for per-peer media links.
pub trait MediaEngine: Send + Sync {
    /// Create a link for `peer`. Lifecycle events must be reported on
    /// `events` until the link is closed.
    fn create_link(
        &self,
        peer: ClientId,
        events: mpsc::Sender<LinkEvent>,
    ) -> LinkFuture<'_, Box<dyn MediaLink>>;
}

/// One negotiable media connection to a single peer.
///
/// Descriptions and candidates are opaque JSON blobs; this crate only
/// carries them, the media layer interprets them. Links live inside
/// the session table, which is held across awaits in a spawned task,
/// so they must be `Send + Sync`.
pub trait MediaLink: Send + Sync {
    /// Produce a local session description to send as an offer.
    fn create_offer(&mut self) -> LinkFuture<'_, Value>;

    /// Apply the remote offer and produce the answering description.
    fn create_answer(&mut self, remote_offer: Value) -> LinkFuture<'_, Value>;

    /// Apply the remote answer to a previously sent offer.
    fn set_remote_description(&mut self, description: Value) -> LinkFuture<'_, ()>;

    /// Feed a remote transport candidate into the link.
    fn add_ice_candidate(&mut self, candidate: Value) -> LinkFuture<'_, ()>;

    /// Release the link and its media resources. Called exactly once.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
