//! Peer session table: one negotiation state machine per remote peer.
//!
//! The table owns every live [`MediaLink`] and is the only place a
//! link is created or closed, so release happens exactly once no
//! matter which path tears a session down. It never talks to the
//! network directly: outbound envelopes go onto a channel the
//! signaling client drains, and state changes surface as
//! [`SessionEvent`]s for the embedder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use trench_core::{ClientId, Envelope, LinkQuality, PeerRole, PeerState, RoomQuality};

use crate::capability::{LinkEvent, LinkEventKind, MediaEngine, MediaLink};

/// What the client reports to its embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server assigned us an id.
    Assigned(ClientId),
    /// A peer became known (roster or announcement).
    PeerJoined(ClientId),
    /// A peer left the room.
    PeerLeft(ClientId),
    /// A peer session changed state.
    PeerStateChanged { peer: ClientId, state: PeerState },
    /// The aggregate room quality changed.
    QualityChanged(RoomQuality),
    /// The signaling transport dropped.
    TransportDown,
    /// The signaling transport came back.
    Reconnected,
}

struct PeerSession {
    link: Option<Box<dyn MediaLink>>,
    state: PeerState,
    role: PeerRole,
    quality: Option<LinkQuality>,
    started: Instant,
}

impl PeerSession {
    fn new(link: Box<dyn MediaLink>, role: PeerRole, state: PeerState) -> Self {
        Self {
            link: Some(link),
            state,
            role,
            quality: None,
            started: Instant::now(),
        }
    }

    /// Quality used for aggregation: an explicit reading wins, else
    /// derive a placeholder from where negotiation stands.
    fn effective_quality(&self) -> LinkQuality {
        if let Some(quality) = self.quality {
            return quality;
        }
        match self.state {
            PeerState::Established => LinkQuality::Excellent,
            PeerState::Offering | PeerState::AnswerPending | PeerState::Negotiating => {
                LinkQuality::Good
            }
            PeerState::Idle => LinkQuality::Fair,
            PeerState::Closed | PeerState::Failed => LinkQuality::Poor,
        }
    }
}

pub struct PeerSessionTable {
    engine: Arc<dyn MediaEngine>,
    peers: HashMap<ClientId, PeerSession>,
    link_events: mpsc::Sender<LinkEvent>,
    outbound: mpsc::Sender<Envelope>,
    notifications: mpsc::Sender<SessionEvent>,
    negotiation_deadline: Duration,
    last_quality: RoomQuality,
}

impl PeerSessionTable {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        link_events: mpsc::Sender<LinkEvent>,
        outbound: mpsc::Sender<Envelope>,
        notifications: mpsc::Sender<SessionEvent>,
        negotiation_deadline: Duration,
    ) -> Self {
        Self {
            engine,
            peers: HashMap::new(),
            link_events,
            outbound,
            notifications,
            negotiation_deadline,
            last_quality: RoomQuality::Empty,
        }
    }

    /// Start an initiator session for `peer`. A no-op if a session
    /// already exists, so roster and announcement paths can both call
    /// it without double-creating links.
    pub async fn add_initiator(&mut self, peer: ClientId) {
        if self.peers.contains_key(&peer) {
            debug!(peer = %peer.short(), "session already exists");
            return;
        }

        let mut link = match self
            .engine
            .create_link(peer, self.link_events.clone())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "link creation failed");
                self.notify(SessionEvent::PeerStateChanged {
                    peer,
                    state: PeerState::Failed,
                })
                .await;
                return;
            }
        };

        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "offer failed");
                link.close().await;
                self.notify(SessionEvent::PeerStateChanged {
                    peer,
                    state: PeerState::Failed,
                })
                .await;
                return;
            }
        };

        self.peers.insert(
            peer,
            PeerSession::new(link, PeerRole::Initiator, PeerState::Offering),
        );
        debug!(peer = %peer.short(), "offering");
        self.transmit(Envelope::Offer {
            target: peer,
            offer,
            from: None,
        })
        .await;
        self.notify(SessionEvent::PeerStateChanged {
            peer,
            state: PeerState::Offering,
        })
        .await;
        self.notify_quality().await;
    }

    /// Answer a remote offer. Creates a responder session if none
    /// exists; an offer for a known peer is answered on the existing
    /// link rather than replacing it.
    pub async fn handle_offer(&mut self, peer: ClientId, offer: Value) {
        if !self.peers.contains_key(&peer) {
            let link = match self
                .engine
                .create_link(peer, self.link_events.clone())
                .await
            {
                Ok(link) => link,
                Err(e) => {
                    warn!(peer = %peer.short(), error = %e, "link creation failed");
                    self.notify(SessionEvent::PeerStateChanged {
                        peer,
                        state: PeerState::Failed,
                    })
                    .await;
                    return;
                }
            };
            self.peers.insert(
                peer,
                PeerSession::new(link, PeerRole::Responder, PeerState::AnswerPending),
            );
            self.notify(SessionEvent::PeerStateChanged {
                peer,
                state: PeerState::AnswerPending,
            })
            .await;
        }

        let result = {
            let Some(session) = self.peers.get_mut(&peer) else {
                return;
            };
            let Some(link) = session.link.as_mut() else {
                return;
            };
            link.create_answer(offer).await
        };

        match result {
            Ok(answer) => {
                debug!(peer = %peer.short(), "answering");
                self.transmit(Envelope::Answer {
                    target: peer,
                    answer,
                    from: None,
                })
                .await;
                self.set_state(peer, PeerState::Negotiating).await;
                self.notify_quality().await;
            }
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "answer failed");
                self.close_session(peer, PeerState::Failed).await;
            }
        }
    }

    /// Apply a remote answer to an offer we sent. Answers for peers we
    /// never offered to are ignored.
    pub async fn handle_answer(&mut self, peer: ClientId, answer: Value) {
        let result = {
            let Some(session) = self.peers.get_mut(&peer) else {
                debug!(peer = %peer.short(), "answer for unknown peer, ignoring");
                return;
            };
            if session.state != PeerState::Offering {
                debug!(peer = %peer.short(), state = ?session.state, "unexpected answer, ignoring");
                return;
            }
            let Some(link) = session.link.as_mut() else {
                return;
            };
            link.set_remote_description(answer).await
        };

        match result {
            Ok(()) => {
                self.set_state(peer, PeerState::Negotiating).await;
                self.notify_quality().await;
            }
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "applying answer failed");
                self.close_session(peer, PeerState::Failed).await;
            }
        }
    }

    /// Feed a remote transport candidate into the peer's link. A bad
    /// candidate is logged, not fatal; the link can survive it.
    pub async fn handle_candidate(&mut self, peer: ClientId, candidate: Value) {
        let Some(session) = self.peers.get_mut(&peer) else {
            debug!(peer = %peer.short(), "candidate for unknown peer, ignoring");
            return;
        };
        if session.state.is_terminal() {
            return;
        }
        let Some(link) = session.link.as_mut() else {
            return;
        };
        if let Err(e) = link.add_ice_candidate(candidate).await {
            warn!(peer = %peer.short(), error = %e, "candidate rejected");
        }
    }

    /// Apply one lifecycle event reported by a link.
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let peer = event.peer;
        match event.kind {
            LinkEventKind::Connected => {
                let established = match self.peers.get_mut(&peer) {
                    Some(session) if !session.state.is_terminal() => {
                        session.state = PeerState::Established;
                        session.quality.get_or_insert(LinkQuality::Excellent);
                        true
                    }
                    _ => false,
                };
                if established {
                    debug!(peer = %peer.short(), "established");
                    self.notify(SessionEvent::PeerStateChanged {
                        peer,
                        state: PeerState::Established,
                    })
                    .await;
                    self.notify_quality().await;
                }
            }
            LinkEventKind::Disconnected => {
                self.close_session(peer, PeerState::Closed).await;
            }
            LinkEventKind::Failed => {
                self.close_session(peer, PeerState::Failed).await;
            }
            LinkEventKind::Candidate(candidate) => {
                if self.peers.contains_key(&peer) {
                    self.transmit(Envelope::IceCandidate {
                        target: peer,
                        candidate,
                        from: None,
                    })
                    .await;
                }
            }
            LinkEventKind::Quality(quality) => {
                if let Some(session) = self.peers.get_mut(&peer) {
                    session.quality = Some(quality);
                }
                self.notify_quality().await;
            }
        }
    }

    /// The peer left the room; close its session.
    pub async fn remove_peer(&mut self, peer: ClientId) {
        self.close_session(peer, PeerState::Closed).await;
    }

    /// Close every session, releasing every link. Used when leaving
    /// the room or when the signaling transport is lost.
    pub async fn teardown_all(&mut self) {
        let peers: Vec<ClientId> = self.peers.keys().copied().collect();
        for peer in peers {
            self.close_session(peer, PeerState::Closed).await;
        }
    }

    /// Fail any session that has been negotiating longer than the
    /// deadline without establishing.
    pub async fn sweep_timeouts(&mut self) {
        let deadline = self.negotiation_deadline;
        let stalled: Vec<ClientId> = self
            .peers
            .iter()
            .filter(|(_, session)| {
                session.state.is_negotiating() && session.started.elapsed() >= deadline
            })
            .map(|(peer, _)| *peer)
            .collect();
        for peer in stalled {
            warn!(peer = %peer.short(), "negotiation timed out");
            self.close_session(peer, PeerState::Failed).await;
        }
    }

    pub fn state(&self, peer: ClientId) -> Option<PeerState> {
        self.peers.get(&peer).map(|session| session.state)
    }

    pub fn role(&self, peer: ClientId) -> Option<PeerRole> {
        self.peers.get(&peer).map(|session| session.role)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn room_quality(&self) -> RoomQuality {
        let links: Vec<LinkQuality> = self
            .peers
            .values()
            .map(PeerSession::effective_quality)
            .collect();
        RoomQuality::aggregate(&links)
    }

    /// Remove the session and release its link, then report the final
    /// state. The link leaves the map before `close` is awaited, so a
    /// second teardown path finds nothing to release.
    async fn close_session(&mut self, peer: ClientId, final_state: PeerState) {
        let Some(mut session) = self.peers.remove(&peer) else {
            return;
        };
        if let Some(mut link) = session.link.take() {
            link.close().await;
        }
        debug!(peer = %peer.short(), state = ?final_state, "session closed");
        self.notify(SessionEvent::PeerStateChanged {
            peer,
            state: final_state,
        })
        .await;
        self.notify_quality().await;
    }

    async fn set_state(&mut self, peer: ClientId, state: PeerState) {
        let changed = match self.peers.get_mut(&peer) {
            Some(session) if session.state != state => {
                session.state = state;
                true
            }
            _ => false,
        };
        if changed {
            self.notify(SessionEvent::PeerStateChanged { peer, state })
                .await;
        }
    }

    async fn notify_quality(&mut self) {
        let quality = self.room_quality();
        if quality != self.last_quality {
            self.last_quality = quality;
            self.notify(SessionEvent::QualityChanged(quality)).await;
        }
    }

    async fn transmit(&self, envelope: Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            debug!("outbound channel closed, dropping envelope");
        }
    }

    async fn notify(&self, event: SessionEvent) {
        if self.notifications.send(event).await.is_err() {
            debug!("notification channel closed, dropping event");
        }
    }
}
