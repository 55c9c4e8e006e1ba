//! Relay protocol handler: greets new clients and forwards directed
//! negotiation envelopes between them.
//!
//! The handler is transport-independent; the WebSocket layer hands it
//! an outbound queue per connection and feeds it raw text frames.
//! Every failure here is per-connection: a malformed frame, a departed
//! target, or one client's full queue never affects anyone else.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trench_core::{ClientId, Envelope, SignalResult};

use crate::registry::ConnectionRegistry;

pub struct RelayHandler {
    registry: Arc<ConnectionRegistry>,
}

impl RelayHandler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Admit a new connection: assign a fresh id, register the
    /// outbound handle, greet the client with its own id and the
    /// current roster, then announce it to everyone else.
    ///
    /// The client must learn its own id before any message mentioning
    /// it is relayed, so the greeting goes onto the queue before the
    /// broadcast. An empty roster is skipped entirely, not sent empty.
    pub async fn handle_connect(
        &self,
        handle: mpsc::Sender<Envelope>,
    ) -> SignalResult<ClientId> {
        let id = ClientId::random();
        self.registry.register(id, handle.clone()).await?;

        self.push(&handle, id, Envelope::YourId { id });

        let roster = self.registry.other_ids(id).await;
        if !roster.is_empty() {
            self.push(&handle, id, Envelope::ExistingClients { clients: roster });
        }

        self.broadcast_from(id, Envelope::NewClient { id }).await;

        let total = self.registry.count().await;
        info!(id = %id.short(), total = total, "client connected");
        Ok(id)
    }

    /// Handle one raw text frame from a connected client.
    ///
    /// Only the three directed negotiation types are relayed, and
    /// `from` is always overwritten with the sender's authoritative
    /// id. Anything else is dropped and logged; no inbound frame is
    /// ever fatal to the connection.
    pub async fn handle_frame(&self, sender: ClientId, raw: &str) {
        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(from = %sender.short(), error = %e, "dropping malformed envelope");
                return;
            }
        };

        let Some(target) = envelope.target() else {
            warn!(from = %sender.short(), "dropping non-relayable envelope");
            return;
        };

        match self.registry.lookup(target).await {
            Some(handle) => {
                if let Err(e) = handle.try_send(envelope.stamp_from(sender)) {
                    // Full or closed, either way the target's problem
                    // must not stall the sender's connection.
                    debug!(target = %target.short(), error = %e, "target queue unavailable, dropping");
                }
            }
            None => {
                // Expected race: the peer departed while the message
                // was in flight. Not an error to the sender.
                debug!(
                    from = %sender.short(),
                    target = %target.short(),
                    "target not registered, dropping"
                );
            }
        }
    }

    /// Tear down a departed connection and tell the remaining clients.
    ///
    /// Safe to call for an id that was already unregistered: the
    /// departure is only broadcast when this call actually removed it.
    pub async fn handle_close(&self, id: ClientId) {
        if !self.registry.unregister(id).await {
            return;
        }
        self.broadcast_from(id, Envelope::ClientLeft { id }).await;
        let total = self.registry.count().await;
        info!(id = %id.short(), total = total, "client disconnected");
    }

    /// Queue an envelope for one client without waiting: a recipient
    /// whose queue is full or closed loses the message, it never
    /// stalls the caller.
    fn push(&self, handle: &mpsc::Sender<Envelope>, id: ClientId, envelope: Envelope) {
        if let Err(e) = handle.try_send(envelope) {
            debug!(id = %id.short(), error = %e, "outbound queue unavailable, dropping");
        }
    }

    /// Send to every registered client except `sender`, best effort
    /// per recipient.
    async fn broadcast_from(&self, sender: ClientId, envelope: Envelope) {
        for (id, handle) in self.registry.other_handles(sender).await {
            self.push(&handle, id, envelope.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relay() -> RelayHandler {
        RelayHandler::new(Arc::new(ConnectionRegistry::new()))
    }

    async fn connect(relay: &RelayHandler) -> (ClientId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        let id = relay.handle_connect(tx).await.unwrap();
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Envelope>) {
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn connect_greets_in_order() {
        let relay = relay();

        let (a, mut rx_a) = connect(&relay).await;
        match rx_a.recv().await {
            Some(Envelope::YourId { id }) => assert_eq!(id, a),
            other => panic!("expected your-id, got {other:?}"),
        }
        // alone in the room: no roster envelope at all
        assert!(rx_a.try_recv().is_err());

        let (b, mut rx_b) = connect(&relay).await;
        match rx_b.recv().await {
            Some(Envelope::YourId { id }) => assert_eq!(id, b),
            other => panic!("expected your-id, got {other:?}"),
        }
        match rx_b.recv().await {
            Some(Envelope::ExistingClients { clients }) => assert_eq!(clients, vec![a]),
            other => panic!("expected roster, got {other:?}"),
        }
        match rx_a.recv().await {
            Some(Envelope::NewClient { id }) => assert_eq!(id, b),
            other => panic!("expected new-client, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn directed_relay_stamps_authoritative_sender() {
        let relay = relay();
        let (a, mut rx_a) = connect(&relay).await;
        let (b, mut rx_b) = connect(&relay).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        // b claims to be someone else; the relay must not believe it
        let mallory = ClientId::random();
        let raw = Envelope::Offer {
            target: a,
            offer: json!({"sdp": "v=0"}),
            from: Some(mallory),
        }
        .to_json()
        .unwrap();
        relay.handle_frame(b, &raw).await;

        match rx_a.recv().await {
            Some(Envelope::Offer { target, from, .. }) => {
                assert_eq!(target, a);
                assert_eq!(from, Some(b));
            }
            other => panic!("expected offer, got {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_target_is_silently_dropped() {
        let relay = relay();
        let (a, mut rx_a) = connect(&relay).await;
        let (b, mut rx_b) = connect(&relay).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let raw = Envelope::Answer {
            target: ClientId::random(),
            answer: json!({"sdp": "v=0"}),
            from: None,
        }
        .to_json()
        .unwrap();
        relay.handle_frame(b, &raw).await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_does_not_poison_the_connection() {
        let relay = relay();
        let (a, mut rx_a) = connect(&relay).await;
        let (b, mut rx_b) = connect(&relay).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.handle_frame(b, "{definitely not json").await;
        // membership types from a client are not relayable either
        let raw = Envelope::YourId { id: b }.to_json().unwrap();
        relay.handle_frame(b, &raw).await;
        assert!(rx_a.try_recv().is_err());

        // the same connection still relays fine afterwards
        let raw = Envelope::IceCandidate {
            target: a,
            candidate: json!({"candidate": "candidate:0"}),
            from: None,
        }
        .to_json()
        .unwrap();
        relay.handle_frame(b, &raw).await;
        assert!(matches!(
            rx_a.recv().await,
            Some(Envelope::IceCandidate { .. })
        ));
    }

    #[tokio::test]
    async fn close_broadcasts_departure_exactly_once() {
        let relay = relay();
        let (_a, mut rx_a) = connect(&relay).await;
        let (b, mut rx_b) = connect(&relay).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.handle_close(b).await;
        match rx_a.recv().await {
            Some(Envelope::ClientLeft { id }) => assert_eq!(id, b),
            other => panic!("expected client-left, got {other:?}"),
        }

        // second close for the same id is a no-op
        relay.handle_close(b).await;
        assert!(rx_a.try_recv().is_err());
        assert_eq!(relay.registry().count().await, 1);
    }

    #[tokio::test]
    async fn full_queue_never_blocks_other_clients() {
        let relay = relay();

        // depth-1 queue: the greeting fills it and nothing drains it
        let (tx_a, mut rx_a) = mpsc::channel(1);
        let a = relay.handle_connect(tx_a).await.unwrap();

        let (tx_b, mut rx_b) = mpsc::channel(16);
        let b = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            relay.handle_connect(tx_b),
        )
        .await
        .expect("connect stalled behind a slow client")
        .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), relay.handle_close(b))
            .await
            .expect("close stalled behind a slow client");

        // b was greeted normally
        assert!(matches!(rx_b.recv().await, Some(Envelope::YourId { .. })));
        match rx_b.recv().await {
            Some(Envelope::ExistingClients { clients }) => assert_eq!(clients, vec![a]),
            other => panic!("expected roster, got {other:?}"),
        }

        // the stalled client only ever saw its greeting; both
        // broadcasts were dropped rather than queued behind it
        assert!(matches!(rx_a.try_recv(), Ok(Envelope::YourId { .. })));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_to_departed_target_is_dropped() {
        let relay = relay();
        let (a, mut rx_a) = connect(&relay).await;
        let (b, _rx_b) = connect(&relay).await;
        drain(&mut rx_a);

        relay.handle_close(b).await;
        drain(&mut rx_a);

        let raw = Envelope::Offer {
            target: b,
            offer: json!({"sdp": "v=0"}),
            from: None,
        }
        .to_json()
        .unwrap();
        relay.handle_frame(a, &raw).await;
        assert!(rx_a.try_recv().is_err());
    }
}
