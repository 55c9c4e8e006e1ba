//! Reconnecting signaling client.
//!
//! All state lives in a single task driving a `select!` loop over the
//! WebSocket, the command channel, link events, and the outbound
//! queue. Sends while the transport is down are dropped silently,
//! matching the relay's own best-effort delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use trench_core::{ClientId, Envelope, SignalError, SignalResult};

use crate::capability::{LinkEvent, MediaEngine};
use crate::session::{PeerSessionTable, SessionEvent};

/// How long to wait before reconnecting after the transport drops.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Signaling server URL, e.g. `ws://127.0.0.1:3000`.
    pub url: String,
    pub reconnect_delay: Duration,
    /// How long a session may negotiate before it is failed.
    pub negotiation_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000".to_string(),
            reconnect_delay: RECONNECT_DELAY,
            negotiation_timeout: Duration::from_secs(30),
            queue_depth: 64,
        }
    }
}

#[derive(Debug)]
enum Command {
    Join,
    Leave,
    Shutdown,
}

/// Handle to a running signaling client task.
pub struct SignalingClient {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Connect to the signaling server and start the client task.
    /// Session events arrive on the returned receiver.
    pub async fn connect(
        config: ClientConfig,
        engine: Arc<dyn MediaEngine>,
    ) -> SignalResult<(Self, mpsc::Receiver<SessionEvent>)> {
        let (notify_tx, notify_rx) = mpsc::channel(256);
        let (link_tx, link_rx) = mpsc::channel(256);
        let (uplink_tx, uplink_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let table = PeerSessionTable::new(
            engine,
            link_tx,
            uplink_tx,
            notify_tx.clone(),
            config.negotiation_timeout,
        );

        let mut task = ClientTask {
            config,
            table,
            my_id: None,
            joined: false,
            known: HashSet::new(),
            ws_rx: None,
            out_tx: None,
            reconnect_at: None,
            link_rx,
            uplink_rx,
            notify: notify_tx,
            commands: cmd_rx,
        };
        task.open_transport().await?;

        let task = tokio::spawn(task.run());
        Ok((
            Self {
                commands: cmd_tx,
                task,
            },
            notify_rx,
        ))
    }

    /// Join the voice room: start sessions with every known peer and
    /// keep the transport alive with automatic reconnects.
    pub async fn join(&self) -> SignalResult<()> {
        self.send(Command::Join).await
    }

    /// Leave the room: tear down every session and release the
    /// signaling transport. The next `join` reconnects.
    pub async fn leave(&self) -> SignalResult<()> {
        self.send(Command::Leave).await
    }

    /// Stop the client task, releasing all sessions.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.task.await;
    }

    async fn send(&self, command: Command) -> SignalResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SignalError::Transport("client task stopped".into()))
    }
}

struct ClientTask {
    config: ClientConfig,
    table: PeerSessionTable,
    my_id: Option<ClientId>,
    joined: bool,
    known: HashSet<ClientId>,
    ws_rx: Option<SplitStream<WsStream>>,
    out_tx: Option<mpsc::Sender<Envelope>>,
    reconnect_at: Option<Instant>,
    link_rx: mpsc::Receiver<LinkEvent>,
    uplink_rx: mpsc::Receiver<Envelope>,
    notify: mpsc::Sender<SessionEvent>,
    commands: mpsc::Receiver<Command>,
}

impl ClientTask {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Join) => self.handle_join().await,
                        Some(Command::Leave) => self.handle_leave().await,
                        Some(Command::Shutdown) | None => break,
                    }
                }
                Some(event) = self.link_rx.recv() => {
                    self.table.handle_link_event(event).await;
                }
                Some(envelope) = self.uplink_rx.recv() => {
                    self.transmit(envelope).await;
                }
                frame = next_frame(&mut self.ws_rx) => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(Message::Close(_))) | None => self.transport_lost().await,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "transport error");
                            self.transport_lost().await;
                        }
                    }
                }
                _ = reconnect_timer(self.reconnect_at) => {
                    self.reconnect().await;
                }
                _ = sweep.tick() => {
                    self.table.sweep_timeouts().await;
                }
            }
        }

        self.table.teardown_all().await;
    }

    async fn open_transport(&mut self) -> SignalResult<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| SignalError::Transport(e.to_string()))?;
        let (mut sink, stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Envelope>(self.config.queue_depth);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.ws_rx = Some(stream);
        self.out_tx = Some(tx);
        self.reconnect_at = None;
        info!(url = %self.config.url, "connected to signaling server");
        Ok(())
    }

    /// The transport dropped: forget everything the server told us and
    /// release every session. Server-assigned state is only valid for
    /// one connection. Reconnection is scheduled only while joined.
    async fn transport_lost(&mut self) {
        if self.ws_rx.is_none() {
            return;
        }
        self.ws_rx = None;
        self.out_tx = None;
        self.my_id = None;
        self.known.clear();
        self.table.teardown_all().await;
        let _ = self.notify.send(SessionEvent::TransportDown).await;

        if self.joined {
            info!(delay = ?self.config.reconnect_delay, "transport lost, will reconnect");
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        } else {
            info!("transport lost");
        }
    }

    async fn reconnect(&mut self) {
        self.reconnect_at = None;
        match self.open_transport().await {
            Ok(()) => {
                let _ = self.notify.send(SessionEvent::Reconnected).await;
            }
            Err(e) => {
                warn!(error = %e, "reconnect failed, retrying");
                self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
            }
        }
    }

    async fn handle_join(&mut self) {
        if self.joined {
            return;
        }
        self.joined = true;
        info!("joining voice room");

        if self.ws_rx.is_none() && self.reconnect_at.is_none() {
            self.reconnect().await;
        }

        let peers: Vec<ClientId> = self.known.iter().copied().collect();
        for peer in peers {
            self.table.add_initiator(peer).await;
        }
    }

    async fn handle_leave(&mut self) {
        if !self.joined {
            return;
        }
        self.joined = false;
        self.reconnect_at = None;
        info!("leaving voice room");
        self.table.teardown_all().await;
        // Release the transport so the server unregisters us and
        // broadcasts our departure; joined is already false, so no
        // reconnect is scheduled.
        self.transport_lost().await;
    }

    async fn handle_frame(&mut self, raw: &str) {
        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };

        match envelope {
            Envelope::YourId { id } => {
                debug!(id = %id.short(), "assigned id");
                self.my_id = Some(id);
                let _ = self.notify.send(SessionEvent::Assigned(id)).await;
            }
            Envelope::ExistingClients { clients } => {
                for peer in clients {
                    self.learn_peer(peer).await;
                }
            }
            Envelope::NewClient { id } => {
                self.learn_peer(id).await;
            }
            Envelope::ClientLeft { id } => {
                self.known.remove(&id);
                self.table.remove_peer(id).await;
                let _ = self.notify.send(SessionEvent::PeerLeft(id)).await;
            }
            Envelope::Offer { offer, from, .. } => {
                let Some(from) = self.relayed_sender(from) else {
                    return;
                };
                self.table.handle_offer(from, offer).await;
            }
            Envelope::Answer { answer, from, .. } => {
                let Some(from) = self.relayed_sender(from) else {
                    return;
                };
                self.table.handle_answer(from, answer).await;
            }
            Envelope::IceCandidate { candidate, from, .. } => {
                let Some(from) = self.relayed_sender(from) else {
                    return;
                };
                self.table.handle_candidate(from, candidate).await;
            }
        }
    }

    /// Directed envelopes are only processed while joined, and only
    /// when the relay stamped a sender on them.
    fn relayed_sender(&self, from: Option<ClientId>) -> Option<ClientId> {
        if !self.joined {
            return None;
        }
        if from.is_none() {
            warn!("dropping directed envelope without sender");
        }
        from
    }

    async fn learn_peer(&mut self, peer: ClientId) {
        if Some(peer) == self.my_id {
            return;
        }
        if self.known.insert(peer) {
            debug!(peer = %peer.short(), "peer known");
            let _ = self.notify.send(SessionEvent::PeerJoined(peer)).await;
        }
        if self.joined {
            self.table.add_initiator(peer).await;
        }
    }

    async fn transmit(&mut self, envelope: Envelope) {
        let Some(out) = &self.out_tx else {
            debug!("transport closed, dropping outbound envelope");
            return;
        };
        if out.send(envelope).await.is_err() {
            debug!("writer gone, dropping outbound envelope");
            self.out_tx = None;
        }
    }
}

async fn next_frame(
    ws: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match ws {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
