//! WebSocket listener using tokio-tungstenite.
//!
//! One connection per client, accepted on the service root. Each
//! connection gets a dedicated writer task draining its outbound
//! queue, so the per-transport send order is preserved end-to-end.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use trench_core::{Envelope, SignalError, SignalResult};

use crate::relay::RelayHandler;

/// Accept loop. Runs until the process is shut down.
pub async fn run(
    bind_addr: SocketAddr,
    relay: Arc<RelayHandler>,
    queue_depth: usize,
) -> SignalResult<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| SignalError::Transport(format!("bind failed: {e}")))?;

    info!(addr = %bind_addr, "signaling listener started");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let relay = relay.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws_stream) => {
                            handle_connection(ws_stream, addr, relay, queue_depth).await;
                        }
                        Err(e) => {
                            warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "TCP accept failed");
            }
        }
    }
}

/// Drive one client connection from registration to cleanup.
///
/// The close path runs exactly once whether the client disconnected,
/// the socket errored, or the server dropped the connection.
async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    relay: Arc<RelayHandler>,
    queue_depth: usize,
) {
    debug!(remote = %addr, "WebSocket connection accepted");

    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(queue_depth);

    let id = match relay.handle_connect(tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(remote = %addr, error = %e, "rejecting connection");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    // Single writer per connection. The channel closes when the
    // registry entry is dropped, which ends this task and the socket.
    let writer = tokio::spawn(async move {
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

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => relay.handle_frame(id, &text).await,
            Ok(Message::Close(_)) => break,
            // tungstenite answers pings internally
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(_) => debug!(id = %id.short(), "ignoring non-text frame"),
            Err(e) => {
                debug!(id = %id.short(), error = %e, "transport error, closing");
                break;
            }
        }
    }

    relay.handle_close(id).await;
    let _ = writer.await;
}
