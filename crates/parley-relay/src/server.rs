//! HTTP front end of the relay.
//!
//! One listener serves two routes: `GET /` upgrades to the signaling
//! WebSocket, `GET /hosts` returns the registered hosts as a JSON array.

use crate::error::{RelayError, Result};
use crate::relay::{Relay, RelayConfig};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use parley_proto::ServerData;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Relay bound to a TCP listener
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl RelayServer {
    /// Bind a relay with default configuration
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(bind_addr, RelayConfig::default()).await
    }

    /// Bind a relay with custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound.
    pub async fn bind_with_config(bind_addr: SocketAddr, config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            relay: Relay::with_config(config),
        })
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared relay state
    #[must_use]
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Serve until the listener fails
    ///
    /// # Errors
    ///
    /// Returns error if accepting connections fails.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if accepting connections fails.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Relay listening on {}", self.local_addr()?);
        axum::serve(self.listener, router(self.relay))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(RelayError::from)
    }
}

/// Build the relay's HTTP routes
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/hosts", get(hosts_handler))
        .with_state(relay)
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(relay, socket))
}

async fn hosts_handler(State(relay): State<Arc<Relay>>) -> Json<Vec<ServerData>> {
    Json(relay.hosts())
}

async fn handle_socket(relay: Arc<Relay>, socket: WebSocket) {
    let session = match relay.accept() {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Refusing connection: {e}");
            drop(socket);
            return;
        }
    };

    let alias = session.alias;
    let mut outbound = session.outbound;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(incoming) = stream.next().await {
        let result = match incoming {
            Ok(Message::Binary(frame)) => relay.handle_frame(&alias, &frame),
            Ok(Message::Text(_)) => Err(RelayError::NonBinaryFrame),
            Ok(Message::Ping(_) | Message::Pong(_)) => Ok(()),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(%alias, "WebSocket error: {e}");
                break;
            }
        };

        if let Err(e) = result {
            if e.is_fatal() {
                tracing::warn!(%alias, "Closing connection: {e}");
                break;
            }
            tracing::debug!(%alias, "Dropped message: {e}");
        }
    }

    relay.disconnect(&alias);
    writer.abort();
}
