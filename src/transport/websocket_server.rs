//! Server-side WebSocket transport built on Axum
//!
//! Accepts WebSocket connections at the configured endpoint, assigns each
//! one a connection id, and turns socket activity into
//! [`ConnectionEvent`]s on a single channel. The dispatcher drains that
//! channel in one task, so message handling stays serialized no matter how
//! many sockets are live.

use axum::{
    Extension,
    Router,
    extract::ws::{ Message as WsMessage, WebSocket, WebSocketUpgrade },
    response::IntoResponse,
    routing::get,
};
use futures_util::{ SinkExt, StreamExt };
use http::HeaderValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{ mpsc, oneshot };
use tower_http::cors::{ Any, CorsLayer };

use crate::dispatcher::{ ConnectionEvent, Dispatcher };
use crate::errors::{ Error, Result };
use crate::registry::{ ConnectionId, ConnectionRegistry };
use crate::storage::Storage;

/// Maximum number of concurrent clients
const MAX_CLIENTS: usize = 100;

/// Configuration options for the WebSocket sync server
#[derive(Debug, Clone)]
pub struct WebSocketServerOptions {
    /// Address to bind the server to
    pub bind_address: SocketAddr,
    /// Path for the WebSocket endpoint
    pub websocket_path: String,
    /// CORS allowed origins; `None` is permissive
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for WebSocketServerOptions {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 9000)),
            websocket_path: "/ws".to_string(),
            allowed_origins: None,
        }
    }
}

/// Shared state handed to the connection handlers
#[derive(Clone)]
struct AppState {
    registry: ConnectionRegistry,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

/// The WebSocket synchronization server
///
/// Owns the connection registry, spawns the dispatch loop over the given
/// storage collaborator, and serves the WebSocket endpoint.
pub struct WebSocketSyncServer {
    options: WebSocketServerOptions,
    registry: ConnectionRegistry,
    storage: Arc<dyn Storage>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
    dispatch_handle: Option<tokio::task::JoinHandle<()>>,
    running: bool,
}

impl WebSocketSyncServer {
    /// Create a server with default options
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_options(storage, WebSocketServerOptions::default())
    }

    /// Create a server with the specified options
    pub fn with_options(storage: Arc<dyn Storage>, options: WebSocketServerOptions) -> Self {
        Self {
            options,
            registry: ConnectionRegistry::new(),
            storage,
            shutdown_tx: None,
            server_handle: None,
            dispatch_handle: None,
            running: false,
        }
    }

    /// The address clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.options.bind_address, self.options.websocket_path)
    }

    /// Number of currently connected clients
    pub fn connected_clients(&self) -> usize {
        self.registry.len()
    }

    /// Bind the listener and start accepting connections
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::Transport("sync server already running".to_string()));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Single dispatch loop: one inbound message is fully handled
        // before the next one is taken
        let dispatcher = Dispatcher::new(self.registry.clone(), self.storage.clone());
        let dispatch_handle = tokio::spawn(async move {
            dispatcher.run(event_rx).await;
        });

        let app_state = AppState {
            registry: self.registry.clone(),
            event_tx,
        };

        let cors = match &self.options.allowed_origins {
            Some(origins) => {
                let mut layer = CorsLayer::new();
                for origin in origins {
                    let value = origin
                        .parse::<HeaderValue>()
                        .map_err(|e| Error::Transport(format!("bad origin {}: {}", origin, e)))?;
                    layer = layer.allow_origin(value);
                }
                layer.allow_methods(Any).allow_headers(Any).max_age(Duration::from_secs(86400))
            }
            None => CorsLayer::permissive(),
        };

        let app = Router::new()
            .route(&self.options.websocket_path, get(ws_handler))
            .layer(Extension(app_state))
            .layer(cors);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let listener = tokio::net::TcpListener::bind(&self.options.bind_address).await?;
        tracing::info!("listening on {}", self.options.bind_address);

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("sync server shutting down");
                })
                .await
                .unwrap_or_else(|e| {
                    tracing::error!("server error: {}", e);
                });
        });

        self.server_handle = Some(server_handle);
        self.dispatch_handle = Some(dispatch_handle);
        self.running = true;
        tracing::info!("sync server started at {}", self.url());

        Ok(())
    }

    /// Stop accepting connections and drain the dispatch loop
    pub async fn shutdown(&mut self) {
        if !self.running {
            return;
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        // The dispatch loop ends once every event sender is gone
        if let Some(handle) = self.dispatch_handle.take() {
            let _ = handle.await;
        }

        self.running = false;
        tracing::info!("sync server stopped");
    }
}

/// WebSocket connection handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one WebSocket connection until it closes
async fn handle_socket(socket: WebSocket, state: AppState) {
    if state.registry.len() >= MAX_CLIENTS {
        tracing::warn!("maximum client connections reached, refusing socket");
        return;
    }

    let id = ConnectionId::new();
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<String>();

    if state.event_tx.send(ConnectionEvent::Connected { id, sink: sink_tx }).is_err() {
        // dispatch loop is gone, nothing to serve
        return;
    }
    tracing::info!(%id, "websocket client connected");

    // Ensure the dispatcher learns about the teardown however this
    // function exits
    let event_tx = state.event_tx.clone();
    let _teardown = scopeguard::guard((), move |_| {
        let _ = event_tx.send(ConnectionEvent::Disconnected { id });
        tracing::info!(%id, "websocket client disconnected");
    });

    let (mut sender_socket, mut receiver_socket) = socket.split();

    // Writer: drain the connection's sink into the socket
    let send_task = tokio::spawn(async move {
        while let Some(text) = sink_rx.recv().await {
            if sender_socket.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: forward inbound text frames to the dispatcher
    let event_tx = state.event_tx.clone();
    let receive_task = tokio::spawn(async move {
        while let Some(result) = receiver_socket.next().await {
            match result {
                Ok(WsMessage::Text(text)) => {
                    if
                        event_tx
                            .send(ConnectionEvent::Message { id, text: text.to_string() })
                            .is_err()
                    {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    break;
                }
                // Ping/pong are handled by axum, binary frames are not
                // part of this protocol
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(%id, "websocket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = receive_task => {}
        _ = send_task => {}
    }
}
