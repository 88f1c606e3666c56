//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::device::DeviceDriver;
use crate::gateway::connection::Connection;
use crate::gateway::devices::DeviceGateway;
use crate::protocol::{PushMessage, ServerMessage, PROTOCOL_VERSION, SUBPROTOCOL};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

/// Shared state for the gateway. Per-connection state lives in each socket task.
#[derive(Clone)]
struct GatewayState {
    config: Arc<Config>,
    /// Port actually bound (differs from config when binding port 0).
    port: u16,
    devices: DeviceGateway,
    /// Fired once on shutdown; every socket task tears down and exits.
    shutdown_tx: broadcast::Sender<()>,
    /// Never sent on. `serve` returns once every clone (one per socket task) is dropped.
    _connections: mpsc::Sender<()>,
}

/// Bind the configured address and serve until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config, driver: Arc<dyn DeviceDriver>) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!(
            "gateway bound to {} without authentication; every host that can reach it can open local serial ports",
            bind
        );
    }
    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    serve(listener, config, driver, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` completes.
pub async fn serve<F>(
    listener: TcpListener,
    config: Config,
    driver: Arc<dyn DeviceDriver>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context("reading listener address")?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let (connections_tx, mut connections_rx) = mpsc::channel::<()>(1);
    let state = GatewayState {
        config: Arc::new(config),
        port: local_addr.port(),
        devices: DeviceGateway::new(driver),
        shutdown_tx: shutdown_tx.clone(),
        _connections: connections_tx,
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    log::info!("gateway listening on {}", local_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        log::info!("shutdown signal received, closing client connections");
        let _ = shutdown_tx.send(());
    })
    .await
    .context("gateway server exited")?;
    // Upgraded sockets outlive the HTTP server; wait for their teardown.
    let _ = connections_rx.recv().await;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.port,
        "bind": state.config.gateway.bind,
        "subprotocol": SUBPROTOCOL,
    }))
}

/// GET /ws upgrades to WebSocket, offering the `serialport-net` sub-protocol.
async fn ws_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = message.to_json().map_err(axum::Error::new)?;
    log::trace!("sending {}", text);
    socket.send(Message::Text(text)).await
}

async fn handle_socket(mut socket: WebSocket, peer: SocketAddr, state: GatewayState) {
    if socket.protocol().is_none() {
        log::debug!("client {} did not request the {} sub-protocol", peer, SUBPROTOCOL);
    }
    log::info!("client connected: {}", peer);
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let (mut conn, mut events_rx) = Connection::new(peer.to_string(), state.devices.clone());

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            Some(event) = events_rx.recv() => {
                let Some(push) = conn.on_device_event(event) else { continue };
                if let Err(e) = send(&mut socket, &push).await {
                    log::error!("[{}] error sending device event: {}", peer, e);
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let reply = match msg {
                    Message::Text(text) => conn.handle_frame(&text).await,
                    Message::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => conn.handle_frame(&text).await,
                        Err(e) => ServerMessage::push(PushMessage::Error {
                            port: None,
                            message: format!("Error parsing JSON: {}", e),
                        }),
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                if let Err(e) = send(&mut socket, &reply).await {
                    log::error!("[{}] error sending response: {}", peer, e);
                    break;
                }
            }
        }
    }

    let open_ports = conn.open_ports();
    conn.teardown().await;
    log::info!(
        "client disconnected: {} (released {} port(s))",
        conn.peer(),
        open_ports.len()
    );
}
