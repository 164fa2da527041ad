//! WebSocket endpoint for browser clients.
//!
//! Accepts upgrades on `/ws` and hands the connection to the hub; any
//! other path is refused with a close frame. Routing and shutdown follow
//! the accept-loop shape used throughout the codebase.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::hub::Hub;

pub struct GatewayWsServer {
    listen_addr: String,
    hub: Arc<Hub>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Ws,
    Invalid,
}

fn parse_route(path: &str) -> Route {
    if path == "/ws" {
        Route::Ws
    } else {
        Route::Invalid
    }
}

fn close_frame(code: u16, reason: impl Into<String>) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into().into(),
    }
}

impl GatewayWsServer {
    pub fn new(listen_addr: impl Into<String>, hub: Arc<Hub>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            hub,
            shutdown_tx: None,
        }
    }

    /// Bind and start the accept loop; returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "websocket gateway listening");

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let hub = Arc::clone(&hub);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, hub).await {
                                        debug!(?e, ?addr, "websocket connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(?e, "failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("websocket gateway shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: Arc<Hub>) -> Result<()> {
    // Capture the request path during the handshake.
    let path_cell = Arc::new(StdMutex::new(String::new()));
    let path_cell2 = Arc::clone(&path_cell);

    let ws_stream = accept_hdr_async(stream, move |req: &WsRequest, resp: WsResponse| {
        if let Ok(mut path) = path_cell2.lock() {
            *path = req.uri().path().to_string();
        }
        Ok(resp)
    })
    .await?;

    let path = path_cell
        .lock()
        .map(|p| p.clone())
        .unwrap_or_else(|_| "/".to_string());

    match parse_route(&path) {
        Route::Ws => {
            hub.handle_ws(ws_stream).await;
            Ok(())
        }
        Route::Invalid => {
            let (mut ws_tx, _ws_rx) = ws_stream.split();
            let _ = ws_tx
                .send(Message::Close(Some(close_frame(4000, "Invalid URL. Use /ws"))))
                .await;
            warn!(?addr, %path, "invalid websocket URL");
            Ok(())
        }
    }
}
