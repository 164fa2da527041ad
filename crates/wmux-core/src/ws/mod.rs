//! WebSocket endpoint for the gateway.

mod server;

pub use server::GatewayWsServer;
