//! wmux-core - tmux control-mode gateway library
//!
//! Makes the panes of one tmux session reachable from web browsers:
//! a supervised `tmux -CC` subprocess on one side, JSON-over-WebSocket
//! clients on the other, and a hub in between that owns the session
//! model, correlates command responses, and fans events out.
//!
//! # Modules
//! - `control`: control-mode protocol (parser, payload decoding, quoter)
//! - `policy`: allow-list gate for outbound commands
//! - `proc`: control-mode subprocess supervision
//! - `hub`: session model, pending-command FIFO, client fan-out
//! - `ws`: the WebSocket endpoint

pub mod control;
pub mod hub;
pub mod policy;
pub mod proc;
pub mod ws;

pub use hub::{Hub, StateSnapshot};
pub use policy::CommandPolicy;
pub use proc::{check_tmux, ensure_session, ControlModeSupervisor, SupervisorConfig};
pub use ws::GatewayWsServer;
