//! tmux control-mode protocol: parsing, payload decoding, and command
//! quoting.
//!
//! # Components
//! - `LineParser`: stateful line decoder emitting typed events
//! - `StreamParser`: channel-backed parser handle for the hub
//! - `decode_escaped_value` / `settle_utf8`: `%output` payload decoding
//! - `encode_argv_command`: argv → control-mode command line

mod escape;
mod parser;
mod quote;
mod stream;
mod types;

pub use escape::{decode_escaped_value, settle_utf8, MAX_UTF8_CARRY};
pub use parser::LineParser;
pub use quote::{encode_argv_command, is_safe_bare_token, EncodeError};
pub use stream::{StreamParser, EVENT_BUFFER};
pub use types::{BlockHeader, CommandBlock, ControlEvent, Notification, ParseError};
