//! JSON wire protocol spoken with browser clients.
//!
//! One JSON object per WebSocket text message, tagged by `t`.

use serde::{Deserialize, Serialize};

use super::model::StateSnapshot;

/// Client → server message. Only `{"t": "cmd", "argv": [...]}` is
/// understood; the raw `t` is kept so unsupported types get a precise
/// error rather than a JSON parse failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub t: String,
    #[serde(default)]
    pub argv: Vec<String>,
}

/// Server → client envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    TmuxState {
        state: StateSnapshot,
    },
    TmuxCommand {
        command: CommandPayload,
    },
    TmuxNotification {
        notification: NotificationPayload,
    },
    PaneOutput {
        pane_output: PaneStreamPayload,
    },
    PaneSnapshot {
        pane_snapshot: PaneStreamPayload,
    },
    PaneCursor {
        pane_cursor: PaneCursorPayload,
    },
    TmuxRestarted,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandPayload {
    pub epoch_seconds: i64,
    pub command_id: i64,
    pub flags: i64,
    pub success: bool,
    pub output: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
}

/// Shared by `pane_output` and `pane_snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct PaneStreamPayload {
    pub pane_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaneCursorPayload {
    pub pane_id: String,
    pub x: i64,
    pub y: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelopes_serialize_with_t_tag() {
        let msg = ServerMessage::Error {
            message: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"t": "error", "message": "boom"})
        );

        let msg = ServerMessage::TmuxRestarted;
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"t": "tmux_restarted"})
        );

        let msg = ServerMessage::PaneOutput {
            pane_output: PaneStreamPayload {
                pane_id: "%1".to_string(),
                data: "hi".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"t": "pane_output", "pane_output": {"pane_id": "%1", "data": "hi"}})
        );
    }

    #[test]
    fn notification_payload_omits_empty_fields() {
        let msg = ServerMessage::TmuxNotification {
            notification: NotificationPayload {
                name: "sessions-changed".to_string(),
                args: Vec::new(),
                text: String::new(),
                value: String::new(),
            },
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"t": "tmux_notification", "notification": {"name": "sessions-changed"}})
        );
    }

    #[test]
    fn client_message_parses_with_defaults() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"t":"cmd","argv":["list-panes","-a"]}"#).unwrap();
        assert_eq!(msg.t, "cmd");
        assert_eq!(msg.argv, vec!["list-panes".to_string(), "-a".to_string()]);

        let msg: ClientMessage = serde_json::from_str(r#"{"t":"ping"}"#).unwrap();
        assert_eq!(msg.t, "ping");
        assert!(msg.argv.is_empty());
    }
}
