//! In-memory model of the tmux session: windows and panes, rebuilt from
//! specially formatted `list-panes` query responses.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

/// Prefix marking model-update lines embedded in command output. The
/// record format is a shared contract with the query in
/// [`crate::hub::PANE_FORMAT`]; keep them in sync byte for byte.
pub const MODEL_PREFIX: &str = "__WMUX__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Window {
    pub id: String,
    pub index: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pane {
    /// tmux pane id, sigil included (`%3`).
    pub id: String,
    /// Externally visible id, sigil stripped (`3`).
    pub public_id: String,
    pub window_id: String,
    pub session_name: String,
    pub pane_index: i64,
    pub active: bool,
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
    /// Current command running in the pane.
    pub name: String,
    pub title: String,
}

/// Ordered view of the model, as sent to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub windows: Vec<Window>,
    pub panes: Vec<Pane>,
}

/// The single tmux-id → public-id converter. Public pane ids omit the
/// leading `%` sigil.
pub fn public_pane_id(tmux_pane_id: &str) -> String {
    let trimmed = tmux_pane_id.trim();
    trimmed.strip_prefix('%').unwrap_or(trimmed).to_string()
}

#[derive(Debug, Default)]
pub struct SessionModel {
    windows: HashMap<String, Window>,
    panes: HashMap<String, Pane>,
}

impl SessionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.windows.clear();
        self.panes.clear();
    }

    /// Apply model-update records found in command output. Returns whether
    /// anything changed; re-applying identical lines reports no change.
    pub fn apply_output_lines(&mut self, lines: &[String]) -> bool {
        let mut updated = false;
        for line in lines {
            if !line.starts_with(MODEL_PREFIX) {
                continue;
            }
            let parts: Vec<&str> = line.split('\t').collect();
            let kind = parts[0]
                .strip_prefix(MODEL_PREFIX)
                .and_then(|rest| rest.strip_prefix('_'))
                .unwrap_or("");
            match kind {
                "win" => {
                    if parts.len() < 4 {
                        continue;
                    }
                    let Ok(index) = parts[2].parse::<i64>() else {
                        continue;
                    };
                    let next = Window {
                        id: parts[1].to_string(),
                        index,
                        name: parts[3].to_string(),
                    };
                    if self.windows.get(&next.id) != Some(&next) {
                        self.windows.insert(next.id.clone(), next);
                        updated = true;
                    }
                }
                "pane" => {
                    if parts.len() < 12 {
                        continue;
                    }
                    let Some(pane) = parse_pane(&parts) else {
                        continue;
                    };
                    if self.panes.get(&pane.id) != Some(&pane) {
                        self.panes.insert(pane.id.clone(), pane);
                        updated = true;
                    }
                }
                _ => {}
            }
        }
        updated
    }

    /// Ordered snapshot: windows by `(index, id)`, panes by
    /// `(window_id, pane_index, id)`.
    pub fn snapshot(&self) -> StateSnapshot {
        let mut windows: Vec<Window> = self.windows.values().cloned().collect();
        windows.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));

        let mut panes: Vec<Pane> = self.panes.values().cloned().collect();
        panes.sort_by(|a, b| {
            a.window_id
                .cmp(&b.window_id)
                .then_with(|| a.pane_index.cmp(&b.pane_index))
                .then_with(|| a.id.cmp(&b.id))
        });

        StateSnapshot { windows, panes }
    }
}

/// Field order is the wire contract:
/// `session_name, id, window_id, pane_index, active, left, top, width,
/// height, current_command, title` after the record tag.
fn parse_pane(parts: &[&str]) -> Option<Pane> {
    let pane_index = parts[4].parse::<i64>().ok()?;
    let left = parts[6].parse::<i64>().ok()?;
    let top = parts[7].parse::<i64>().ok()?;
    let width = parts[8].parse::<i64>().ok()?;
    let height = parts[9].parse::<i64>().ok()?;

    Some(Pane {
        id: parts[2].to_string(),
        public_id: public_pane_id(parts[2]),
        window_id: parts[3].to_string(),
        session_name: parts[1].to_string(),
        pane_index,
        active: parts[5] == "1",
        left,
        top,
        width,
        height,
        name: parts[10].to_string(),
        title: parts[11].to_string(),
    })
}

/// Restrict a snapshot to panes of `target_session` plus exactly the
/// windows those panes reference. An empty target disables filtering.
pub fn filter_to_session(state: StateSnapshot, target_session: &str) -> StateSnapshot {
    if target_session.is_empty() {
        return state;
    }

    let mut window_ids: HashSet<&str> = HashSet::new();
    let panes: Vec<Pane> = state
        .panes
        .into_iter()
        .filter(|pane| pane.session_name == target_session)
        .collect();
    for pane in &panes {
        window_ids.insert(pane.window_id.as_str());
    }

    let windows: Vec<Window> = state
        .windows
        .into_iter()
        .filter(|window| window_ids.contains(window.id.as_str()))
        .collect();

    StateSnapshot { windows, panes }
}
