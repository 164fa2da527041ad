//! Line-level control-mode parser.
//!
//! `LineParser` is fed one protocol line at a time and emits typed events
//! into a caller-supplied sink. A single `Option` field distinguishes
//! "inside a command block" from "expecting a top-level line"; a line can
//! emit up to two events (a header-mismatch error followed by the command).

use super::types::{BlockHeader, CommandBlock, ControlEvent, Notification, ParseError};

/// Stateful control-mode line decoder.
#[derive(Debug, Default)]
pub struct LineParser {
    active: Option<ActiveBlock>,
}

#[derive(Debug)]
struct ActiveBlock {
    header: BlockHeader,
    output: Vec<String>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline).
    pub fn feed_line(&mut self, line: &str, emit: &mut dyn FnMut(ControlEvent)) {
        if self.active.is_some() {
            match parse_end_line(line) {
                Some(Ok((end, success))) => self.finish_block(end, success, line, emit),
                Some(Err(message)) => emit_error(emit, line, message),
                None => {
                    if is_malformed_control_boundary(line) {
                        emit_error(emit, line, "malformed control boundary".to_string());
                    } else if let Some(active) = self.active.as_mut() {
                        active.output.push(line.to_string());
                    }
                }
            }
            return;
        }

        match parse_begin_line(line) {
            Some(Ok(header)) => {
                self.active = Some(ActiveBlock {
                    header,
                    output: Vec::new(),
                });
                return;
            }
            Some(Err(message)) => {
                emit_error(emit, line, message);
                return;
            }
            None => {}
        }

        match parse_end_line(line) {
            Some(Ok(_)) => {
                emit_error(emit, line, "end/error without begin".to_string());
                return;
            }
            Some(Err(message)) => {
                emit_error(emit, line, message);
                return;
            }
            None => {}
        }

        if line.starts_with('%') {
            match parse_notification(line) {
                Ok(notification) => emit(ControlEvent::Notification(notification)),
                Err(message) => emit_error(emit, line, message),
            }
            return;
        }

        emit_error(emit, line, "unexpected line outside command block".to_string());
    }

    /// Flush parser state. Call when the input stream ends.
    pub fn finish(&mut self, emit: &mut dyn FnMut(ControlEvent)) {
        if self.active.take().is_some() {
            emit(ControlEvent::ParseError(ParseError {
                line: String::new(),
                message: "unterminated command block at end of stream".to_string(),
            }));
        }
    }

    fn finish_block(
        &mut self,
        end: BlockHeader,
        success: bool,
        raw: &str,
        emit: &mut dyn FnMut(ControlEvent),
    ) {
        let Some(active) = self.active.take() else {
            emit_error(emit, raw, "internal: missing active block".to_string());
            return;
        };

        if active.header != end {
            emit_error(
                emit,
                raw,
                format!(
                    "mismatched block header begin={:?} end={:?}",
                    active.header, end
                ),
            );
        }

        emit(ControlEvent::Command(CommandBlock {
            header: active.header,
            end,
            success,
            output: active.output,
        }));
    }
}

fn emit_error(emit: &mut dyn FnMut(ControlEvent), line: &str, message: String) {
    emit(ControlEvent::ParseError(ParseError {
        line: line.to_string(),
        message,
    }));
}

fn parse_begin_line(line: &str) -> Option<Result<BlockHeader, String>> {
    if !line.starts_with("%begin") {
        return None;
    }
    let Some(rest) = line.strip_prefix("%begin ") else {
        return Some(Err("invalid %begin line".to_string()));
    };
    Some(parse_header(rest).map_err(|e| format!("invalid %begin header: {e}")))
}

/// `Some(Ok((header, success)))` for a well-formed end marker,
/// `Some(Err(_))` for an end marker with a bad shape, `None` otherwise.
fn parse_end_line(line: &str) -> Option<Result<(BlockHeader, bool), String>> {
    if line.starts_with("%end") {
        let Some(rest) = line.strip_prefix("%end ") else {
            return Some(Err("invalid %end line".to_string()));
        };
        return Some(
            parse_header(rest)
                .map(|h| (h, true))
                .map_err(|e| format!("invalid %end header: {e}")),
        );
    }
    if line.starts_with("%error") {
        let Some(rest) = line.strip_prefix("%error ") else {
            return Some(Err("invalid %error line".to_string()));
        };
        return Some(
            parse_header(rest)
                .map(|h| (h, false))
                .map_err(|e| format!("invalid %error header: {e}")),
        );
    }
    None
}

fn parse_header(raw: &str) -> Result<BlockHeader, String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 3 {
        return Err("invalid block header".to_string());
    }
    let parse = |s: &str| {
        s.parse::<i64>()
            .map_err(|_| format!("invalid integer in block header: {s:?}"))
    };
    Ok(BlockHeader {
        epoch_seconds: parse(fields[0])?,
        command_id: parse(fields[1])?,
        flags: parse(fields[2])?,
    })
}

fn is_malformed_control_boundary(line: &str) -> bool {
    for marker in ["%begin", "%end", "%error"] {
        if line.starts_with(marker) && !line[marker.len()..].starts_with(' ') {
            return true;
        }
    }
    false
}

fn parse_notification(line: &str) -> Result<Notification, String> {
    let Some(body) = line.strip_prefix('%') else {
        return Err("not a notification".to_string());
    };

    let (name, rest) = split_name_and_rest(body);
    let mut n = Notification {
        name: name.to_string(),
        raw: line.to_string(),
        ..Notification::default()
    };

    match name {
        "output" => {
            let (pane_id, value) = split_first_token_preserve(rest);
            if pane_id.is_empty() {
                return Err("output missing pane id".to_string());
            }
            n.args = vec![pane_id.to_string()];
            n.value = value.to_string();
        }
        "extended-output" => {
            let (base, value) = split_by_colon(rest);
            let fields: Vec<String> = base.split_whitespace().map(str::to_string).collect();
            if fields.len() < 2 {
                return Err("extended-output missing required fields".to_string());
            }
            n.args = fields;
            n.value = value.to_string();
        }
        "subscription-changed" => {
            let (base, value) = split_by_colon(rest);
            let fields: Vec<String> = base.split_whitespace().map(str::to_string).collect();
            if fields.len() < 5 {
                return Err("subscription-changed missing required fields".to_string());
            }
            n.args = fields;
            n.value = value.to_string();
        }
        "message" | "config-error" | "session-renamed" | "exit" => {
            n.text = rest.trim().to_string();
        }
        "client-session-changed" => {
            let (a, b, tail) = take_two_and_tail(rest);
            if a.is_empty() || b.is_empty() {
                return Err("client-session-changed missing required fields".to_string());
            }
            n.args = vec![a.to_string(), b.to_string()];
            n.text = tail.to_string();
        }
        "session-changed" | "window-renamed" => {
            let (a, tail) = split_once_trim(rest);
            if a.is_empty() {
                return Err(format!("{name} missing required fields"));
            }
            n.args = vec![a.to_string()];
            n.text = tail.to_string();
        }
        _ => {
            n.args = rest.split_whitespace().map(str::to_string).collect();
        }
    }

    Ok(n)
}

/// Split at the first space; the rest excludes exactly that one space.
fn split_name_and_rest(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

/// First whitespace token plus the remainder after exactly one separator
/// space, leading spaces in the remainder preserved.
fn split_first_token_preserve(s: &str) -> (&str, &str) {
    let s = s.trim_start_matches(' ');
    if s.is_empty() {
        return ("", "");
    }
    match s.find(' ') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

/// Split at the first `:`, trimming the left part and stripping the
/// leading space run from the right part.
fn split_by_colon(s: &str) -> (&str, &str) {
    match s.find(':') {
        Some(i) => (s[..i].trim(), s[i + 1..].trim_start_matches(' ')),
        None => (s.trim(), ""),
    }
}

/// First whitespace-separated token and the trimmed tail.
fn split_once_trim(s: &str) -> (&str, &str) {
    let s = s.trim();
    if s.is_empty() {
        return ("", "");
    }
    match s.find(' ') {
        Some(i) => (&s[..i], s[i + 1..].trim()),
        None => (s, ""),
    }
}

fn take_two_and_tail(s: &str) -> (&str, &str, &str) {
    let (a, rest) = split_once_trim(s);
    let (b, tail) = split_once_trim(rest);
    (a, b, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(lines: &[&str]) -> Vec<ControlEvent> {
        let mut parser = LineParser::new();
        let mut events = Vec::new();
        for line in lines {
            parser.feed_line(line, &mut |ev| events.push(ev));
        }
        events
    }

    fn commands(events: &[ControlEvent]) -> Vec<&CommandBlock> {
        events
            .iter()
            .filter_map(|ev| match ev {
                ControlEvent::Command(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[ControlEvent]) -> Vec<&ParseError> {
        events
            .iter()
            .filter_map(|ev| match ev {
                ControlEvent::ParseError(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn notifications(events: &[ControlEvent]) -> Vec<&Notification> {
        events
            .iter()
            .filter_map(|ev| match ev {
                ControlEvent::Notification(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn command_block_and_notification() {
        let events = feed_all(&[
            "%begin 1363006971 2 1",
            "0: zsh* (1 panes)",
            "%end 1363006971 2 1",
            "%window-renamed @7 dev shell",
        ]);

        assert!(errors(&events).is_empty(), "unexpected errors: {events:?}");

        let cmds = commands(&events);
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[0].header,
            BlockHeader {
                epoch_seconds: 1363006971,
                command_id: 2,
                flags: 1
            }
        );
        assert!(cmds[0].success);
        assert_eq!(cmds[0].output, vec!["0: zsh* (1 panes)".to_string()]);

        let notes = notifications(&events);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].name, "window-renamed");
        assert_eq!(notes[0].args, vec!["@7".to_string()]);
        assert_eq!(notes[0].text, "dev shell");
    }

    #[test]
    fn error_block_reports_failure() {
        let events = feed_all(&["%begin 100 1 0", "no such window", "%error 100 1 0"]);
        let cmds = commands(&events);
        assert_eq!(cmds.len(), 1);
        assert!(!cmds[0].success);
        assert_eq!(cmds[0].output, vec!["no such window".to_string()]);
    }

    #[test]
    fn minimal_success_block() {
        let events = feed_all(&["%begin 100 1 0", "0: shell* (1 panes)", "%end 100 1 0"]);
        assert!(errors(&events).is_empty());
        let cmds = commands(&events);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].header.epoch_seconds, 100);
        assert_eq!(cmds[0].header.command_id, 1);
        assert_eq!(cmds[0].header.flags, 0);
        assert!(cmds[0].success);
        assert_eq!(cmds[0].output, vec!["0: shell* (1 panes)".to_string()]);
    }

    #[test]
    fn extended_output_and_subscription() {
        let events = feed_all(&[
            "%extended-output %1 12 foo bar : hello world",
            "%subscription-changed sub $1 @2 0 %3 extra : #{pane_current_command}",
        ]);

        let notes = notifications(&events);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].name, "extended-output");
        assert_eq!(
            notes[0].args,
            vec![
                "%1".to_string(),
                "12".to_string(),
                "foo".to_string(),
                "bar".to_string()
            ]
        );
        assert_eq!(notes[0].value, "hello world");
        assert_eq!(notes[1].name, "subscription-changed");
        assert_eq!(notes[1].value, "#{pane_current_command}");
    }

    #[test]
    fn output_preserves_leading_spaces() {
        let events = feed_all(&["%output %11  hello"]);
        let notes = notifications(&events);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].args, vec!["%11".to_string()]);
        assert_eq!(notes[0].value, " hello");
    }

    #[test]
    fn output_without_pane_id_is_error() {
        let events = feed_all(&["%output"]);
        assert_eq!(errors(&events).len(), 1);
    }

    #[test]
    fn end_without_begin_is_error() {
        let events = feed_all(&["%end 1 2 3"]);
        assert_eq!(errors(&events).len(), 1);
        assert!(commands(&events).is_empty());
        assert_eq!(errors(&events)[0].message, "end/error without begin");
    }

    #[test]
    fn mismatched_end_header_emits_error_and_command() {
        let events = feed_all(&["%begin 100 1 0", "out", "%end 100 2 0"]);
        assert_eq!(errors(&events).len(), 1);
        let cmds = commands(&events);
        assert_eq!(cmds.len(), 1);
        // The begin header stays authoritative.
        assert_eq!(cmds[0].header.command_id, 1);
        assert_eq!(cmds[0].end.command_id, 2);
        assert!(cmds[0].success);
    }

    #[test]
    fn malformed_boundary_inside_block() {
        let events = feed_all(&["%begin 1 2 3", "%beginx", "%end 1 2 3"]);
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].message, "malformed control boundary");
        let cmds = commands(&events);
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].output.is_empty());
    }

    #[test]
    fn begin_marker_inside_block_is_output() {
        let events = feed_all(&["%begin 1 2 3", "%begin 9 9 9", "%end 1 2 3"]);
        assert!(errors(&events).is_empty());
        let cmds = commands(&events);
        assert_eq!(cmds[0].output, vec!["%begin 9 9 9".to_string()]);
    }

    #[test]
    fn invalid_header_is_error() {
        for line in ["%begin 1 2", "%begin a b c", "%begin 1 2 3 4", "%endx"] {
            let events = feed_all(&[line]);
            assert_eq!(errors(&events).len(), 1, "line {line:?}");
        }
    }

    #[test]
    fn unexpected_line_outside_block() {
        let events = feed_all(&["plain text"]);
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].message, "unexpected line outside command block");
    }

    #[test]
    fn unknown_notification_splits_args() {
        let events = feed_all(&["%sessions-changed", "%layout-change @1 cafe,80x24,0,0"]);
        let notes = notifications(&events);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].name, "sessions-changed");
        assert!(notes[0].args.is_empty());
        assert_eq!(notes[1].name, "layout-change");
        assert_eq!(
            notes[1].args,
            vec!["@1".to_string(), "cafe,80x24,0,0".to_string()]
        );
    }

    #[test]
    fn session_changed_and_client_session_changed() {
        let events = feed_all(&[
            "%session-changed $1 dev",
            "%client-session-changed /dev/ttys001 $1 dev",
            "%exit server exited unexpectedly",
        ]);
        let notes = notifications(&events);
        assert_eq!(notes[0].args, vec!["$1".to_string()]);
        assert_eq!(notes[0].text, "dev");
        assert_eq!(
            notes[1].args,
            vec!["/dev/ttys001".to_string(), "$1".to_string()]
        );
        assert_eq!(notes[1].text, "dev");
        assert_eq!(notes[2].name, "exit");
        assert_eq!(notes[2].text, "server exited unexpectedly");
    }

    #[test]
    fn finish_reports_unterminated_block() {
        let mut parser = LineParser::new();
        let mut events = Vec::new();
        parser.feed_line("%begin 1 2 3", &mut |ev| events.push(ev));
        parser.finish(&mut |ev| events.push(ev));
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].message, "unterminated command block at end of stream");

        // State was cleared; the parser stays usable.
        parser.feed_line("%begin 1 2 3", &mut |ev| events.push(ev));
        parser.feed_line("%end 1 2 3", &mut |ev| events.push(ev));
        assert_eq!(commands(&events).len(), 1);
    }

    #[test]
    fn interleaved_blocks_and_notifications() {
        let events = feed_all(&[
            "%output %1 before",
            "%begin 10 20 0",
            "line one",
            "line two",
            "%end 10 20 0",
            "%output %1 after",
            "%begin 10 21 0",
            "%error 10 21 0",
        ]);
        assert!(errors(&events).is_empty());
        let cmds = commands(&events);
        assert_eq!(cmds.len(), 2);
        assert_eq!(
            cmds[0].output,
            vec!["line one".to_string(), "line two".to_string()]
        );
        assert!(cmds[0].success);
        assert!(!cmds[1].success);
        assert_eq!(notifications(&events).len(), 2);
    }
}
