//! Argv → control-mode command line.
//!
//! The quoting is round-trip safe against tmux's shell-like word split:
//! safe tokens pass through bare, everything else is single-quoted with
//! `'` escaped as `'\''`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("argv cannot be empty")]
    EmptyArgv,
    #[error("invalid command name")]
    InvalidCommandName,
}

/// Encode an argv into one command line. The command name is trimmed and
/// lower-cased and must itself be a safe bare token.
pub fn encode_argv_command(argv: &[String]) -> Result<String, EncodeError> {
    let first = argv.first().ok_or(EncodeError::EmptyArgv)?;
    let cmd = first.trim().to_ascii_lowercase();
    if !is_safe_bare_token(&cmd) {
        return Err(EncodeError::InvalidCommandName);
    }

    let mut parts = Vec::with_capacity(argv.len());
    parts.push(cmd);
    for arg in &argv[1..] {
        parts.push(quote_arg(arg));
    }
    Ok(parts.join(" "))
}

/// Matches `[A-Za-z0-9_@%:./+\-]+`.
pub fn is_safe_bare_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'_' | b'@' | b'%' | b':' | b'.' | b'/' | b'+' | b'-')
        })
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if is_safe_bare_token(arg) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn encodes_plain_argv() {
        let line = encode_argv_command(&argv(&["send-keys", "-t", "%1", "-l", "hello world"]))
            .expect("encode");
        assert_eq!(line, "send-keys -t %1 -l 'hello world'");
    }

    #[test]
    fn escapes_single_quotes() {
        let line =
            encode_argv_command(&argv(&["send-keys", "-t", "%1", "-l", "a'b"])).expect("encode");
        assert_eq!(line, "send-keys -t %1 -l 'a'\\''b'");
    }

    #[test]
    fn rejects_empty_argv() {
        assert_eq!(encode_argv_command(&[]), Err(EncodeError::EmptyArgv));
    }

    #[test]
    fn rejects_unsafe_command_name() {
        assert_eq!(
            encode_argv_command(&argv(&["send keys"])),
            Err(EncodeError::InvalidCommandName)
        );
        assert_eq!(
            encode_argv_command(&argv(&["  "])),
            Err(EncodeError::InvalidCommandName)
        );
    }

    #[test]
    fn lowercases_command_name() {
        let line = encode_argv_command(&argv(&[" List-Panes ", "-a"])).expect("encode");
        assert_eq!(line, "list-panes -a");
    }

    #[test]
    fn quotes_empty_and_unsafe_args() {
        let line = encode_argv_command(&argv(&["display-message", "", "#{pane_id}"]))
            .expect("encode");
        assert_eq!(line, "display-message '' '#{pane_id}'");
    }

    #[test]
    fn round_trips_through_shell_word_split() {
        // A minimal model of the receiver's word split for single-quoted
        // strings, enough to check the quoting law.
        fn split(line: &str) -> Vec<String> {
            let mut words = Vec::new();
            let mut cur = String::new();
            let mut chars = line.chars().peekable();
            let mut in_quotes = false;
            let mut started = false;
            while let Some(c) = chars.next() {
                match c {
                    '\'' if !in_quotes => {
                        in_quotes = true;
                        started = true;
                    }
                    '\'' if in_quotes => in_quotes = false,
                    '\\' if !in_quotes => {
                        if let Some(&next) = chars.peek() {
                            cur.push(next);
                            chars.next();
                            started = true;
                        }
                    }
                    ' ' if !in_quotes => {
                        if started || !cur.is_empty() {
                            words.push(std::mem::take(&mut cur));
                            started = false;
                        }
                    }
                    c => {
                        cur.push(c);
                        started = true;
                    }
                }
            }
            if started || !cur.is_empty() {
                words.push(cur);
            }
            words
        }

        let cases: &[&[&str]] = &[
            &["send-keys", "-t", "%1", "-l", "hello world"],
            &["send-keys", "-t", "%1", "-l", "a'b"],
            &["send-keys", "-t", "%1", "-l", "'''"],
            &["display-message", "", "a b  c", "#{pane_title}"],
            &["show-options", "-g", "status-left"],
        ];
        for case in cases {
            let input = argv(case);
            let line = encode_argv_command(&input).expect("encode");
            assert_eq!(split(&line), input, "line {line:?}");
        }
    }
}
