//! Allow-list gate for outbound tmux commands.

use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("empty command")]
    EmptyCommand,
    #[error("blocked command: {0}")]
    Blocked(String),
}

/// Fixed allow-set over command names. No argument-level validation.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: HashSet<&'static str>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            allowed: HashSet::from([
                "send-keys",
                "refresh-client",
                "kill-window",
                "list-windows",
                "list-panes",
                "display-message",
                "capture-pane",
                "show-options",
            ]),
        }
    }
}

impl CommandPolicy {
    /// Validate a full command line by its first whitespace token.
    pub fn validate_line(&self, line: &str) -> Result<(), PolicyError> {
        self.validate_command(&command_name(line))
    }

    pub fn validate_command(&self, cmd: &str) -> Result<(), PolicyError> {
        if cmd.is_empty() {
            return Err(PolicyError::EmptyCommand);
        }
        if !self.allowed.contains(cmd) {
            return Err(PolicyError::Blocked(cmd.to_string()));
        }
        Ok(())
    }
}

fn command_name(line: &str) -> String {
    line.split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_listed_commands() {
        let policy = CommandPolicy::default();
        for cmd in [
            "send-keys",
            "refresh-client",
            "kill-window",
            "list-windows",
            "list-panes",
            "display-message",
            "capture-pane",
            "show-options",
        ] {
            assert_eq!(policy.validate_command(cmd), Ok(()), "{cmd}");
        }
    }

    #[test]
    fn blocks_everything_else() {
        let policy = CommandPolicy::default();
        assert_eq!(
            policy.validate_command("kill-server"),
            Err(PolicyError::Blocked("kill-server".to_string()))
        );
        assert_eq!(policy.validate_command(""), Err(PolicyError::EmptyCommand));
    }

    #[test]
    fn validates_first_token_of_line() {
        let policy = CommandPolicy::default();
        assert_eq!(policy.validate_line("send-keys -t %1 -l hi"), Ok(()));
        assert_eq!(policy.validate_line("  Send-Keys -t %1"), Ok(()));
        assert_eq!(policy.validate_line("   "), Err(PolicyError::EmptyCommand));
        assert_eq!(
            policy.validate_line("new-window -n x"),
            Err(PolicyError::Blocked("new-window".to_string()))
        );
    }
}
