//! CLI error handling and exit codes.
//!
//! Exit code 0 means success, 1 a local error (bad arguments, unreadable
//! files, invalid schedule), and anything else is the CommandStatus code
//! returned by the daemon so scripts can branch on specific failures.

use crate::client::CommandReply;
use nightops::command::DAEMON_UNREACHABLE;
use std::fmt;
use std::process;

/// Errors surfaced to the operator.
#[derive(Debug)]
pub enum CliError {
    /// Problem with the site config or command arguments.
    Config(String),
    /// Local failure before any daemon round trip.
    Local(String),
    /// The daemon rejected the command.
    Command(CommandReply),
    /// The daemon could not be reached.
    Transport(String),
}

impl CliError {
    /// Prints the error and exits with the matching code.
    pub fn exit(&self) -> ! {
        match self {
            CliError::Command(reply) => {
                eprintln!("{}", reply.message);
                if let Some(errors) = &reply.errors {
                    for error in errors {
                        eprintln!("  {error}");
                    }
                }
                process::exit(reply.code)
            }
            CliError::Transport(_) => {
                eprintln!("{self}");
                process::exit(DAEMON_UNREACHABLE)
            }
            _ => {
                eprintln!("{self}");
                process::exit(1)
            }
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(message) => write!(f, "error: {message}"),
            CliError::Local(message) => write!(f, "error: {message}"),
            CliError::Command(reply) => write!(f, "{}", reply.message),
            CliError::Transport(message) => {
                write!(f, "error: unable to communicate with operations daemon ({message})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_mention_the_daemon() {
        let error = CliError::Transport("connection refused".to_string());
        assert!(error.to_string().contains("operations daemon"));
    }

    #[test]
    fn command_errors_show_the_daemon_message() {
        let error = CliError::Command(CommandReply {
            code: 23,
            message: "error: dome is not closed".to_string(),
            errors: None,
        });
        assert_eq!(error.to_string(), "error: dome is not closed");
    }
}
