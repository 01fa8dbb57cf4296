//! Operator console.
//!
//! Reads commands from stdin while the relay runs. Store queries go straight
//! to the credential store, read-only; the live session table is only
//! reachable through the [`RelayHandle`].

use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::relay::RelayHandle;
use crate::store::CredentialStore;

const HELP: &str = "commands: USERS/u, CONNECTED/c, HISTORY/hist [login], STATS/s, HELP/h, EXIT/e";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Users,
    Connected,
    History { login: Option<String> },
    Stats,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of operator input. Case-insensitive, with aliases.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized = match cmd.as_str() {
            "U" => "USERS",
            "C" => "CONNECTED",
            "HIST" => "HISTORY",
            "S" => "STATS",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized, parts.len()) {
            ("USERS", 1) => Ok(ConsoleCommand::Users),
            ("CONNECTED", 1) => Ok(ConsoleCommand::Connected),
            ("HISTORY", 1) => Ok(ConsoleCommand::History { login: None }),
            ("HISTORY", 2) => Ok(ConsoleCommand::History {
                login: Some(parts[1].to_string()),
            }),
            ("STATS", 1) => Ok(ConsoleCommand::Stats),
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("EXIT", 1) => Ok(ConsoleCommand::Exit),
            ("HISTORY", _) => Err(anyhow!("HISTORY takes at most one argument: HISTORY [login]")),
            ("USERS" | "CONNECTED" | "STATS" | "HELP" | "EXIT", _) => {
                Err(anyhow!("{normalized} takes no arguments"))
            }
            _ => Err(anyhow!("invalid command. Try: {HELP}")),
        }
    }
}

pub struct Console {
    store: Arc<dyn CredentialStore>,
    handle: RelayHandle,
}

impl Console {
    pub fn new(store: Arc<dyn CredentialStore>, handle: RelayHandle) -> Self {
        Self { store, handle }
    }

    /// Runs until EXIT or end of input. EXIT also stops the relay.
    pub async fn run(self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let (output, exit) = match ConsoleCommand::parse(&line) {
                Ok(command) => {
                    let exit = command == ConsoleCommand::Exit;
                    let output = self
                        .execute(command)
                        .await
                        .unwrap_or_else(|err| vec![format!("ERROR: {err}")]);
                    (output, exit)
                }
                Err(err) => (vec![format!("ERROR: {err}")], false),
            };
            for line in output {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
            stdout.flush().await?;
            if exit {
                break;
            }
        }
        Ok(())
    }

    /// Output lines for a single command.
    pub async fn execute(&self, command: ConsoleCommand) -> Result<Vec<String>> {
        let lines = match command {
            ConsoleCommand::Users => self
                .store
                .known_users()?
                .into_iter()
                .map(|user| format!("{} | last login: {}", user.login, when(user.last_login)))
                .collect(),
            ConsoleCommand::Connected => {
                let sessions = self.handle.sessions().await?;
                if sessions.is_empty() {
                    vec!["no active sessions".to_string()]
                } else {
                    sessions
                        .into_iter()
                        .map(|s| {
                            format!(
                                "{} | {}:{} | since {}",
                                s.login,
                                s.peer.ip(),
                                s.peer.port(),
                                stamp(s.connected_at)
                            )
                        })
                        .collect()
                }
            }
            ConsoleCommand::History { login } => self
                .store
                .login_history(login.as_deref())?
                .into_iter()
                .map(|record| {
                    format!(
                        "{} | {}:{} | {}",
                        record.login,
                        record.addr.ip(),
                        record.addr.port(),
                        stamp(record.login_time)
                    )
                })
                .collect(),
            ConsoleCommand::Stats => self
                .store
                .message_stats()?
                .into_iter()
                .map(|stats| {
                    format!(
                        "{} | last login: {} | sent: {} | received: {}",
                        stats.login,
                        when(stats.last_login),
                        stats.sent,
                        stats.accepted
                    )
                })
                .collect(),
            ConsoleCommand::Help => vec![HELP.to_string()],
            ConsoleCommand::Exit => {
                self.handle.shutdown().await?;
                vec!["relay stopping".to_string()]
            }
        };
        Ok(lines)
    }
}

fn stamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn when(time: Option<DateTime<Utc>>) -> String {
    time.map(stamp).unwrap_or_else(|| "never".to_string())
}
