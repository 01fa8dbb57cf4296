use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::config::DEFAULT_LISTEN;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting client TCP connections.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
    /// Print the stored password hash for a login, for `[[users]]` entries.
    Hash(HashArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Socket address to bind, overriding the config file. Use port 0 for an
    /// ephemeral port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Also run the operator console on stdin.
    #[arg(long)]
    pub console: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long)]
    pub login: String,

    #[arg(long)]
    pub password: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub server: SocketAddr,

    /// Public key material announced in the presence message.
    #[arg(long, default_value = "")]
    pub public_key: String,

    /// Largest frame accepted from the relay. Match the relay's `max_frame_len`.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,
}

#[derive(Args, Debug, Clone)]
pub struct HashArgs {
    #[arg(long)]
    pub login: String,

    #[arg(long)]
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_are_optional() {
        let cli = Cli::try_parse_from(["chat-relay", "serve"]).unwrap();
        match cli.command {
            Command::Serve(args) => {
                assert!(args.config.is_none());
                assert!(args.listen.is_none());
                assert!(!args.console);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn client_defaults_server_address() {
        let cli = Cli::try_parse_from([
            "chat-relay",
            "client",
            "--login",
            "alice",
            "--password",
            "pw",
        ])
        .unwrap();
        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.server, DEFAULT_LISTEN.parse::<SocketAddr>().unwrap());
                assert_eq!(args.public_key, "");
                assert_eq!(args.max_frame_len, DEFAULT_MAX_FRAME_LEN);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn client_requires_credentials() {
        assert!(Cli::try_parse_from(["chat-relay", "client", "--login", "alice"]).is_err());
    }
}
