use std::collections::VecDeque;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::Number;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
};
use tracing::{info, warn};

use crate::{
    auth,
    cli::ClientArgs,
    codec::{FrameReader, Message, write_frame},
    protocol::{AUTH_CHALLENGE, ChatMessage, Inbound, Request, Response, UserInfo},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, mut writer) = stream.into_split();
    let mut reader = FrameReader::with_limit(reader, args.max_frame_len);
    authenticate(
        &mut reader,
        &mut writer,
        &args.login,
        &args.password,
        &args.public_key,
    )
    .await?;
    write_stdout(&format!("*** connected as {}", args.login)).await?;

    let mut chat = ChatClient::new(&args.login);
    for command in [Command::Users, Command::Contacts] {
        chat.submit(&mut writer, command).await?;
    }

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            frame = reader.next_message() => {
                if !chat.handle_frame(frame?).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !chat.handle_input(bytes_read?, &input, &mut writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    Ok(())
}

/// Runs PRESENCE and the challenge exchange. Returns once the relay has
/// accepted the login.
pub async fn authenticate<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    login: &str,
    password: &str,
    public_key: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let presence = Request::Presence {
        time: now(),
        user: UserInfo {
            account_name: login.to_string(),
            public_key: public_key.to_string(),
        },
    };
    write_frame(writer, &presence).await?;

    let mut reply = next_reply(reader).await?;
    if reply.response == AUTH_CHALLENGE {
        let nonce = reply.data.context("challenge carries no nonce")?;
        let hash = auth::password_hash(login, password);
        let digest = auth::encoded_challenge_response(&hash, &nonce);
        write_frame(writer, &Response::challenge(digest)).await?;
        reply = next_reply(reader).await?;
    }

    if !reply.is_ok() {
        bail!(
            "login rejected: {}",
            reply.error.unwrap_or_else(|| format!("code {}", reply.response))
        );
    }
    Ok(())
}

async fn next_reply<R>(reader: &mut FrameReader<R>) -> Result<Response>
where
    R: AsyncRead + Unpin,
{
    let Some(message) = reader.next_message().await? else {
        bail!("relay closed the connection during login");
    };
    match Inbound::from_message(message)? {
        Inbound::Reply(response) => Ok(response),
        Inbound::Request(request) => bail!("unexpected {} during login", request.kind()),
    }
}

fn now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Msg { to: String, text: String },
    Contacts,
    Add(String),
    Del(String),
    Users,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match head.to_ascii_lowercase().as_str() {
        "/msg" => {
            let (to, text) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: /msg <login> <text>".to_string())?;
            Command::Msg {
                to: to.to_string(),
                text: text.trim().to_string(),
            }
        }
        "/contacts" => Command::Contacts,
        "/users" => Command::Users,
        "/add" | "/del" if rest.is_empty() || rest.contains(char::is_whitespace) => {
            return Err(format!("usage: {head} <login>"));
        }
        "/add" => Command::Add(rest.to_string()),
        "/del" => Command::Del(rest.to_string()),
        "/quit" => Command::Quit,
        _ => {
            return Err(
                "commands: /msg <login> <text>, /contacts, /add <login>, /del <login>, /users, /quit"
                    .to_string(),
            );
        }
    };
    Ok(Some(command))
}

/// What a reply will answer, in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Awaiting {
    Message,
    Contacts,
    Users,
    Added(String),
    Removed(String),
}

/// Client-side request state: replies arrive in request order.
pub struct ChatClient {
    login: String,
    awaiting: VecDeque<Awaiting>,
}

impl ChatClient {
    pub fn new(login: &str) -> Self {
        Self {
            login: login.to_string(),
            awaiting: VecDeque::new(),
        }
    }

    /// Builds the request for `command` and remembers what its reply means.
    /// `Quit` yields the EXIT request, which gets no reply.
    pub fn request_for(&mut self, command: Command) -> Request {
        let login = self.login.clone();
        let time = Some(now());
        let (request, awaiting) = match command {
            Command::Msg { to, text } => (
                Request::Message(ChatMessage {
                    from: login,
                    to,
                    time: Number::from_f64(now()).unwrap_or_else(|| Number::from(0)),
                    msg_text: text,
                }),
                Some(Awaiting::Message),
            ),
            Command::Contacts => (
                Request::GetContacts { time, user: login },
                Some(Awaiting::Contacts),
            ),
            Command::Users => (
                Request::UsersRequest {
                    time,
                    account_name: login,
                },
                Some(Awaiting::Users),
            ),
            Command::Add(contact) => (
                Request::AddContact {
                    time,
                    user: login,
                    account_name: contact.clone(),
                },
                Some(Awaiting::Added(contact)),
            ),
            Command::Del(contact) => (
                Request::DeleteContact {
                    time,
                    user: login,
                    account_name: contact.clone(),
                },
                Some(Awaiting::Removed(contact)),
            ),
            Command::Quit => (
                Request::Exit {
                    time,
                    account_name: login,
                },
                None,
            ),
        };
        self.awaiting.extend(awaiting);
        request
    }

    /// The line to print for a relay reply, if any.
    pub fn render_reply(&mut self, reply: Response) -> Option<String> {
        let awaiting = self.awaiting.pop_front();
        if let Some(error) = reply.error {
            return Some(format!("!!! {error}"));
        }
        let list = reply.data_list.unwrap_or_default();
        match awaiting? {
            Awaiting::Message => None,
            Awaiting::Contacts if list.is_empty() => Some("*** contacts: (none)".to_string()),
            Awaiting::Contacts => Some(format!("*** contacts: {}", list.join(", "))),
            Awaiting::Users => Some(format!("*** known users: {}", list.join(", "))),
            Awaiting::Added(contact) => Some(format!("*** added contact {contact}")),
            Awaiting::Removed(contact) => Some(format!("*** removed contact {contact}")),
        }
    }

    async fn submit(&mut self, writer: &mut OwnedWriteHalf, command: Command) -> Result<()> {
        let request = self.request_for(command);
        write_frame(writer, &request).await?;
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Option<Message>) -> Result<bool> {
        let Some(frame) = frame else {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        };

        match Inbound::from_message(frame) {
            Ok(Inbound::Request(Request::Message(chat))) => {
                write_stdout(&format!("<{}> {}", chat.from, chat.msg_text)).await?;
            }
            Ok(Inbound::Reply(reply)) => {
                let is_error = reply.error.is_some();
                if let Some(line) = self.render_reply(reply) {
                    if is_error {
                        write_stderr(&line).await?;
                    } else {
                        write_stdout(&line).await?;
                    }
                }
            }
            Ok(Inbound::Request(other)) => warn!(kind = other.kind(), "ignoring unexpected request"),
            Err(err) => warn!(error = %err, "ignoring unreadable frame"),
        }
        Ok(true)
    }

    async fn handle_input(
        &mut self,
        bytes_read: usize,
        input: &str,
        writer: &mut OwnedWriteHalf,
    ) -> Result<bool> {
        if bytes_read == 0 {
            return Ok(false);
        }

        match parse_command(input) {
            Ok(None) => Ok(true),
            Ok(Some(Command::Quit)) => {
                self.submit(writer, Command::Quit).await?;
                write_stdout("*** leaving chat").await?;
                Ok(false)
            }
            Ok(Some(command)) => {
                self.submit(writer, command).await?;
                Ok(true)
            }
            Err(usage) => {
                write_stderr(&format!("!!! {usage}")).await?;
                Ok(true)
            }
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_command() {
        assert_eq!(
            parse_command("/msg bob hello there\n").unwrap(),
            Some(Command::Msg {
                to: "bob".into(),
                text: "hello there".into()
            })
        );
        assert!(parse_command("/msg bob").is_err());
    }

    #[test]
    fn parses_contact_commands() {
        assert_eq!(parse_command("/add carol").unwrap(), Some(Command::Add("carol".into())));
        assert_eq!(parse_command("/DEL carol").unwrap(), Some(Command::Del("carol".into())));
        assert!(parse_command("/add").is_err());
        assert_eq!(parse_command("   ").unwrap(), None);
        assert!(parse_command("hello").is_err());
    }

    #[test]
    fn replies_match_requests_in_order() {
        let mut chat = ChatClient::new("alice");
        chat.request_for(Command::Users);
        chat.request_for(Command::Contacts);
        chat.request_for(Command::Msg {
            to: "bob".into(),
            text: "hi".into(),
        });

        assert_eq!(
            chat.render_reply(Response::list(vec!["alice".into(), "bob".into()])),
            Some("*** known users: alice, bob".to_string())
        );
        assert_eq!(
            chat.render_reply(Response::list(Vec::new())),
            Some("*** contacts: (none)".to_string())
        );
        assert_eq!(
            chat.render_reply(Response::bad_request("recipient 'bob' is not registered")),
            Some("!!! recipient 'bob' is not registered".to_string())
        );
    }

    #[test]
    fn quit_builds_exit_without_awaiting_reply() {
        let mut chat = ChatClient::new("alice");
        let request = chat.request_for(Command::Quit);
        assert_eq!(request.kind(), "exit");
        assert_eq!(request.claimed_login(), Some("alice"));
        assert_eq!(chat.render_reply(Response::ok()), None);
    }

    #[test]
    fn outgoing_message_claims_own_login() {
        let mut chat = ChatClient::new("alice");
        match chat.request_for(Command::Msg {
            to: "bob".into(),
            text: "hi".into(),
        }) {
            Request::Message(message) => {
                assert_eq!(message.from, "alice");
                assert_eq!(message.to, "bob");
                assert_eq!(message.msg_text, "hi");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }
}
