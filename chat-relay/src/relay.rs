//! The multiplexer task.
//!
//! One task owns the listener, every client transport and the [`Engine`].
//! Each loop iteration waits, bounded by the accept poll interval, for a new
//! connection, an operator command or readiness on any open transport, then
//! runs one non-blocking pass over all connections:
//!
//! 1. read what is available and feed every complete frame to the engine,
//! 2. flush queued replies,
//! 3. drain the delivery queue against write-ready recipients,
//! 4. drop connections that stalled, overflowed or went idle.
//!
//! Other tasks reach the relay only through a [`RelayHandle`].

use std::collections::BTreeMap;
use std::future::{Future, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::connection::{ReadStatus, Transport};
use crate::engine::{Delivery, Effect, Engine, SessionInfo};
use crate::protocol::Response;
use crate::session::ConnId;
use crate::store::CredentialStore;

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("relay is not running")]
    Stopped,
}

/// Requests from other tasks to the multiplexer.
#[derive(Debug)]
pub enum RelayCommand {
    Sessions {
        respond_to: oneshot::Sender<Vec<SessionInfo>>,
    },
    Shutdown,
}

/// Cloneable sender side of the relay's command channel.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Snapshot of the live session table.
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, RelayError> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(RelayCommand::Sessions { respond_to })
            .await
            .map_err(|_| RelayError::Stopped)?;
        response.await.map_err(|_| RelayError::Stopped)
    }

    /// Asks the relay to remove every session and stop.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.commands
            .send(RelayCommand::Shutdown)
            .await
            .map_err(|_| RelayError::Stopped)
    }
}

struct Limits {
    max_frame_len: usize,
    max_pending_output: usize,
    idle_timeout: Option<Duration>,
}

pub struct Relay {
    listener: TcpListener,
    commands: mpsc::Receiver<RelayCommand>,
    accept_poll: Duration,
    connections: Connections,
}

impl Relay {
    /// Binds the listener. Failure here is the only fatal relay error.
    pub async fn bind(
        config: &RelayConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<(Self, RelayHandle), RelayError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.listen,
                source,
            })?;
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);

        let relay = Self {
            listener,
            commands,
            accept_poll: config.accept_poll(),
            connections: Connections {
                engine: Engine::new(store),
                transports: BTreeMap::new(),
                next_id: 1,
                limits: Limits {
                    max_frame_len: config.max_frame_len,
                    max_pending_output: config.max_pending_output,
                    idle_timeout: config.idle_timeout(),
                },
            },
        };
        Ok((relay, RelayHandle { commands: sender }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            mut commands,
            accept_poll,
            mut connections,
        } = self;
        tokio::pin!(shutdown);
        let mut commands_open = true;

        loop {
            select! {
                biased;
                _ = &mut shutdown => break,
                command = commands.recv(), if commands_open => match command {
                    Some(RelayCommand::Sessions { respond_to }) => {
                        let _ = respond_to.send(connections.engine.sessions());
                    }
                    Some(RelayCommand::Shutdown) => break,
                    None => commands_open = false,
                },
                accepted = listener.accept() => connections.handle_accept(accepted),
                _ = connections.readiness(), if !connections.transports.is_empty() => {}
                _ = sleep(accept_poll) => {}
            }

            connections.pass();
        }

        connections.shutdown();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), RelayError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct Connections {
    engine: Engine,
    transports: BTreeMap<ConnId, Transport>,
    next_id: ConnId,
    limits: Limits,
}

impl Connections {
    fn handle_accept(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, peer)) => {
                let id = self.next_id;
                self.next_id += 1;
                info!(conn = id, %peer, "accepted connection");
                self.engine.connect(id, peer);
                self.transports
                    .insert(id, Transport::new(stream, peer, self.limits.max_frame_len));
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }

    /// Resolves when any transport is readable, or writable with output
    /// pending.
    async fn readiness(&self) {
        poll_fn(|cx| {
            for transport in self.transports.values() {
                if transport.poll_ready(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        })
        .await
    }

    fn pass(&mut self) {
        let ids: Vec<ConnId> = self.transports.keys().copied().collect();
        for id in ids {
            self.service_reads(id);
        }

        self.flush_all();

        let transports = &mut self.transports;
        let stalled = self
            .engine
            .flush_deliveries(|conn, message| match transports.get_mut(&conn) {
                Some(transport) => transport.try_deliver(message),
                None => Delivery::NotReady,
            });
        for conn in stalled {
            self.drop_transport(conn);
        }

        self.enforce_output_limit();
        self.evict_idle();
    }

    fn service_reads(&mut self, id: ConnId) {
        let Some(transport) = self.transports.get_mut(&id) else {
            return;
        };
        let status = match transport.read_available() {
            Ok(status) => status,
            Err(err) => {
                debug!(conn = id, error = %err, "read failed");
                self.remove(id, "transport error");
                return;
            }
        };

        while let Some(decoded) = self.transports.get_mut(&id).and_then(Transport::next_frame) {
            let effects = match decoded {
                Ok(message) => self.engine.on_message(id, message),
                Err(err) => self.engine.on_framing_error(id, err),
            };
            self.apply(effects);
            if !self.engine.is_connected(id) {
                self.drop_transport(id);
                return;
            }
        }

        if status == ReadStatus::Closed {
            self.remove(id, "peer closed");
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { conn, frame } => {
                    let Some(transport) = self.transports.get_mut(&conn) else {
                        continue;
                    };
                    if let Err(err) = transport.queue(&frame) {
                        // The client still expects one reply per request.
                        warn!(conn, error = %err, "reply not sent");
                        let fallback = Response::bad_request(format!("reply not sent: {err}"));
                        if let Err(err) = transport.queue(&fallback) {
                            warn!(conn, error = %err, "failed to encode frame");
                        }
                    }
                }
                Effect::Close { conn } => self.drop_transport(conn),
            }
        }
    }

    fn flush_all(&mut self) {
        let failed: Vec<ConnId> = self
            .transports
            .iter_mut()
            .filter_map(|(id, transport)| match transport.flush() {
                Ok(()) => None,
                Err(err) => {
                    debug!(conn = id, error = %err, "write failed");
                    Some(*id)
                }
            })
            .collect();
        for id in failed {
            self.remove(id, "transport error");
        }
    }

    fn enforce_output_limit(&mut self) {
        let limit = self.limits.max_pending_output;
        let overflowing: Vec<ConnId> = self
            .transports
            .iter()
            .filter(|(_, transport)| transport.pending_output() > limit)
            .map(|(id, _)| *id)
            .collect();
        for id in overflowing {
            warn!(conn = id, limit, "output backlog exceeded");
            self.remove(id, "output backlog exceeded");
        }
    }

    fn evict_idle(&mut self) {
        let Some(timeout) = self.limits.idle_timeout else {
            return;
        };
        for id in self.engine.idle_connections(Instant::now(), timeout) {
            self.remove(id, "idle timeout");
        }
    }

    /// Session removal: forget the connection in the engine, then close it.
    fn remove(&mut self, id: ConnId, reason: &str) {
        self.engine.disconnect(id, reason);
        self.drop_transport(id);
    }

    /// Closes the socket after a last non-blocking attempt to flush replies.
    fn drop_transport(&mut self, id: ConnId) {
        if let Some(mut transport) = self.transports.remove(&id) {
            let _ = transport.flush();
            debug!(conn = id, peer = %transport.peer(), "closed connection");
        }
    }

    fn shutdown(&mut self) {
        info!(connections = self.transports.len(), "relay shutting down");
        for id in self.engine.disconnect_all("relay shutdown") {
            self.drop_transport(id);
        }
        self.transports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth;
    use crate::codec::{DEFAULT_MAX_FRAME_LEN, FrameReader, Message};
    use crate::protocol::{AUTH_CHALLENGE, BAD_REQUEST, Inbound, Outbound};
    use crate::store::MemoryStore;
    use serde_json::{Value, json};
    use tokio::time::timeout;

    fn limits(max_frame_len: usize, max_pending_output: usize) -> Limits {
        Limits {
            max_frame_len,
            max_pending_output,
            idle_timeout: None,
        }
    }

    fn message(value: Value) -> Message {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_users([(
            "alice",
            auth::password_hash("alice", "alice_pw"),
        )]))
    }

    /// Accepts one client as connection 1.
    async fn accept_one(store: Arc<MemoryStore>, limits: Limits) -> (Connections, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let mut connections = Connections {
            engine: Engine::new(store),
            transports: BTreeMap::new(),
            next_id: 1,
            limits,
        };
        connections.handle_accept(listener.accept().await);
        (connections, client)
    }

    /// Runs the handshake for `login` straight through the engine.
    fn log_in(connections: &mut Connections, conn: ConnId, login: &str) {
        let presence = message(json!({
            "action": "presence",
            "time": 1.0,
            "user": {"account_name": login, "public_key": "k"}
        }));
        let nonce = connections
            .engine
            .on_message(conn, presence)
            .into_iter()
            .find_map(|effect| match effect {
                Effect::Send {
                    frame: Outbound::Response(reply),
                    ..
                } if reply.response == AUTH_CHALLENGE => reply.data,
                _ => None,
            })
            .expect("challenge");
        let hash = auth::password_hash(login, &format!("{login}_pw"));
        let answer = message(json!({
            "response": AUTH_CHALLENGE,
            "data": auth::encoded_challenge_response(&hash, &nonce)
        }));
        connections.engine.on_message(conn, answer);
        assert!(connections.engine.is_online(login));
    }

    fn send_list(connections: &mut Connections, conn: ConnId, item: String) {
        connections.apply(vec![Effect::Send {
            conn,
            frame: Response::list(vec![item]).into(),
        }]);
    }

    #[tokio::test]
    async fn output_backlog_past_limit_logs_out() {
        let store = store();
        let (mut connections, _client) =
            accept_one(store.clone(), limits(DEFAULT_MAX_FRAME_LEN, 256)).await;
        log_in(&mut connections, 1, "alice");
        assert_eq!(store.active_users().unwrap().len(), 1);

        send_list(&mut connections, 1, "x".repeat(100));
        connections.enforce_output_limit();
        assert!(connections.transports.contains_key(&1));

        send_list(&mut connections, 1, "y".repeat(400));
        connections.enforce_output_limit();
        assert!(connections.transports.is_empty());
        assert!(!connections.engine.is_connected(1));
        assert!(store.active_users().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_reply_becomes_error_reply() {
        let (mut connections, client) = accept_one(store(), limits(128, 1 << 20)).await;

        send_list(&mut connections, 1, "x".repeat(500));
        timeout(Duration::from_secs(2), connections.readiness())
            .await
            .unwrap();
        connections.flush_all();

        let mut reader = FrameReader::with_limit(client, 128);
        let frame = timeout(Duration::from_secs(2), reader.next_message())
            .await
            .unwrap()
            .unwrap()
            .expect("a reply");
        let Inbound::Reply(reply) = Inbound::from_message(frame).unwrap() else {
            panic!("expected a reply");
        };
        assert_eq!(reply.response, BAD_REQUEST);
        assert!(reply.error.unwrap_or_default().contains("exceeds frame limit"));
    }
}
