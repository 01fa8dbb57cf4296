//! Socket-free protocol engine.
//!
//! The engine turns `(connection, decoded frame)` pairs into [`Effect`]s and
//! owns everything the multiplexer must mutate from a single task: the
//! per-connection handshake state, the [`SessionTable`] and the delivery
//! queue. The relay applies effects to real sockets; tests apply them to
//! nothing at all.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::codec::{FramingError, Message};
use crate::handshake::{Handshake, HandshakeStep, Rejection};
use crate::protocol::{ChatMessage, Inbound, Outbound, ProtocolError, Response};
use crate::router::{PendingMessage, Principal, Route, Router};
use crate::session::{ConnId, SessionError, SessionTable};
use crate::store::CredentialStore;

/// An action the socket owner must perform on behalf of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send { conn: ConnId, frame: Outbound },
    /// Flush what is already queued for `conn`, then drop it. The engine has
    /// already forgotten the connection.
    Close { conn: ConnId },
}

/// Outcome of one delivery attempt against a recipient's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    NotReady,
}

/// A live session as reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub login: String,
    pub conn: ConnId,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ConnState {
    peer: SocketAddr,
    login: Option<String>,
    handshake: Handshake,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
}

pub struct Engine {
    store: Arc<dyn CredentialStore>,
    sessions: SessionTable,
    conns: HashMap<ConnId, ConnState>,
    queue: VecDeque<PendingMessage>,
}

impl Engine {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            sessions: SessionTable::new(),
            conns: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn connect(&mut self, conn: ConnId, peer: SocketAddr) {
        debug!(conn, %peer, "tracking connection");
        self.conns.insert(
            conn,
            ConnState {
                peer,
                login: None,
                handshake: Handshake::new(),
                connected_at: Utc::now(),
                last_activity: Instant::now(),
            },
        );
    }

    pub fn is_connected(&self, conn: ConnId) -> bool {
        self.conns.contains_key(&conn)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn login_for(&self, conn: ConnId) -> Option<&str> {
        self.sessions.login_for(conn)
    }

    pub fn is_online(&self, login: &str) -> bool {
        self.sessions.is_online(login)
    }

    pub fn pending_deliveries(&self) -> usize {
        self.queue.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .logins()
            .into_iter()
            .filter_map(|login| {
                let conn = self.sessions.conn_for(&login)?;
                let state = self.conns.get(&conn)?;
                Some(SessionInfo {
                    login,
                    conn,
                    peer: state.peer,
                    connected_at: state.connected_at,
                })
            })
            .collect()
    }

    /// Feeds one decoded frame from `conn` through the handshake or router.
    pub fn on_message(&mut self, conn: ConnId, message: Message) -> Vec<Effect> {
        self.on_inbound(conn, Inbound::from_message(message))
    }

    /// Handles a frame that failed to decode. Incomplete frames are ignored,
    /// non-mapping frames are answered, malformed ones close the connection.
    pub fn on_framing_error(&mut self, conn: ConnId, err: FramingError) -> Vec<Effect> {
        match err {
            FramingError::IncompleteFrame { .. } => Vec::new(),
            FramingError::NotAMapping => self.on_inbound(
                conn,
                Err(ProtocolError::InvalidShape {
                    kind: "frame".to_string(),
                    reason: err.to_string(),
                }),
            ),
            FramingError::MalformedPayload(_) | FramingError::FrameTooLarge { .. } => {
                if self.disconnect(conn, &err.to_string()) {
                    vec![Effect::Close { conn }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn on_inbound(&mut self, conn: ConnId, inbound: Result<Inbound, ProtocolError>) -> Vec<Effect> {
        let Some(state) = self.conns.get_mut(&conn) else {
            return Vec::new();
        };
        state.last_activity = Instant::now();

        match state.login.clone() {
            Some(login) => self.on_authenticated(Principal { login, conn }, inbound),
            None => {
                let step = state
                    .handshake
                    .advance(inbound, &self.sessions, self.store.as_ref());
                self.on_handshake_step(conn, step)
            }
        }
    }

    fn on_handshake_step(&mut self, conn: ConnId, step: HandshakeStep) -> Vec<Effect> {
        match step {
            HandshakeStep::Retry(reply) | HandshakeStep::Challenge(reply) => {
                vec![send(conn, reply)]
            }
            HandshakeStep::Verified { login, public_key } => {
                self.accept_session(conn, login, public_key)
            }
            HandshakeStep::Rejected { reason, reply } => self.reject(conn, reason, reply),
        }
    }

    fn accept_session(&mut self, conn: ConnId, login: String, public_key: String) -> Vec<Effect> {
        if let Err(err) = self.sessions.register(&login, conn) {
            let reply = match &err {
                SessionError::LoginTaken(_) => Response::bad_request(err.to_string()),
                SessionError::ConnectionBound(_) => Response::bad_request("already authenticated"),
            };
            if let Some(state) = self.conns.get_mut(&conn) {
                state.handshake.reject();
            }
            return self.reject(conn, Rejection::LoginTaken, reply);
        }

        let Some(state) = self.conns.get_mut(&conn) else {
            return Vec::new();
        };
        state.login = Some(login.clone());
        let peer = state.peer;

        if let Err(err) = self.store.record_login(&login, peer, &public_key) {
            warn!(%login, error = %err, "failed to record login");
        }
        info!(%login, %peer, conn, "client authenticated");
        vec![send(conn, Response::ok())]
    }

    fn reject(&mut self, conn: ConnId, reason: Rejection, reply: Response) -> Vec<Effect> {
        let peer = self.conns.get(&conn).map(|state| state.peer);
        info!(conn, ?peer, %reason, "handshake rejected");
        self.disconnect(conn, &reason.to_string());
        vec![send(conn, reply), Effect::Close { conn }]
    }

    fn on_authenticated(
        &mut self,
        principal: Principal,
        inbound: Result<Inbound, ProtocolError>,
    ) -> Vec<Effect> {
        let conn = principal.conn;
        let request = match inbound {
            Ok(Inbound::Request(request)) => request,
            Ok(Inbound::Reply(_)) => {
                return vec![send(conn, Response::bad_request("unexpected response"))];
            }
            Err(err) => return vec![send(conn, Response::bad_request(err.to_string()))],
        };

        let route = Router::new(&self.sessions, self.store.as_ref()).route(&principal, request);
        match route {
            Route::Reply(reply) => vec![send(conn, reply)],
            Route::Deliver { pending, ack } => {
                debug!(
                    from = pending.sender(),
                    to = pending.recipient(),
                    "queued message"
                );
                self.queue.push_back(pending);
                vec![send(conn, ack)]
            }
            Route::Exit => {
                self.disconnect(conn, "exit");
                vec![Effect::Close { conn }]
            }
        }
    }

    /// Drains the delivery queue in FIFO order.
    ///
    /// `deliver` attempts a non-blocking write to the recipient. A recipient
    /// that is not write-ready loses its session; the message is dropped.
    /// Returns the connections torn down this way.
    pub fn flush_deliveries<F>(&mut self, mut deliver: F) -> Vec<ConnId>
    where
        F: FnMut(ConnId, &ChatMessage) -> Delivery,
    {
        let mut stalled = Vec::new();
        while let Some(pending) = self.queue.pop_front() {
            let Some(conn) = self.sessions.conn_for(pending.recipient()) else {
                warn!(
                    from = pending.sender(),
                    to = pending.recipient(),
                    "recipient left before delivery; message dropped"
                );
                continue;
            };

            match deliver(conn, &pending.message) {
                Delivery::Sent => {
                    info!(
                        from = pending.sender(),
                        to = pending.recipient(),
                        "message delivered"
                    );
                    if let Err(err) = self
                        .store
                        .record_delivery(pending.sender(), pending.recipient())
                    {
                        warn!(error = %err, "failed to record delivery");
                    }
                }
                Delivery::NotReady => {
                    warn!(
                        from = pending.sender(),
                        to = pending.recipient(),
                        conn,
                        "recipient not write-ready; message dropped"
                    );
                    self.disconnect(conn, "delivery failed");
                    stalled.push(conn);
                }
            }
        }
        stalled
    }

    /// Connections whose last activity is older than `timeout` at `now`.
    pub fn idle_connections(&self, now: Instant, timeout: Duration) -> Vec<ConnId> {
        let mut idle: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, state)| now.saturating_duration_since(state.last_activity) > timeout)
            .map(|(conn, _)| *conn)
            .collect();
        idle.sort_unstable();
        idle
    }

    /// Removes `conn` and its session, if any. Calling it again is a no-op.
    ///
    /// Returns whether the connection was still known.
    pub fn disconnect(&mut self, conn: ConnId, reason: &str) -> bool {
        let Some(state) = self.conns.remove(&conn) else {
            return false;
        };

        if let Some(login) = self.sessions.remove_conn(conn) {
            if let Err(err) = self.store.record_logout(&login) {
                warn!(%login, error = %err, "failed to record logout");
            }
            info!(%login, peer = %state.peer, conn, reason, "session removed");
        } else {
            debug!(peer = %state.peer, conn, reason, "connection dropped");
        }
        true
    }

    /// Removes every connection, recording logouts for live sessions.
    pub fn disconnect_all(&mut self, reason: &str) -> Vec<ConnId> {
        let mut conns: Vec<ConnId> = self.conns.keys().copied().collect();
        conns.sort_unstable();
        for conn in &conns {
            self.disconnect(*conn, reason);
        }
        self.queue.clear();
        conns
    }
}

fn send(conn: ConnId, response: Response) -> Effect {
    Effect::Send {
        conn,
        frame: response.into(),
    }
}
