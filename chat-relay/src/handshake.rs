//! Per-connection authentication state machine.
//!
//! ```text
//! NEW --presence--> AWAITING_CHALLENGE_RESPONSE --valid digest--> AUTHENTICATED
//!  |                          |
//!  +--taken/unknown login-----+--bad digest / bad shape--> REJECTED
//! ```
//!
//! The machine only decides. Registering the session and writing replies is
//! left to the caller, which owns the session table and the socket.

use std::fmt;

use tracing::debug;

use crate::auth;
use crate::protocol::{AUTH_CHALLENGE, Inbound, ProtocolError, Request, Response};
use crate::session::SessionTable;
use crate::store::CredentialStore;

/// Protocol violations tolerated in `NEW` before the connection is rejected.
const NEW_STATE_RETRIES: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    LoginTaken,
    UnknownUser,
    BadCredentials,
    BadRequest,
    StoreUnavailable,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Rejection::LoginTaken => "LOGIN_TAKEN",
            Rejection::UnknownUser => "UNKNOWN_USER",
            Rejection::BadCredentials => "BAD_CREDENTIALS",
            Rejection::BadRequest => "BAD_REQUEST",
            Rejection::StoreUnavailable => "STORE_UNAVAILABLE",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    AwaitingChallengeResponse,
    Authenticated,
    Rejected,
}

/// Context kept between PRESENCE and the challenge reply.
#[derive(Debug)]
struct PendingChallenge {
    login: String,
    public_key: String,
    password_hash: String,
    nonce: String,
}

#[derive(Debug)]
enum State {
    New { retries_left: u8 },
    AwaitingChallengeResponse(PendingChallenge),
    Authenticated,
    Rejected,
}

/// What the caller must do after feeding the machine one message.
#[derive(Debug, PartialEq)]
pub enum HandshakeStep {
    /// Answer and keep waiting for a PRESENCE.
    Retry(Response),
    /// Send the nonce challenge.
    Challenge(Response),
    /// Digest checked out; register the session and reply OK.
    Verified { login: String, public_key: String },
    /// Answer once, then close the connection.
    Rejected { reason: Rejection, reply: Response },
}

#[derive(Debug)]
pub struct Handshake {
    state: State,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: State::New {
                retries_left: NEW_STATE_RETRIES,
            },
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::New { .. } => Phase::New,
            State::AwaitingChallengeResponse(_) => Phase::AwaitingChallengeResponse,
            State::Authenticated => Phase::Authenticated,
            State::Rejected => Phase::Rejected,
        }
    }

    /// Nonce issued to this connection, while one is outstanding.
    pub fn nonce(&self) -> Option<&str> {
        match &self.state {
            State::AwaitingChallengeResponse(pending) => Some(&pending.nonce),
            _ => None,
        }
    }

    /// Marks a verified handshake as rejected after the fact, e.g. when the
    /// login was claimed by another connection in the meantime.
    pub fn reject(&mut self) {
        self.state = State::Rejected;
    }

    pub fn advance(
        &mut self,
        inbound: Result<Inbound, ProtocolError>,
        sessions: &SessionTable,
        store: &dyn CredentialStore,
    ) -> HandshakeStep {
        let state = std::mem::replace(&mut self.state, State::Rejected);
        let (next, step) = match state {
            State::New { retries_left } => on_new(retries_left, inbound, sessions, store),
            State::AwaitingChallengeResponse(pending) => on_challenge_reply(pending, inbound),
            State::Authenticated | State::Rejected => (
                State::Rejected,
                reject(Rejection::BadRequest, "handshake already finished"),
            ),
        };
        self.state = next;
        step
    }
}

fn reject(reason: Rejection, error: impl Into<String>) -> HandshakeStep {
    HandshakeStep::Rejected {
        reason,
        reply: Response::bad_request(error),
    }
}

fn on_new(
    retries_left: u8,
    inbound: Result<Inbound, ProtocolError>,
    sessions: &SessionTable,
    store: &dyn CredentialStore,
) -> (State, HandshakeStep) {
    let violation = match inbound {
        Ok(Inbound::Request(Request::Presence { user, .. })) => {
            let login = user.account_name.as_str();
            if login.is_empty() {
                "account name cannot be empty".to_string()
            } else if login.trim() != login {
                // Later requests are matched against the login byte for byte.
                format!("account name '{login}' has surrounding whitespace")
            } else {
                return on_presence(login, user.public_key, sessions, store);
            }
        }
        Ok(Inbound::Request(other)) => format!("{} requires authentication", other.kind()),
        Ok(Inbound::Reply(_)) => "unexpected response before presence".to_string(),
        Err(err) => err.to_string(),
    };

    if retries_left == 0 {
        return (State::Rejected, reject(Rejection::BadRequest, violation));
    }
    (
        State::New {
            retries_left: retries_left - 1,
        },
        HandshakeStep::Retry(Response::bad_request(violation)),
    )
}

fn on_presence(
    login: &str,
    public_key: String,
    sessions: &SessionTable,
    store: &dyn CredentialStore,
) -> (State, HandshakeStep) {
    if sessions.is_online(login) {
        return (
            State::Rejected,
            reject(
                Rejection::LoginTaken,
                format!("login '{login}' is already in use"),
            ),
        );
    }

    let password_hash = match store.hash_for(login) {
        Ok(Some(hash)) => hash,
        Ok(None) => {
            return (
                State::Rejected,
                reject(Rejection::UnknownUser, format!("unknown user '{login}'")),
            );
        }
        Err(err) => {
            return (
                State::Rejected,
                reject(Rejection::StoreUnavailable, err.to_string()),
            );
        }
    };

    let nonce = auth::new_nonce();
    debug!(login, "issuing authentication challenge");
    let challenge = Response::challenge(nonce.clone());
    (
        State::AwaitingChallengeResponse(PendingChallenge {
            login: login.to_string(),
            public_key,
            password_hash,
            nonce,
        }),
        HandshakeStep::Challenge(challenge),
    )
}

fn on_challenge_reply(
    pending: PendingChallenge,
    inbound: Result<Inbound, ProtocolError>,
) -> (State, HandshakeStep) {
    let digest = match inbound {
        Ok(Inbound::Reply(Response {
            response: AUTH_CHALLENGE,
            data: Some(data),
            ..
        })) => auth::decode_challenge_response(&data),
        _ => None,
    };

    let Some(digest) = digest else {
        return (
            State::Rejected,
            reject(Rejection::BadRequest, "expected challenge response"),
        );
    };

    if !auth::verify_challenge(&pending.password_hash, &pending.nonce, &digest) {
        return (
            State::Rejected,
            reject(Rejection::BadCredentials, "invalid credentials"),
        );
    }

    (
        State::Authenticated,
        HandshakeStep::Verified {
            login: pending.login,
            public_key: pending.public_key,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, UserInfo};
    use crate::store::MemoryStore;
    use serde_json::Number;

    fn store() -> MemoryStore {
        MemoryStore::with_users([("alice", auth::password_hash("alice", "alice_pw"))])
    }

    fn presence(login: &str) -> Result<Inbound, ProtocolError> {
        Ok(Inbound::Request(Request::Presence {
            time: 1.0,
            user: UserInfo {
                account_name: login.into(),
                public_key: "k".into(),
            },
        }))
    }

    fn reply(data: String) -> Result<Inbound, ProtocolError> {
        Ok(Inbound::Reply(Response::challenge(data)))
    }

    fn challenged(handshake: &mut Handshake, store: &MemoryStore) -> String {
        let step = handshake.advance(presence("alice"), &SessionTable::new(), store);
        match step {
            HandshakeStep::Challenge(Response {
                response: AUTH_CHALLENGE,
                data: Some(nonce),
                ..
            }) => nonce,
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn correct_digest_verifies() {
        let store = store();
        let mut handshake = Handshake::new();
        let nonce = challenged(&mut handshake, &store);
        assert_eq!(handshake.phase(), Phase::AwaitingChallengeResponse);
        assert_eq!(handshake.nonce(), Some(nonce.as_str()));

        let hash = auth::password_hash("alice", "alice_pw");
        let step = handshake.advance(
            reply(auth::encoded_challenge_response(&hash, &nonce)),
            &SessionTable::new(),
            &store,
        );

        assert_eq!(
            step,
            HandshakeStep::Verified {
                login: "alice".into(),
                public_key: "k".into()
            }
        );
        assert_eq!(handshake.phase(), Phase::Authenticated);
        assert_eq!(handshake.nonce(), None);
    }

    #[test]
    fn wrong_password_is_bad_credentials() {
        let store = store();
        let mut handshake = Handshake::new();
        let nonce = challenged(&mut handshake, &store);

        let wrong = auth::password_hash("alice", "guess");
        let step = handshake.advance(
            reply(auth::encoded_challenge_response(&wrong, &nonce)),
            &SessionTable::new(),
            &store,
        );

        assert!(matches!(
            step,
            HandshakeStep::Rejected {
                reason: Rejection::BadCredentials,
                ..
            }
        ));
        assert_eq!(handshake.phase(), Phase::Rejected);
    }

    #[test]
    fn taken_login_is_rejected_before_challenge() {
        let mut sessions = SessionTable::new();
        sessions.register("alice", 99).unwrap();

        let mut handshake = Handshake::new();
        let step = handshake.advance(presence("alice"), &sessions, &store());
        assert!(matches!(
            step,
            HandshakeStep::Rejected {
                reason: Rejection::LoginTaken,
                ..
            }
        ));
    }

    #[test]
    fn unknown_login_is_rejected() {
        let mut handshake = Handshake::new();
        let step = handshake.advance(presence("mallory"), &SessionTable::new(), &store());
        match step {
            HandshakeStep::Rejected { reason, reply } => {
                assert_eq!(reason, Rejection::UnknownUser);
                assert_eq!(reply.response, crate::protocol::BAD_REQUEST);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn padded_login_is_a_violation() {
        let store = store();
        let mut handshake = Handshake::new();
        let step = handshake.advance(presence(" alice"), &SessionTable::new(), &store);
        match step {
            HandshakeStep::Retry(response) => {
                assert_eq!(response.response, 400);
                assert!(response.error.unwrap_or_default().contains("whitespace"));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(handshake.phase(), Phase::New);

        challenged(&mut handshake, &store);
        assert_eq!(handshake.phase(), Phase::AwaitingChallengeResponse);
    }

    #[test]
    fn new_state_allows_exactly_one_retry() {
        let store = store();
        let early = Ok(Inbound::Request(Request::Message(ChatMessage {
            from: "alice".into(),
            to: "bob".into(),
            time: Number::from(1),
            msg_text: "hi".into(),
        })));

        let mut handshake = Handshake::new();
        let first = handshake.advance(early.clone(), &SessionTable::new(), &store);
        assert!(matches!(first, HandshakeStep::Retry(ref r) if r.response == 400));
        assert_eq!(handshake.phase(), Phase::New);

        let second = handshake.advance(early, &SessionTable::new(), &store);
        assert!(matches!(
            second,
            HandshakeStep::Rejected {
                reason: Rejection::BadRequest,
                ..
            }
        ));
    }

    #[test]
    fn retry_then_presence_still_challenges() {
        let store = store();
        let mut handshake = Handshake::new();
        let step = handshake.advance(
            Err(ProtocolError::Unrecognized),
            &SessionTable::new(),
            &store,
        );
        assert!(matches!(step, HandshakeStep::Retry(_)));
        challenged(&mut handshake, &store);
    }

    #[test]
    fn anything_but_a_digest_while_awaiting_rejects() {
        let store = store();
        let mut handshake = Handshake::new();
        challenged(&mut handshake, &store);

        let step = handshake.advance(presence("alice"), &SessionTable::new(), &store);
        assert!(matches!(
            step,
            HandshakeStep::Rejected {
                reason: Rejection::BadRequest,
                ..
            }
        ));
    }

    #[test]
    fn undecodable_digest_rejects() {
        let store = store();
        let mut handshake = Handshake::new();
        challenged(&mut handshake, &store);

        let step = handshake.advance(reply("%%%".into()), &SessionTable::new(), &store);
        assert!(matches!(step, HandshakeStep::Rejected { .. }));
    }

    #[test]
    fn blank_login_counts_as_violation() {
        let mut handshake = Handshake::new();
        let step = handshake.advance(presence("   "), &SessionTable::new(), &store());
        assert!(matches!(step, HandshakeStep::Retry(_)));
    }
}
