//! Routing of authenticated requests.

use tracing::debug;

use crate::protocol::{ChatMessage, Request, Response};
use crate::session::{ConnId, SessionTable};
use crate::store::CredentialStore;

/// The authenticated identity a request arrived under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub login: String,
    pub conn: ConnId,
}

/// A chat message waiting for its recipient's next write-readiness pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub message: ChatMessage,
}

impl PendingMessage {
    pub fn sender(&self) -> &str {
        &self.message.from
    }

    pub fn recipient(&self) -> &str {
        &self.message.to
    }
}

#[derive(Debug, PartialEq)]
pub enum Route {
    /// Answer the sender directly.
    Reply(Response),
    /// Queue for delivery and acknowledge the sender.
    Deliver { pending: PendingMessage, ack: Response },
    /// End the sender's session without a reply.
    Exit,
}

pub struct Router<'a> {
    sessions: &'a SessionTable,
    store: &'a dyn CredentialStore,
}

impl<'a> Router<'a> {
    pub fn new(sessions: &'a SessionTable, store: &'a dyn CredentialStore) -> Self {
        Self { sessions, store }
    }

    pub fn route(&self, principal: &Principal, request: Request) -> Route {
        if let Some(claimed) = request.claimed_login() {
            if claimed != principal.login {
                debug!(
                    login = %principal.login,
                    claimed,
                    kind = request.kind(),
                    "request login does not match session"
                );
                return Route::Reply(Response::bad_request(format!(
                    "request is not permitted for '{claimed}'"
                )));
            }
        }

        debug!(login = %principal.login, kind = request.kind(), "routing request");
        match request {
            Request::Message(message) => self.route_message(message),
            Request::GetContacts { user, .. } => {
                self.answer(self.store.contacts_for(&user).map(Response::list))
            }
            Request::AddContact {
                user, account_name, ..
            } => self.answer(
                self.store
                    .add_contact(&user, &account_name)
                    .map(|()| Response::ok()),
            ),
            Request::DeleteContact {
                user, account_name, ..
            } => self.answer(
                self.store
                    .remove_contact(&user, &account_name)
                    .map(|()| Response::ok()),
            ),
            Request::UsersRequest { .. } => {
                self.answer(self.store.all_known_users().map(Response::list))
            }
            Request::Exit { .. } => Route::Exit,
            Request::Presence { .. } => Route::Reply(Response::bad_request("already authenticated")),
        }
    }

    fn route_message(&self, message: ChatMessage) -> Route {
        if !self.sessions.is_online(&message.to) {
            return Route::Reply(Response::bad_request(format!(
                "recipient '{}' is not registered",
                message.to
            )));
        }
        Route::Deliver {
            pending: PendingMessage { message },
            ack: Response::ok(),
        }
    }

    fn answer<E: std::fmt::Display>(&self, result: Result<Response, E>) -> Route {
        match result {
            Ok(response) => Route::Reply(response),
            Err(err) => Route::Reply(Response::bad_request(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ACCEPTED, BAD_REQUEST};
    use crate::store::MemoryStore;
    use serde_json::Number;

    struct Fixture {
        sessions: SessionTable,
        store: MemoryStore,
    }

    impl Fixture {
        fn new() -> Self {
            let mut sessions = SessionTable::new();
            sessions.register("alice", 1).unwrap();
            Self {
                sessions,
                store: MemoryStore::with_users([("alice", "h"), ("bob", "h"), ("carol", "h")]),
            }
        }

        fn route(&self, request: Request) -> Route {
            let alice = Principal {
                login: "alice".into(),
                conn: 1,
            };
            Router::new(&self.sessions, &self.store).route(&alice, request)
        }
    }

    fn chat(from: &str, to: &str) -> Request {
        Request::Message(ChatMessage {
            from: from.into(),
            to: to.into(),
            time: Number::from_f64(1700000000.5).unwrap(),
            msg_text: "hi".into(),
        })
    }

    #[test]
    fn message_to_offline_recipient_is_rejected() {
        let route = Fixture::new().route(chat("alice", "bob"));
        match route {
            Route::Reply(response) => {
                assert_eq!(response.response, BAD_REQUEST);
                assert!(response.error.unwrap().contains("bob"));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn message_to_online_recipient_is_queued_unchanged() {
        let mut fixture = Fixture::new();
        fixture.sessions.register("bob", 2).unwrap();

        let route = fixture.route(chat("alice", "bob"));
        let Route::Deliver { pending, ack } = route else {
            panic!("expected delivery");
        };
        assert!(ack.is_ok());
        assert_eq!(pending.sender(), "alice");
        assert_eq!(pending.recipient(), "bob");
        assert_eq!(Request::Message(pending.message), chat("alice", "bob"));
    }

    #[test]
    fn spoofed_sender_is_refused_at_the_boundary() {
        let mut fixture = Fixture::new();
        fixture.sessions.register("bob", 2).unwrap();

        let route = fixture.route(chat("bob", "alice"));
        assert!(matches!(route, Route::Reply(ref r) if r.response == BAD_REQUEST));

        let route = fixture.route(Request::GetContacts {
            time: None,
            user: "bob".into(),
        });
        assert!(matches!(route, Route::Reply(ref r) if r.response == BAD_REQUEST));
    }

    #[test]
    fn contact_requests_delegate_to_store() {
        let fixture = Fixture::new();
        let add = fixture.route(Request::AddContact {
            time: None,
            user: "alice".into(),
            account_name: "bob".into(),
        });
        assert_eq!(add, Route::Reply(Response::ok()));

        let list = fixture.route(Request::GetContacts {
            time: None,
            user: "alice".into(),
        });
        assert_eq!(list, Route::Reply(Response::list(vec!["bob".into()])));

        let delete = fixture.route(Request::DeleteContact {
            time: None,
            user: "alice".into(),
            account_name: "bob".into(),
        });
        assert_eq!(delete, Route::Reply(Response::ok()));
        assert!(fixture.store.contacts_for("alice").unwrap().is_empty());
    }

    #[test]
    fn users_request_lists_every_known_user() {
        let route = Fixture::new().route(Request::UsersRequest {
            time: None,
            account_name: "alice".into(),
        });
        match route {
            Route::Reply(response) => {
                assert_eq!(response.response, ACCEPTED);
                assert_eq!(
                    response.data_list.unwrap(),
                    vec!["alice", "bob", "carol"]
                );
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn exit_ends_session_silently() {
        let route = Fixture::new().route(Request::Exit {
            time: Some(2.0),
            account_name: "alice".into(),
        });
        assert_eq!(route, Route::Exit);
    }

    #[test]
    fn repeated_presence_is_a_bad_request() {
        let route = Fixture::new().route(Request::Presence {
            time: 1.0,
            user: crate::protocol::UserInfo {
                account_name: "alice".into(),
                public_key: "k".into(),
            },
        });
        assert!(matches!(route, Route::Reply(ref r) if r.response == BAD_REQUEST));
    }
}
