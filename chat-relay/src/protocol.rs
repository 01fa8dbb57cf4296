//! Typed wire model.
//!
//! Client requests carry an `action` tag and are parsed into [`Request`].
//! Server answers, and the client's challenge reply, are [`Response`]s
//! identified by a numeric `response` code. [`Inbound`] tells the two apart.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::codec::Message;

pub const OK: u16 = 200;
pub const ACCEPTED: u16 = 202;
pub const BAD_REQUEST: u16 = 400;
pub const AUTH_CHALLENGE: u16 = 511;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub account_name: String,
    pub public_key: String,
}

/// A routed chat message. Forwarded to the recipient field-for-field.
///
/// `time` keeps the sender's JSON number as written, so an integer timestamp
/// is not re-rendered as a float.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub from: String,
    pub to: String,
    pub time: Number,
    pub msg_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Presence {
        time: f64,
        user: UserInfo,
    },
    #[serde(rename = "msg")]
    Message(ChatMessage),
    GetContacts {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        user: String,
    },
    AddContact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        user: String,
        account_name: String,
    },
    #[serde(rename = "del_contact")]
    DeleteContact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        user: String,
        account_name: String,
    },
    #[serde(rename = "get_users")]
    UsersRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        account_name: String,
    },
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        account_name: String,
    },
}

impl Request {
    /// The login a request claims to act for, if it names one.
    pub fn claimed_login(&self) -> Option<&str> {
        match self {
            Request::Presence { user, .. } => Some(&user.account_name),
            Request::Message(chat) => Some(&chat.from),
            Request::GetContacts { user, .. }
            | Request::AddContact { user, .. }
            | Request::DeleteContact { user, .. } => Some(user),
            Request::UsersRequest { account_name, .. } | Request::Exit { account_name, .. } => {
                Some(account_name)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Presence { .. } => "presence",
            Request::Message(_) => "msg",
            Request::GetContacts { .. } => "get_contacts",
            Request::AddContact { .. } => "add_contact",
            Request::DeleteContact { .. } => "del_contact",
            Request::UsersRequest { .. } => "get_users",
            Request::Exit { .. } => "exit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub response: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_list: Option<Vec<String>>,
}

impl Response {
    fn with_code(response: u16) -> Self {
        Self {
            response,
            error: None,
            data: None,
            data_list: None,
        }
    }

    pub fn ok() -> Self {
        Self::with_code(OK)
    }

    pub fn list(items: Vec<String>) -> Self {
        Self {
            data_list: Some(items),
            ..Self::with_code(ACCEPTED)
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_code(BAD_REQUEST)
        }
    }

    /// Server challenge carrying the nonce, or the client's digest reply.
    pub fn challenge(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::with_code(AUTH_CHALLENGE)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.response == OK
    }
}

/// Anything the relay writes to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Outbound {
    Response(Response),
    Chat(Request),
}

impl From<Response> for Outbound {
    fn from(response: Response) -> Self {
        Outbound::Response(response)
    }
}

impl From<ChatMessage> for Outbound {
    fn from(message: ChatMessage) -> Self {
        Outbound::Chat(Request::Message(message))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message carries neither an action nor a response code")]
    Unrecognized,

    #[error("malformed {kind} message: {reason}")]
    InvalidShape { kind: String, reason: String },
}

/// A decoded frame classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Request),
    Reply(Response),
}

impl Inbound {
    pub fn from_message(message: Message) -> Result<Self, ProtocolError> {
        if let Some(action) = message.get("action") {
            let kind = action.as_str().unwrap_or("action").to_string();
            return serde_json::from_value(Value::Object(message))
                .map(Inbound::Request)
                .map_err(|err| ProtocolError::InvalidShape {
                    kind,
                    reason: err.to_string(),
                });
        }

        if message.contains_key("response") {
            return serde_json::from_value(Value::Object(message))
                .map(Inbound::Reply)
                .map_err(|err| ProtocolError::InvalidShape {
                    kind: "response".to_string(),
                    reason: err.to_string(),
                });
        }

        Err(ProtocolError::Unrecognized)
    }
}
