//! `graphql-transport-ws` protocol handling
//!
//! [`ProtocolSession`] is the per-connection state machine: it consumes client
//! frames and answers with [`Reply`] values, leaving socket I/O, keep-alive and
//! timers to the transport.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use pulse_events::{LiveEvent, LiveEventKind};

use crate::error::SubscribeError;
use crate::filter::SubscriptionArgs;
use crate::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::session::{ConnectionSession, ConnectionSessionManager};

/// Websocket sub-protocol name
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

/// Close codes defined by the protocol
pub mod close_code {
    pub const BAD_REQUEST: u16 = 4400;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const INIT_TIMEOUT: u16 = 4408;
    pub const SUBSCRIBER_EXISTS: u16 = 4409;
    pub const TOO_MANY_INIT: u16 = 4429;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default)]
    pub operation_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Complete {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        payload: Vec<GraphQlError>,
    },
    Complete {
        id: String,
    },
}

impl ServerMessage {
    pub fn next(id: &str, event: &LiveEvent) -> Self {
        ServerMessage::Next {
            id: id.to_string(),
            payload: json!({ "data": event.to_data() }),
        }
    }

    fn error(id: &str, message: impl Into<String>, code: &str) -> Self {
        ServerMessage::Error {
            id: id.to_string(),
            payload: vec![GraphQlError {
                message: message.into(),
                extensions: Some(json!({ "code": code })),
            }],
        }
    }
}

/// What the transport should do in response to a frame
#[derive(Debug)]
pub enum Reply {
    Send(ServerMessage),
    /// Start forwarding `receiver` as `next` frames for operation `id`
    Subscribed {
        id: String,
        subscription_id: String,
        receiver: mpsc::Receiver<LiveEvent>,
    },
    Close { code: u16, reason: String },
}

impl Reply {
    fn close(code: u16, reason: impl Into<String>) -> Self {
        Reply::Close {
            code,
            reason: reason.into(),
        }
    }
}

/// A parsed subscription operation
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: LiveEventKind,
    pub args: SubscriptionArgs,
}

/// Per-connection protocol state
pub struct ProtocolSession {
    sessions: Arc<ConnectionSessionManager>,
    registry: Arc<SubscriptionRegistry>,
    session: Option<ConnectionSession>,
    active: HashMap<String, SubscriptionHandle>,
}

impl ProtocolSession {
    pub fn new(sessions: Arc<ConnectionSessionManager>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            sessions,
            registry,
            session: None,
            active: HashMap::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    pub fn active_operations(&self) -> usize {
        self.active.len()
    }

    /// Handle one text frame from the client
    pub async fn on_text(&mut self, text: &str) -> Vec<Reply> {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!("Unparseable frame: {}", e);
                return vec![Reply::close(close_code::BAD_REQUEST, "Invalid message received")];
            }
        };

        match message {
            ClientMessage::ConnectionInit { payload } => {
                if self.session.is_some() {
                    return vec![Reply::close(close_code::TOO_MANY_INIT, "Too many initialisation requests")];
                }
                let params = payload.unwrap_or(Value::Null);
                self.session = Some(self.sessions.open(&params).await);
                vec![Reply::Send(ServerMessage::ConnectionAck { payload: None })]
            }
            ClientMessage::Ping { payload } => vec![Reply::Send(ServerMessage::Pong { payload })],
            ClientMessage::Pong { .. } => Vec::new(),
            ClientMessage::Subscribe { id, payload } => self.subscribe(id, payload),
            ClientMessage::Complete { id } => {
                if self.active.remove(&id).is_some() {
                    debug!(operation = %id, "Client completed operation");
                }
                Vec::new()
            }
        }
    }

    fn subscribe(&mut self, id: String, payload: SubscribePayload) -> Vec<Reply> {
        let Some(session) = &self.session else {
            return vec![Reply::close(close_code::UNAUTHORIZED, "Unauthorized")];
        };
        if self.active.contains_key(&id) {
            return vec![Reply::close(
                close_code::SUBSCRIBER_EXISTS,
                format!("Subscriber for {} already exists", id),
            )];
        }

        let subscribed = parse_operation(&payload.query, payload.variables.as_ref())
            .map_err(SubscribeError::UnknownOperation)
            .and_then(|operation| {
                let kind = operation.kind;
                self.registry
                    .subscribe(session, kind, operation.args)
                    .map(|subscriber| (kind, subscriber))
            });

        match subscribed {
            Ok((kind, subscriber)) => {
                let subscription_id = subscriber.handle.id().to_string();
                info!(
                    connection = %session.connection_id,
                    operation = %id,
                    kind = %kind,
                    "Subscription started"
                );
                self.active.insert(id.clone(), subscriber.handle);
                vec![Reply::Subscribed {
                    id,
                    subscription_id,
                    receiver: subscriber.receiver,
                }]
            }
            Err(e) => {
                let code = match e {
                    SubscribeError::Unauthenticated => "UNAUTHENTICATED",
                    SubscribeError::Forbidden { .. } => "FORBIDDEN",
                    SubscribeError::UnknownOperation(_) => "BAD_USER_INPUT",
                };
                vec![Reply::Send(ServerMessage::error(&id, e.to_string(), code))]
            }
        }
    }

    /// A forwarding stream ended. If the operation is still active the server
    /// ended it, and the client is told with `complete`.
    pub fn on_stream_end(&mut self, subscription_id: &str) -> Option<ServerMessage> {
        let id = self
            .active
            .iter()
            .find(|(_, handle)| handle.id() == subscription_id)
            .map(|(id, _)| id.clone())?;
        self.active.remove(&id);
        Some(ServerMessage::Complete { id })
    }

    /// Connection teardown: end every subscription of this connection
    pub fn close(&mut self) {
        self.active.clear();
        if let Some(session) = &self.session {
            self.registry.close_connection(&session.connection_id);
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse the selected field (and inline `conversationId` argument) of a
/// subscription document. `variables.conversationId` fills in when no inline
/// argument is given.
pub fn parse_operation(query: &str, variables: Option<&Value>) -> Result<Operation, String> {
    let source = query
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n");

    let open = source.find('{').ok_or("Missing selection set")?;
    if !source[..open].trim_start().starts_with("subscription") {
        return Err("Only subscription operations are supported".to_string());
    }

    let mut cursor = Cursor::new(&source[open + 1..]);
    let mut field = cursor.ident().ok_or("Missing subscription field")?;
    if cursor.eat(':') {
        field = cursor.ident().ok_or("Missing field after alias")?;
    }
    let kind = field.parse::<LiveEventKind>()?;

    let mut args = SubscriptionArgs::default();
    if cursor.eat('(') {
        while !cursor.eat(')') {
            let name = cursor.ident().ok_or("Malformed arguments")?;
            if !cursor.eat(':') {
                return Err(format!("Missing value for argument {}", name));
            }
            let value = cursor.value(variables)?;
            if name == "conversationId" {
                args.conversation_id = value;
            }
        }
    }

    if args.conversation_id.is_none() {
        args.conversation_id = variables
            .and_then(|v| v.get("conversationId"))
            .and_then(scalar_string);
    }

    Ok(Operation { kind, args })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    /// Commas are insignificant in GraphQL
    fn skip_ignored(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace() || c == ',') {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ignored();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Option<String> {
        self.skip_ignored();
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let ident: String = self.chars[start..self.pos].iter().collect();
        match ident.chars().next() {
            Some(c) if !c.is_ascii_digit() => Some(ident),
            _ => None,
        }
    }

    fn value(&mut self, variables: Option<&Value>) -> Result<Option<String>, String> {
        self.skip_ignored();
        match self.peek() {
            Some('"') => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.peek() {
                        Some('"') => {
                            self.pos += 1;
                            return Ok(Some(out));
                        }
                        Some('\\') => {
                            self.pos += 1;
                            if let Some(c) = self.peek() {
                                out.push(c);
                                self.pos += 1;
                            }
                        }
                        Some(c) => {
                            out.push(c);
                            self.pos += 1;
                        }
                        None => return Err("Unterminated string".to_string()),
                    }
                }
            }
            Some('$') => {
                self.pos += 1;
                let name = self.ident().ok_or("Malformed variable")?;
                Ok(variables
                    .and_then(|v| v.get(&name))
                    .and_then(scalar_string))
            }
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '-' || c == '.') {
                    self.pos += 1;
                }
                Ok(Some(self.chars[start..self.pos].iter().collect()))
            }
            _ => match self.ident() {
                Some(word) if word == "null" => Ok(None),
                Some(word) => Ok(Some(word)),
                None => Err("Malformed argument value".to_string()),
            },
        }
    }
}
