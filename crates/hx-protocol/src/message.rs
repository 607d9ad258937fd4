//! Message types for the hepx protocol
//!
//! Every wire record is one variant of the closed [`Message`] union. Each
//! variant owns a one-byte tag ([`MessageType`]) fixed here; the frame header
//! carries the tag and decoding dispatches on it, never on payload inspection.
//!
//! # Message Flow
//!
//! 1. Client dials and sends `Login`, server answers `LoginResponse`
//! 2. Client registers tunnels with `NewProxy`, server answers `NewProxyResponse`
//! 3. Client sends `Ping` periodically, server answers `Pong`
//! 4. When a user reaches a tunnel the server sends `ReqWorkConnection`; the
//!    client dials a new stream, sends `NewWorkConnection`, and the server
//!    answers on that stream with `StartWorkConnection` once it is paired
//! 5. Visitors of secret tunnels dial in with `NewVisitorConnection` and get
//!    `NewVisitorConnectionResponse`
//! 6. `CloseProxy` withdraws a tunnel

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Current protocol version string, sent in `Login` and `LoginResponse`.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client login
    Login = b'o',
    /// Login result
    LoginResponse = b'1',
    /// Register a proxy
    NewProxy = b'p',
    /// Proxy registration result
    NewProxyResponse = b'2',
    /// Withdraw a proxy
    CloseProxy = b'c',
    /// First message on a client-dialed work connection
    NewWorkConnection = b'w',
    /// Server asks the client for a work connection
    ReqWorkConnection = b'r',
    /// Server hands a paired work connection to the client
    StartWorkConnection = b's',
    /// First message on a visitor connection
    NewVisitorConnection = b'v',
    /// Visitor connection result
    NewVisitorConnectionResponse = b'3',
    /// Heartbeat
    Ping = b'h',
    /// Heartbeat answer
    Pong = b'4',
}

impl MessageType {
    /// All known message types
    pub const ALL: [MessageType; 12] = [
        MessageType::Login,
        MessageType::LoginResponse,
        MessageType::NewProxy,
        MessageType::NewProxyResponse,
        MessageType::CloseProxy,
        MessageType::NewWorkConnection,
        MessageType::ReqWorkConnection,
        MessageType::StartWorkConnection,
        MessageType::NewVisitorConnection,
        MessageType::NewVisitorConnectionResponse,
        MessageType::Ping,
        MessageType::Pong,
    ];

    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_u8() == value)
    }
}

/// Capability flags declared by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSpec {
    /// Ask the server to skip auth; honored only on internal transports
    pub always_auth_pass: bool,
}

/// Client login
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Login {
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub user: String,
    pub privilege_key: String,
    pub timestamp: i64,
    /// Empty for a fresh client; the server assigns one
    pub run_id: String,
    pub client_spec: ClientSpec,
    pub metas: BTreeMap<String, String>,
    /// Number of work connections the server should request up front
    pub pool_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResponse {
    pub version: String,
    pub run_id: String,
    /// Empty on success
    pub error: String,
}

/// Proxy type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Tcp,
    Stcp,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Stcp => "stcp",
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for a plain TCP tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpProxyOptions {
    /// Public port on the server; 0 lets the server choose
    pub remote_port: u16,
}

/// Options for a secret TCP tunnel reachable only through visitors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StcpProxyOptions {
    pub secret_key: String,
    /// Users allowed to visit besides the owner; `*` allows everyone
    pub allow_users: Vec<String>,
}

/// Type-specific proxy options, keyed by the `type` field.
///
/// Unknown `type` values fail deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyOptions {
    Tcp(TcpProxyOptions),
    Stcp(StcpProxyOptions),
}

impl ProxyOptions {
    pub fn proxy_type(&self) -> ProxyType {
        match self {
            ProxyOptions::Tcp(_) => ProxyType::Tcp,
            ProxyOptions::Stcp(_) => ProxyType::Stcp,
        }
    }
}

/// Register a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProxy {
    pub proxy_name: String,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(flatten)]
    pub options: ProxyOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProxyResponse {
    pub proxy_name: String,
    pub remote_addr: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseProxy {
    pub proxy_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWorkConnection {
    pub run_id: String,
    pub privilege_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqWorkConnection {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartWorkConnection {
    pub proxy_name: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewVisitorConnection {
    pub run_id: String,
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    pub use_encryption: bool,
    pub use_compression: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewVisitorConnectionResponse {
    pub proxy_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    pub privilege_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pong {
    pub error: String,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login(Login),
    LoginResponse(LoginResponse),
    NewProxy(NewProxy),
    NewProxyResponse(NewProxyResponse),
    CloseProxy(CloseProxy),
    NewWorkConnection(NewWorkConnection),
    ReqWorkConnection(ReqWorkConnection),
    StartWorkConnection(StartWorkConnection),
    NewVisitorConnection(NewVisitorConnection),
    NewVisitorConnectionResponse(NewVisitorConnectionResponse),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Login(_) => MessageType::Login,
            Message::LoginResponse(_) => MessageType::LoginResponse,
            Message::NewProxy(_) => MessageType::NewProxy,
            Message::NewProxyResponse(_) => MessageType::NewProxyResponse,
            Message::CloseProxy(_) => MessageType::CloseProxy,
            Message::NewWorkConnection(_) => MessageType::NewWorkConnection,
            Message::ReqWorkConnection(_) => MessageType::ReqWorkConnection,
            Message::StartWorkConnection(_) => MessageType::StartWorkConnection,
            Message::NewVisitorConnection(_) => MessageType::NewVisitorConnection,
            Message::NewVisitorConnectionResponse(_) => MessageType::NewVisitorConnectionResponse,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
        }
    }

    /// Serialize the variant body (without the tag)
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Message::Login(m) => serde_json::to_vec(m)?,
            Message::LoginResponse(m) => serde_json::to_vec(m)?,
            Message::NewProxy(m) => serde_json::to_vec(m)?,
            Message::NewProxyResponse(m) => serde_json::to_vec(m)?,
            Message::CloseProxy(m) => serde_json::to_vec(m)?,
            Message::NewWorkConnection(m) => serde_json::to_vec(m)?,
            Message::ReqWorkConnection(m) => serde_json::to_vec(m)?,
            Message::StartWorkConnection(m) => serde_json::to_vec(m)?,
            Message::NewVisitorConnection(m) => serde_json::to_vec(m)?,
            Message::NewVisitorConnectionResponse(m) => serde_json::to_vec(m)?,
            Message::Ping(m) => serde_json::to_vec(m)?,
            Message::Pong(m) => serde_json::to_vec(m)?,
        };
        Ok(payload)
    }

    /// Deserialize a variant body selected by its tag
    pub fn decode_payload(message_type: MessageType, payload: &[u8]) -> Result<Self, ProtocolError> {
        let message = match message_type {
            MessageType::Login => Message::Login(serde_json::from_slice(payload)?),
            MessageType::LoginResponse => Message::LoginResponse(serde_json::from_slice(payload)?),
            MessageType::NewProxy => Message::NewProxy(serde_json::from_slice(payload)?),
            MessageType::NewProxyResponse => {
                Message::NewProxyResponse(serde_json::from_slice(payload)?)
            }
            MessageType::CloseProxy => Message::CloseProxy(serde_json::from_slice(payload)?),
            MessageType::NewWorkConnection => {
                Message::NewWorkConnection(serde_json::from_slice(payload)?)
            }
            MessageType::ReqWorkConnection => {
                Message::ReqWorkConnection(serde_json::from_slice(payload)?)
            }
            MessageType::StartWorkConnection => {
                Message::StartWorkConnection(serde_json::from_slice(payload)?)
            }
            MessageType::NewVisitorConnection => {
                Message::NewVisitorConnection(serde_json::from_slice(payload)?)
            }
            MessageType::NewVisitorConnectionResponse => {
                Message::NewVisitorConnectionResponse(serde_json::from_slice(payload)?)
            }
            MessageType::Ping => Message::Ping(serde_json::from_slice(payload)?),
            MessageType::Pong => Message::Pong(serde_json::from_slice(payload)?),
        };
        Ok(message)
    }
}

macro_rules! impl_from_body {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(body: $variant) -> Self {
                    Message::$variant(body)
                }
            }
        )*
    };
}

impl_from_body!(
    Login,
    LoginResponse,
    NewProxy,
    NewProxyResponse,
    CloseProxy,
    NewWorkConnection,
    ReqWorkConnection,
    StartWorkConnection,
    NewVisitorConnection,
    NewVisitorConnectionResponse,
    Ping,
    Pong,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in MessageType::ALL {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
        assert_eq!(MessageType::from_u8(0x00), None);
    }

    #[test]
    fn test_tags_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for msg_type in MessageType::ALL {
            assert!(seen.insert(msg_type.as_u8()), "duplicate tag {:?}", msg_type);
        }
    }

    #[test]
    fn test_new_proxy_options_keyed_by_type() {
        let json = r#"{"proxy_name":"ssh","type":"tcp","remote_port":6000}"#;
        let msg: NewProxy = serde_json::from_str(json).unwrap();
        assert_eq!(msg.proxy_name, "ssh");
        assert_eq!(
            msg.options,
            ProxyOptions::Tcp(TcpProxyOptions { remote_port: 6000 })
        );
        assert_eq!(msg.options.proxy_type(), ProxyType::Tcp);
    }

    #[test]
    fn test_unknown_proxy_type_is_decode_error() {
        let payload = br#"{"proxy_name":"web","type":"gopher"}"#;
        let result = Message::decode_payload(MessageType::NewProxy, payload);
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[test]
    fn test_missing_proxy_type_is_decode_error() {
        let payload = br#"{"proxy_name":"web","remote_port":80}"#;
        assert!(Message::decode_payload(MessageType::NewProxy, payload).is_err());
    }

    #[test]
    fn test_from_body() {
        let msg: Message = Ping::default().into();
        assert_eq!(msg.message_type(), MessageType::Ping);
    }
}
