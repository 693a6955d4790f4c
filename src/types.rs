use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    Tls,
    Wss,
}

impl Transport {
    /// Datagram transports carry exactly one SIP message per packet.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Transport::Udp)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
            Transport::Tls => f.write_str("tls"),
            Transport::Wss => f.write_str("wss"),
        }
    }
}

/// A network endpoint. Port 0 means the port is unknown (for example the
/// local side of a one-sided trace dump, or a media source before any RTP
/// has been seen).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            f.write_str(&self.host)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An assembled packet as delivered by the capture frontend. For stream
/// transports the frontend has already reassembled the byte stream; the
/// payload may still hold more than one SIP message.
#[derive(Debug, Clone)]
pub struct Packet {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub transport: Transport,
    pub ts: DateTime<Utc>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register = 1,
    Invite,
    Subscribe,
    Notify,
    Options,
    Publish,
    Message,
    Cancel,
    Bye,
    Ack,
    Prack,
    Info,
    Refer,
    Update,
}

impl SipMethod {
    pub const ALL: [SipMethod; 14] = [
        SipMethod::Register,
        SipMethod::Invite,
        SipMethod::Subscribe,
        SipMethod::Notify,
        SipMethod::Options,
        SipMethod::Publish,
        SipMethod::Message,
        SipMethod::Cancel,
        SipMethod::Bye,
        SipMethod::Ack,
        SipMethod::Prack,
        SipMethod::Info,
        SipMethod::Refer,
        SipMethod::Update,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Options => "OPTIONS",
            SipMethod::Publish => "PUBLISH",
            SipMethod::Message => "MESSAGE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Ack => "ACK",
            SipMethod::Prack => "PRACK",
            SipMethod::Info => "INFO",
            SipMethod::Refer => "REFER",
            SipMethod::Update => "UPDATE",
        }
    }

    pub fn from_str(s: &str) -> Option<SipMethod> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "OPTIONS" => Some(SipMethod::Options),
            "PUBLISH" => Some(SipMethod::Publish),
            "MESSAGE" => Some(SipMethod::Message),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "ACK" => Some(SipMethod::Ack),
            "PRACK" => Some(SipMethod::Prack),
            "INFO" => Some(SipMethod::Info),
            "REFER" => Some(SipMethod::Refer),
            "UPDATE" => Some(SipMethod::Update),
            _ => None,
        }
    }

    /// Numeric code shared with response status codes: methods occupy 1..=14,
    /// responses their three-digit status.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgKind {
    Request { method: SipMethod, uri: String },
    Response { code: u16, reason: String },
}

impl MsgKind {
    pub fn method(&self) -> Option<SipMethod> {
        match self {
            MsgKind::Request { method, .. } => Some(*method),
            MsgKind::Response { .. } => None,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            MsgKind::Request { method, .. } => method.code(),
            MsgKind::Response { code, .. } => *code,
        }
    }

    pub fn summary(&self) -> Cow<'_, str> {
        match self {
            MsgKind::Request { method, .. } => Cow::Borrowed(method.as_str()),
            MsgKind::Response { code, reason } => Cow::Owned(format!("{code} {reason}")),
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgKind::Request { method, uri } => write!(f, "{method} {uri}"),
            MsgKind::Response { code, reason } => write!(f, "{code} {reason}"),
        }
    }
}
