//! Wire message model.
//!
//! Every logical message is a [`Message`] header followed by one payload
//! record whose type is selected by the header's command.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::rvid::RvId;

// pre session phase
pub const CMD_IDENTIFY: &str = "identify";
pub const CMD_SESSION: &str = "session";

// session phase
pub const CMD_WELCOME: &str = "welcome";

// tagged commands
pub const CMD_ACK: &str = "ack";
pub const CMD_PING: &str = "ping";
pub const CMD_PONG: &str = "pong";
pub const CMD_GET_INVOICE: &str = "getinvoice";
pub const CMD_GET_INVOICE_REPLY: &str = "getinvoicereply";
pub const CMD_ROUTE_MESSAGE: &str = "routemessage";
pub const CMD_ROUTE_MESSAGE_REPLY: &str = "routemessagereply";
pub const CMD_SUBSCRIBE_ROUTED_MESSAGES: &str = "subscriberoutedmessages";
pub const CMD_SUBSCRIBE_ROUTED_MESSAGES_REPLY: &str = "subscriberoutedmessagesreply";
pub const CMD_PUSH_ROUTED_MESSAGE: &str = "pushroutedmessage";

pub const PROTOCOL_VERSION: i64 = 10;

/// Header record. The tag is echoed unmodified by the peer in its reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub command: String,
    #[serde(default)]
    pub time_stamp: i64,
    #[serde(default)]
    pub cleartext: bool,
    #[serde(default)]
    pub tag: u32,
}

impl Message {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ping {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pong {}

/// Ack for a tagged command. An empty `error` means success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Acknowledge {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub non_fatal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceAction {
    #[serde(rename = "push")]
    Push,
    #[serde(rename = "sub")]
    Sub,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetInvoice {
    pub payment_scheme: String,
    pub action: InvoiceAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct GetInvoiceReply {
    #[serde(default)]
    pub invoice: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteMessage {
    /// Id of an earlier payment to reuse for this push. Empty when the push
    /// was paid for just now.
    #[serde(
        rename = "PaidInvoiceID",
        default,
        with = "b64",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub paid_invoice_id: Vec<u8>,
    pub rendezvous: RvId,
    #[serde(with = "b64")]
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct RouteMessageReply {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub next_invoice: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeRoutedMessages {
    #[serde(default, deserialize_with = "nullable")]
    pub add_rendezvous: Vec<RvId>,
    #[serde(default, deserialize_with = "nullable")]
    pub del_rendezvous: Vec<RvId>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub mark_paid: Vec<RvId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeRoutedMessagesReply {
    #[serde(default)]
    pub next_invoice: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushRoutedMessage {
    #[serde(default, with = "b64")]
    pub payload: Vec<u8>,
    #[serde(rename = "RV")]
    pub rv: RvId,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerProperty {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Welcome {
    pub version: i64,
    #[serde(default)]
    pub server_time: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub properties: Vec<ServerProperty>,
}

/// Payload record, discriminated by the header command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Ack(Acknowledge),
    Ping(Ping),
    Pong(Pong),
    GetInvoice(GetInvoice),
    GetInvoiceReply(GetInvoiceReply),
    RouteMessage(RouteMessage),
    RouteMessageReply(RouteMessageReply),
    SubscribeRoutedMessages(SubscribeRoutedMessages),
    SubscribeRoutedMessagesReply(SubscribeRoutedMessagesReply),
    PushRoutedMessage(PushRoutedMessage),
    Welcome(Welcome),
}

impl Payload {
    /// Command name carried in the header for this payload.
    pub fn command(&self) -> &'static str {
        match self {
            Payload::Ack(_) => CMD_ACK,
            Payload::Ping(_) => CMD_PING,
            Payload::Pong(_) => CMD_PONG,
            Payload::GetInvoice(_) => CMD_GET_INVOICE,
            Payload::GetInvoiceReply(_) => CMD_GET_INVOICE_REPLY,
            Payload::RouteMessage(_) => CMD_ROUTE_MESSAGE,
            Payload::RouteMessageReply(_) => CMD_ROUTE_MESSAGE_REPLY,
            Payload::SubscribeRoutedMessages(_) => CMD_SUBSCRIBE_ROUTED_MESSAGES,
            Payload::SubscribeRoutedMessagesReply(_) => CMD_SUBSCRIBE_ROUTED_MESSAGES_REPLY,
            Payload::PushRoutedMessage(_) => CMD_PUSH_ROUTED_MESSAGE,
            Payload::Welcome(_) => CMD_WELCOME,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Treats `null` as the empty value.
fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Byte strings as standard base64; `null` decodes to empty.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    use super::*;

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
