//! Two-record framing: a header record followed by the payload record, both
//! newline-terminated JSON, carried as one secured message.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ProtocolError, Result};
use crate::protocol::message::*;

/// Serialize `msg` followed by `payload`.
pub fn encode(msg: &Message, payload: &Payload) -> Result<Bytes> {
    let mut w = BytesMut::with_capacity(128).writer();
    serde_json::to_writer(&mut w, msg).map_err(|e| ProtocolError::Encode {
        what: "header",
        reason: e.to_string(),
    })?;
    w.get_mut().put_u8(b'\n');
    serde_json::to_writer(&mut w, payload).map_err(|e| ProtocolError::Encode {
        what: "payload",
        reason: e.to_string(),
    })?;
    w.get_mut().put_u8(b'\n');
    Ok(w.into_inner().freeze())
}

/// Decode one secured message into its header and typed payload.
///
/// Fails on unknown commands and on trailing data after the payload.
pub fn decode(raw: &[u8]) -> Result<(Message, Payload)> {
    let mut de = serde_json::Deserializer::from_slice(raw);
    let msg = Message::deserialize(&mut de).map_err(|e| ProtocolError::Decode {
        what: "header",
        reason: e.to_string(),
    })?;

    let payload = match msg.command.as_str() {
        CMD_ACK => Payload::Ack(record(&mut de)?),
        CMD_PING => Payload::Ping(record(&mut de)?),
        CMD_PONG => Payload::Pong(record(&mut de)?),
        CMD_GET_INVOICE => Payload::GetInvoice(record(&mut de)?),
        CMD_GET_INVOICE_REPLY => Payload::GetInvoiceReply(record(&mut de)?),
        CMD_ROUTE_MESSAGE => Payload::RouteMessage(record(&mut de)?),
        CMD_ROUTE_MESSAGE_REPLY => Payload::RouteMessageReply(record(&mut de)?),
        CMD_SUBSCRIBE_ROUTED_MESSAGES => Payload::SubscribeRoutedMessages(record(&mut de)?),
        CMD_SUBSCRIBE_ROUTED_MESSAGES_REPLY => {
            Payload::SubscribeRoutedMessagesReply(record(&mut de)?)
        }
        CMD_PUSH_ROUTED_MESSAGE => Payload::PushRoutedMessage(record(&mut de)?),
        CMD_WELCOME => Payload::Welcome(record(&mut de)?),
        other => return Err(ProtocolError::UnknownCommand(other.to_string()).into()),
    };

    de.end().map_err(|e| ProtocolError::Decode {
        what: "trailer",
        reason: e.to_string(),
    })?;
    Ok((msg, payload))
}

fn record<'de, R, T>(de: &mut serde_json::Deserializer<R>) -> Result<T>
where
    R: serde_json::de::Read<'de>,
    T: DeserializeOwned,
{
    T::deserialize(de).map_err(|e| {
        ProtocolError::Decode {
            what: "payload",
            reason: e.to_string(),
        }
        .into()
    })
}

/// A pre-session command written as a bare JSON string line.
pub fn encode_initial_cmd(cmd: &str) -> Result<Vec<u8>> {
    let mut v = serde_json::to_vec(cmd).map_err(|e| ProtocolError::Encode {
        what: "initial command",
        reason: e.to_string(),
    })?;
    v.push(b'\n');
    Ok(v)
}
