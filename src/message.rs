// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Outgoing messages are anything that can encode itself into a body ([`OutMessage`]).
//! Incoming messages ([`InMessage`]) carry their body plus the means to reply to their
//! sender and to acknowledge their delivery on the channel they arrived on.

use crate::{
    errors::{AmqpError, MessagingError},
    otel,
    transport::{Delivery, MessageProperties, TransportChannel},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, sync::Arc};
use tracing::debug;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message object that can be encoded into the body of a message.
pub trait OutMessage: fmt::Debug + Send + Sync {
    /// Encodes this message as bytes.
    fn encode_message(&self) -> Result<Vec<u8>, MessagingError>;

    /// Content type advertised with the body, if any.
    fn content_type(&self) -> Option<&str> {
        None
    }
}

/// Opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMessage(pub Vec<u8>);

impl OutMessage for RawMessage {
    fn encode_message(&self) -> Result<Vec<u8>, MessagingError> {
        Ok(self.0.clone())
    }
}

impl From<&[u8]> for RawMessage {
    fn from(body: &[u8]) -> Self {
        RawMessage(body.to_vec())
    }
}

impl From<&str> for RawMessage {
    fn from(body: &str) -> Self {
        RawMessage(body.as_bytes().to_vec())
    }
}

/// A message containing a single integer, encoded as 4 big-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntMessage {
    pub value: i32,
}

impl IntMessage {
    pub fn new(value: i32) -> Self {
        IntMessage { value }
    }

    /// Decodes a body produced by [`OutMessage::encode_message`].
    pub fn decode(bytes: &[u8]) -> Result<Self, MessagingError> {
        let raw: [u8; 4] = bytes.try_into().map_err(|_| {
            MessagingError::PayloadError(format!(
                "int message needs 4 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(IntMessage::new(i32::from_be_bytes(raw)))
    }
}

impl OutMessage for IntMessage {
    fn encode_message(&self) -> Result<Vec<u8>, MessagingError> {
        Ok(self.value.to_be_bytes().to_vec())
    }
}

impl fmt::Display for IntMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// A serializable value sent as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonMessage<T>(pub T);

impl<T> JsonMessage<T>
where
    T: DeserializeOwned,
{
    pub fn decode(bytes: &[u8]) -> Result<T, MessagingError> {
        serde_json::from_slice(bytes).map_err(|err| MessagingError::PayloadError(err.to_string()))
    }
}

impl<T> OutMessage for JsonMessage<T>
where
    T: Serialize + fmt::Debug + Send + Sync,
{
    fn encode_message(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(&self.0).map_err(|err| MessagingError::PayloadError(err.to_string()))
    }

    fn content_type(&self) -> Option<&str> {
        Some(JSON_CONTENT_TYPE)
    }
}

/// A message received from a queue. Unless [`InMessage::ack`] is called it stays in the
/// queue and will be delivered again.
pub struct InMessage {
    body: Vec<u8>,
    delivery_tag: u64,
    properties: MessageProperties,
    exchange: String,
    channel: Arc<dyn TransportChannel>,
}

impl InMessage {
    pub(crate) fn new(
        delivery: Delivery,
        exchange: &str,
        channel: Arc<dyn TransportChannel>,
    ) -> InMessage {
        InMessage {
            body: delivery.body,
            delivery_tag: delivery.delivery_tag,
            properties: delivery.properties,
            exchange: exchange.to_owned(),
            channel,
        }
    }

    /// The contents of the message.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Sends `message` back to whoever sent this one, on the channel it arrived on.
    pub async fn reply(&self, message: &dyn OutMessage) -> Result<(), MessagingError> {
        let Some(reply_to) = self.properties.reply_to.as_deref() else {
            return Err(MessagingError::MissingReplyAddressError);
        };

        let mut properties = MessageProperties::default()
            .with_content_type(message.content_type())
            .with_headers(otel::trace_headers());
        properties.correlation_id = self.properties.correlation_id.clone();

        debug!(reply_to, exchange = self.exchange.as_str(), "replying to message");
        self.channel
            .basic_publish(
                &self.exchange,
                reply_to,
                &message.encode_message()?,
                properties,
            )
            .await
            .map_err(MessagingError::from)
    }

    /// Acknowledges that the message was processed, removing it from the queue.
    pub async fn ack(&self) -> Result<(), MessagingError> {
        self.channel
            .basic_ack(self.delivery_tag)
            .await
            .map_err(|err| match err {
                AmqpError::AckMessageError(_) | AmqpError::ShutdownSignal(_) => err.into(),
                other => AmqpError::AckMessageError(other.to_string()).into(),
            })
    }
}

impl fmt::Debug for InMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        sku: String,
    }

    #[test]
    fn int_messages_are_four_big_endian_bytes() {
        let encoded = IntMessage::new(0x0102_0304).encode_message().unwrap();
        assert_eq!(encoded, vec![1, 2, 3, 4]);
        assert_eq!(IntMessage::decode(&encoded).unwrap().value, 0x0102_0304);
        assert_eq!(IntMessage::new(-7).to_string(), "-7");
    }

    #[test]
    fn int_decoding_rejects_wrong_lengths() {
        assert!(matches!(
            IntMessage::decode(&[1, 2, 3]),
            Err(MessagingError::PayloadError(_))
        ));
    }

    #[test]
    fn json_messages_advertise_their_content_type() {
        let msg = JsonMessage(Order {
            id: 3,
            sku: "A-1".into(),
        });

        assert_eq!(msg.content_type(), Some(JSON_CONTENT_TYPE));
        let decoded: Order = JsonMessage::decode(&msg.encode_message().unwrap()).unwrap();
        assert_eq!(decoded, msg.0);
        assert!(JsonMessage::<Order>::decode(b"not json").is_err());
    }
}
