// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Listeners
//!
//! A [`MessageListener`] processes messages pulled from a queue. Listeners are shared
//! between reconnects and may be invoked from several receive loops, so they should not
//! keep per-message state.
//!
//! [`AddressedMessageListener`] ties a listener to the queue and address it wants to
//! consume; it is the key the connection uses to track subscriptions.

use crate::{address::DestinationAddress, errors::MessagingError, message::InMessage};
use async_trait::async_trait;
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Processes received messages.
///
/// If processing succeeds the implementation must call [`InMessage::ack`] or the message
/// stays in the queue. [`AckingMessageListener`] takes care of that for handlers that
/// finish their work inside the call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn received(&self, message: InMessage) -> Result<(), MessagingError>;
}

/// Synchronous processing step wrapped by [`AckingMessageListener`].
#[async_trait]
pub trait AckingHandler: Send + Sync {
    /// Processes the message. Returning an error leaves it in the queue.
    async fn process_received(&self, message: &InMessage) -> Result<(), MessagingError>;
}

/// Acknowledges each message as soon as its handler returns without error.
pub struct AckingMessageListener<H> {
    handler: H,
}

impl<H> AckingMessageListener<H>
where
    H: AckingHandler,
{
    pub fn new(handler: H) -> Self {
        AckingMessageListener { handler }
    }
}

#[async_trait]
impl<H> MessageListener for AckingMessageListener<H>
where
    H: AckingHandler,
{
    async fn received(&self, message: InMessage) -> Result<(), MessagingError> {
        self.handler.process_received(&message).await?;
        message.ack().await
    }
}

/// A listener that knows which queue and address it is interested in.
///
/// Two addressed listeners are the same subscription when they name the same queue and
/// address and share the same listener instance.
#[derive(Clone)]
pub struct AddressedMessageListener {
    pub queue_name: String,
    pub address: DestinationAddress,
    listener: Arc<dyn MessageListener>,
}

impl AddressedMessageListener {
    pub fn new(
        queue_name: &str,
        address: DestinationAddress,
        listener: Arc<dyn MessageListener>,
    ) -> Self {
        AddressedMessageListener {
            queue_name: queue_name.to_owned(),
            address,
            listener,
        }
    }

    /// The handler messages are forwarded to.
    pub fn listener(&self) -> Arc<dyn MessageListener> {
        self.listener.clone()
    }

    fn listener_id(&self) -> *const () {
        Arc::as_ptr(&self.listener) as *const ()
    }
}

#[async_trait]
impl MessageListener for AddressedMessageListener {
    async fn received(&self, message: InMessage) -> Result<(), MessagingError> {
        self.listener.received(message).await
    }
}

impl PartialEq for AddressedMessageListener {
    fn eq(&self, other: &Self) -> bool {
        self.queue_name == other.queue_name
            && self.address == other.address
            && self.listener_id() == other.listener_id()
    }
}

impl Eq for AddressedMessageListener {}

impl Hash for AddressedMessageListener {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.queue_name.hash(state);
        self.address.hash(state);
        self.listener_id().hash(state);
    }
}

impl fmt::Debug for AddressedMessageListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressedMessageListener")
            .field("queue_name", &self.queue_name)
            .field("address", &self.address.to_string())
            .finish()
    }
}
