// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Sender
//!
//! Publishes one-shot messages to addresses and hands out replying destinations. Every
//! send uses a fresh channel which is closed afterwards, whatever the outcome; a send
//! that hits a shut down channel is retried once on a new channel.

use crate::{
    address::DestinationAddress,
    channel::ChannelProvider,
    errors::{AmqpError, MessagingError},
    message::OutMessage,
    otel,
    replying::{AmqpReplyingDestination, ReplyingDestination},
    topology,
    transport::{MessageProperties, TransportChannel},
};
use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, info};

/// Sends messages to destinations.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Publishes `message` to `address` without waiting for any answer.
    async fn send_message(
        &self,
        message: &dyn OutMessage,
        address: &DestinationAddress,
    ) -> Result<(), MessagingError>;

    /// Creates a destination for request/reply calls to `address`.
    async fn create_replying_destination(
        &self,
        address: &DestinationAddress,
    ) -> Result<Arc<dyn ReplyingDestination>, MessagingError>;

    /// Closes every replying destination created by this sender. All of them are
    /// attempted; the first failure is returned.
    async fn close(&self) -> Result<(), MessagingError>;
}

pub struct AmqpMessageSender {
    channels: Arc<dyn ChannelProvider>,
    declared_exchanges: Mutex<HashSet<String>>,
    destinations: Mutex<Vec<Arc<AmqpReplyingDestination>>>,
}

impl AmqpMessageSender {
    pub fn new(channels: Arc<dyn ChannelProvider>) -> AmqpMessageSender {
        AmqpMessageSender {
            channels,
            declared_exchanges: Mutex::new(HashSet::new()),
            destinations: Mutex::new(vec![]),
        }
    }

    fn is_declared(&self, exchange: &str) -> bool {
        self.declared_exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(exchange)
    }

    async fn publish(
        &self,
        channel: &dyn TransportChannel,
        address: &DestinationAddress,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), AmqpError> {
        if !self.is_declared(&address.exchange) {
            info!(exchange = address.exchange.as_str(), "declaring exchange");
            channel
                .exchange_declare(&topology::exchange_for(address))
                .await?;
            self.declared_exchanges
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(address.exchange.clone());
        }

        let properties = MessageProperties::default()
            .persistent()
            .with_content_type(content_type)
            .with_headers(otel::trace_headers());
        channel
            .basic_publish(&address.exchange, &address.routing_key(), body, properties)
            .await
    }
}

#[async_trait]
impl MessageSender for AmqpMessageSender {
    async fn send_message(
        &self,
        message: &dyn OutMessage,
        address: &DestinationAddress,
    ) -> Result<(), MessagingError> {
        debug!(message = ?message, address = address.to_string(), "sending message");
        let body = message.encode_message()?;

        let mut retries = 1;
        loop {
            let channel = self.channels.create_channel().await?;
            let published = self
                .publish(channel.as_ref(), address, &body, message.content_type())
                .await;

            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "channel was already closed");
            }

            match published {
                Ok(()) => return Ok(()),
                Err(err) if err.is_shutdown() && retries > 0 => {
                    retries -= 1;
                    debug!(error = err.to_string(), "channel shut down, retrying on a new one");
                }
                Err(err) => {
                    error!(error = err.to_string(), "error publishing message");
                    return Err(err.into());
                }
            }
        }
    }

    async fn create_replying_destination(
        &self,
        address: &DestinationAddress,
    ) -> Result<Arc<dyn ReplyingDestination>, MessagingError> {
        let destination =
            Arc::new(AmqpReplyingDestination::create(self.channels.clone(), address.clone()).await?);

        let mut destinations = self
            .destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        destinations.retain(|d| !d.is_closed());
        destinations.push(destination.clone());
        Ok(destination)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let destinations = std::mem::take(
            &mut *self
                .destinations
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut result = Ok(());
        for destination in destinations.iter().filter(|d| !d.is_closed()) {
            if let Err(err) = destination.close().await {
                error!(
                    error = err.to_string(),
                    address = destination.address().to_string(),
                    "failure to close replying destination"
                );
                result = result.and(Err(err));
            }
        }
        result
    }
}
