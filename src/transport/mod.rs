// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Boundary
//!
//! The messaging layer treats the broker client as a black box that can open channels,
//! declare and bind queues, publish bytes, consume and acknowledge deliveries, and report
//! when a connection dies underneath it. These traits describe that box.
//!
//! Two implementations ship with the crate:
//! - [`amqp::AmqpTransport`], backed by `lapin`, for real RabbitMQ brokers
//! - [`memory::MemoryBroker`], an in-process broker with fault injection

pub mod amqp;
pub mod memory;

use crate::{
    config::AmqpMessageConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::oneshot;

/// AMQP reply code used when we close something on purpose.
pub const REPLY_SUCCESS: u16 = 200;

/// Metadata travelling with a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn with_content_type(mut self, content_type: Option<&str>) -> Self {
        self.content_type = content_type.map(ToOwned::to_owned);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub properties: MessageProperties,
}

/// Deliveries of one consumer. The stream ends when the consumer is cancelled or its
/// channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Establishes broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection using the given configuration.
    async fn connect(
        &self,
        config: &AmqpMessageConfig,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Opens a fresh channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    /// Resolves when the connection shuts down unexpectedly. The sender is dropped
    /// without a value when the connection is closed on purpose.
    fn on_shutdown(&self) -> oneshot::Receiver<AmqpError>;

    /// Closes the connection, waiting at most `timeout`.
    async fn close(&self, timeout: Duration) -> Result<(), AmqpError>;
}

/// A lightweight communication handle derived from a connection.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, which the broker picks for server-named
    /// definitions.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer, returning its tag and its deliveries.
    async fn basic_consume(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<(String, DeliveryStream), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
