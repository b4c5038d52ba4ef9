// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport
//!
//! `lapin`-backed implementation of the transport traits. Connections are attempted
//! against every configured host in order; lapin errors that mean "this channel or
//! connection is gone" are reported as [`AmqpError::ShutdownSignal`] so the layers above
//! can fetch a fresh channel and retry.

use crate::{
    config::AmqpMessageConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Delivery, DeliveryStream, MessageProperties, Transport, TransportChannel,
        TransportConnection, REPLY_SUCCESS,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// AMQP delivery mode marking a message as persistent.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Connects to RabbitMQ servers through `lapin`.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport {}

impl AmqpTransport {
    pub fn new() -> Arc<AmqpTransport> {
        Arc::new(AmqpTransport {})
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        cfg: &AmqpMessageConfig,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let mut last_error = AmqpError::ConnectionError("no hosts configured".to_owned());

        for (uri, host) in cfg.amqp_uris().iter().zip(cfg.hosts.iter()) {
            debug!(host = host.to_string(), "creating amqp connection...");

            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(cfg.connection_name.clone()));

            match Connection::connect(uri, options).await {
                Ok(conn) => {
                    debug!(host = host.to_string(), "amqp connected");
                    return Ok(Arc::new(AmqpConnection::new(conn)));
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        host = host.to_string(),
                        "failure to connect"
                    );
                    last_error = AmqpError::ConnectionError(err.to_string());
                }
            }
        }

        Err(last_error)
    }
}

/// A lapin connection plus the pending shutdown notifications.
pub struct AmqpConnection {
    conn: Connection,
    shutdown_listeners: Arc<Mutex<Vec<oneshot::Sender<AmqpError>>>>,
}

impl AmqpConnection {
    fn new(conn: Connection) -> AmqpConnection {
        let shutdown_listeners: Arc<Mutex<Vec<oneshot::Sender<AmqpError>>>> =
            Arc::default();

        let listeners = shutdown_listeners.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            let pending = std::mem::take(
                &mut *listeners.lock().unwrap_or_else(PoisonError::into_inner),
            );
            for tx in pending {
                let _ = tx.send(AmqpError::ShutdownSignal(err.to_string()));
            }
        });

        AmqpConnection {
            conn,
            shutdown_listeners,
        }
    }
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(classify(err, AmqpError::ChannelError))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_shutdown(&self) -> oneshot::Receiver<AmqpError> {
        let (tx, rx) = oneshot::channel();
        self.shutdown_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    async fn close(&self, timeout: Duration) -> Result<(), AmqpError> {
        // Dropping the senders tells observers this was not an unexpected shutdown.
        self.shutdown_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        match tokio::time::timeout(timeout, self.conn.close(REPLY_SUCCESS, "Connection closed."))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(AmqpError::CloseChannelError(err.to_string())),
            Err(_) => Err(AmqpError::CloseChannelError(format!(
                "connection close timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                def.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(classify(err, |_| {
                    AmqpError::DeclareExchangeError(def.name.to_owned())
                }))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(classify(err, |_| AmqpError::DeclareQueueError(def.name.clone())))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name().as_str());
                Ok(queue.name().as_str().to_owned())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(classify(err, |_| {
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.to_owned(),
                        binding.queue_name.to_owned(),
                    )
                }))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                classify(err, AmqpError::PublishingError)
            })?;

        confirm.await.map(|_| ()).map_err(|err| {
            error!(error = err.to_string(), "error confirming message");
            classify(err, AmqpError::PublishingError)
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<(String, DeliveryStream), AmqpError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(classify(err, |_| {
                    AmqpError::BindingConsumerError(queue.to_owned())
                }))
            }
            Ok(c) => Ok(c),
        }?;

        let deliveries = consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    body: delivery.data,
                    delivery_tag: delivery.delivery_tag,
                    properties: from_basic_properties(&delivery.properties),
                }),
                Err(err) => Err(classify(err, AmqpError::ConsumerError)),
            })
            .boxed();

        Ok((consumer_tag, deliveries))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| classify(err, AmqpError::CancelConsumerError))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                classify(err, AmqpError::AckMessageError)
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "Channel closed.")
            .await
            .map_err(|err| classify(err, AmqpError::CloseChannelError))
    }
}

/// Maps lapin failures that mean the channel or connection died onto
/// [`AmqpError::ShutdownSignal`], everything else through `otherwise`.
fn classify<F>(err: lapin::Error, otherwise: F) -> AmqpError
where
    F: FnOnce(String) -> AmqpError,
{
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannel(_)
        | lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError => AmqpError::ShutdownSignal(err.to_string()),
        other => otherwise(other.to_string()),
    }
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(
            properties
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        ))
        .with_headers(FieldTable::from(
            properties
                .headers
                .into_iter()
                .map(|(key, value)| {
                    (
                        ShortString::from(key),
                        AMQPValue::LongString(LongString::from(value)),
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        ));

    if let Some(id) = properties.correlation_id {
        props = props.with_correlation_id(ShortString::from(id));
    }
    if let Some(reply_to) = properties.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to));
    }
    if let Some(content_type) = properties.content_type {
        props = props.with_content_type(ShortString::from(content_type));
    }
    if properties.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    props
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        AMQPValue::LongString(v) => {
                            String::from_utf8_lossy(v.as_bytes()).into_owned()
                        }
                        AMQPValue::ShortString(v) => v.as_str().to_owned(),
                        _ => return None,
                    };
                    Some((key.as_str().to_owned(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        correlation_id: props.correlation_id().as_ref().map(|v| v.as_str().to_owned()),
        reply_to: props.reply_to().as_ref().map(|v| v.as_str().to_owned()),
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_survive_the_lapin_representation() {
        let mut headers = BTreeMap::new();
        headers.insert("traceparent".to_owned(), "00-abc-def-01".to_owned());

        let props = MessageProperties::default()
            .with_correlation_id("7")
            .with_reply_to("amq.gen-1")
            .with_content_type(Some("application/json"))
            .with_headers(headers.clone())
            .persistent();

        let back = from_basic_properties(&to_basic_properties(props));

        assert_eq!(back.correlation_id.as_deref(), Some("7"));
        assert_eq!(back.reply_to.as_deref(), Some("amq.gen-1"));
        assert_eq!(back.content_type.as_deref(), Some("application/json"));
        assert!(back.persistent);
        assert!(back.message_id.is_some());
        assert_eq!(back.headers, headers);
    }

    #[test]
    fn state_errors_are_shutdown_signals() {
        let err = classify(lapin::Error::MissingHeartbeatError, AmqpError::PublishingError);
        assert!(err.is_shutdown());

        let err = classify(lapin::Error::ChannelsLimitReached, AmqpError::PublishingError);
        assert!(matches!(err, AmqpError::PublishingError(_)));
    }
}
