// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connected Listeners
//!
//! A connected listener is the live subscription of one [`AddressedMessageListener`]: a
//! dedicated channel, the listener's queue bound to its address, and a receive loop that
//! hands each delivery to the handler. The loop processes one message at a time, so the
//! handler never sees two messages of the same subscription concurrently.
//!
//! Connected listeners are never reconnected in place. When the subscription dies the
//! listener reports itself closed and the message connection attaches a new one.

use crate::{
    channel::ChannelProvider,
    errors::AmqpError,
    listener::{AddressedMessageListener, MessageListener},
    message::InMessage,
    otel,
    topology::AddressTopology,
    transport::{Delivery, DeliveryStream, TransportChannel},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// A subscription that can be closed.
#[async_trait]
pub trait ConnectedListener: Send + Sync {
    /// Cancels the subscription and stops its receive loop. A message already handed to
    /// the handler is allowed to finish.
    async fn close(&self) -> Result<(), AmqpError>;

    /// True once closed, or if the subscription was never established or has died.
    fn is_closed(&self) -> bool;

    /// Whether messages are being received right now.
    fn is_attached(&self) -> bool;
}

struct Subscription {
    channel: Arc<dyn TransportChannel>,
    consumer_tag: String,
    stop: Arc<Notify>,
}

/// Subscription of one listener on a broker channel.
pub struct AmqpConnectedListener {
    listener: AddressedMessageListener,
    subscription: Mutex<Option<Subscription>>,
    closed: AtomicBool,
    live: Arc<AtomicBool>,
}

impl AmqpConnectedListener {
    /// Binds the listener's queue and starts consuming it.
    ///
    /// A failure is logged and leaves the returned listener closed, so whoever owns it can
    /// try again later.
    pub async fn start(
        listener: AddressedMessageListener,
        channels: &dyn ChannelProvider,
    ) -> Arc<AmqpConnectedListener> {
        let live = Arc::new(AtomicBool::new(false));

        let subscription = match subscribe(&listener, channels, live.clone()).await {
            Ok(subscription) => {
                info!(
                    queue = listener.queue_name.as_str(),
                    address = listener.address.to_string(),
                    "listener connected"
                );
                Some(subscription)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = listener.queue_name.as_str(),
                    "failure to connect listener"
                );
                None
            }
        };

        Arc::new(AmqpConnectedListener {
            listener,
            subscription: Mutex::new(subscription),
            closed: AtomicBool::new(false),
            live,
        })
    }

    pub fn listener(&self) -> &AddressedMessageListener {
        &self.listener
    }
}

#[async_trait]
impl ConnectedListener for AmqpConnectedListener {
    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);

        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sub) = subscription else {
            return Ok(());
        };

        sub.stop.notify_one();
        if !sub.channel.is_open() {
            return Ok(());
        }

        debug!(
            queue = self.listener.queue_name.as_str(),
            consumer_tag = sub.consumer_tag.as_str(),
            "closing listener"
        );
        let cancelled = sub.channel.basic_cancel(&sub.consumer_tag).await;
        let closed = sub.channel.close().await;
        cancelled.and(closed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.live.load(Ordering::SeqCst)
    }

    /// The receive loop is running on an open channel.
    fn is_attached(&self) -> bool {
        !self.is_closed()
            && self
                .subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|sub| sub.channel.is_open())
    }
}

async fn subscribe(
    listener: &AddressedMessageListener,
    channels: &dyn ChannelProvider,
    live: Arc<AtomicBool>,
) -> Result<Subscription, AmqpError> {
    let channel = channels.create_channel().await?;

    let (consumer_tag, deliveries) = match consume_queue(listener, channel.as_ref()).await {
        Ok(consumer) => consumer,
        Err(err) => {
            let _ = channel.close().await;
            return Err(err);
        }
    };

    let stop = Arc::new(Notify::new());
    live.store(true, Ordering::SeqCst);
    tokio::spawn(receive_loop(
        listener.clone(),
        channel.clone(),
        deliveries,
        stop.clone(),
        live,
    ));

    Ok(Subscription {
        channel,
        consumer_tag,
        stop,
    })
}

async fn consume_queue(
    listener: &AddressedMessageListener,
    channel: &dyn TransportChannel,
) -> Result<(String, DeliveryStream), AmqpError> {
    let queue = AddressTopology::listener(&listener.queue_name, &listener.address)
        .install(channel)
        .await?;
    channel.basic_consume(&queue, false).await
}

async fn receive_loop(
    listener: AddressedMessageListener,
    channel: Arc<dyn TransportChannel>,
    mut deliveries: DeliveryStream,
    stop: Arc<Notify>,
    live: Arc<AtomicBool>,
) {
    let tracer = global::tracer("amqp consumer");

    loop {
        let next = tokio::select! {
            _ = stop.notified() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => dispatch(&tracer, &listener, delivery, channel.clone()).await,
            Some(Err(err)) if err.is_shutdown() => {
                warn!(error = err.to_string(), "consumer channel shut down");
                break;
            }
            Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
            None => break,
        }
    }

    live.store(false, Ordering::SeqCst);
    debug!(queue = listener.queue_name.as_str(), "receive loop stopped");
}

async fn dispatch(
    tracer: &BoxedTracer,
    listener: &AddressedMessageListener,
    delivery: Delivery,
    channel: Arc<dyn TransportChannel>,
) {
    let (_ctx, mut span) = otel::new_span(&delivery.properties.headers, tracer, &listener.queue_name);

    debug!(
        queue = listener.queue_name.as_str(),
        delivery_tag = delivery.delivery_tag,
        "received"
    );
    let message = InMessage::new(delivery, &listener.address.exchange, channel);

    match listener.received(message).await {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = listener.queue_name.as_str(),
                "failure to process message"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::DestinationAddress,
        channel::MockChannelProvider,
        listener::AckingMessageListener,
        testing::{eventually, init_tracing, FixedChannels, Recorder},
        transport::{memory::MemoryBroker, MessageProperties},
    };

    fn addressed(handler: Recorder) -> AddressedMessageListener {
        AddressedMessageListener::new(
            "orders",
            DestinationAddress::parse("shop.orders.create@commerce").unwrap(),
            Arc::new(AckingMessageListener::new(handler)),
        )
    }

    async fn publish(channels: &FixedChannels, body: &[u8]) {
        let channel = channels.create_channel().await.unwrap();
        channel
            .basic_publish("commerce", "shop.orders.create", body, MessageProperties::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_handlers_ack_each_message_once() {
        init_tracing();
        let broker = MemoryBroker::new();
        let channels = FixedChannels::connect(&broker).await;
        let (handler, mut seen) = Recorder::new(false);

        let connected = AmqpConnectedListener::start(addressed(handler), channels.as_ref()).await;
        assert!(connected.is_attached());

        publish(&channels, b"first").await;
        publish(&channels, b"second").await;

        assert_eq!(seen.recv().await.unwrap(), b"first");
        assert_eq!(seen.recv().await.unwrap(), b"second");
        eventually("acks", || broker.ack_count("orders") == 2).await;
        assert_eq!(broker.unacked_count("orders"), 0);
    }

    #[tokio::test]
    async fn failing_handlers_leave_messages_unacked() {
        init_tracing();
        let broker = MemoryBroker::new();
        let channels = FixedChannels::connect(&broker).await;
        let (handler, mut seen) = Recorder::new(true);

        let connected = AmqpConnectedListener::start(addressed(handler), channels.as_ref()).await;
        publish(&channels, b"poison").await;

        assert_eq!(seen.recv().await.unwrap(), b"poison");
        eventually("delivery", || broker.unacked_count("orders") == 1).await;
        assert_eq!(broker.ack_count("orders"), 0);
        assert!(!connected.is_closed());
    }

    #[tokio::test]
    async fn close_cancels_the_consumer() {
        let broker = MemoryBroker::new();
        let channels = FixedChannels::connect(&broker).await;
        let (handler, _seen) = Recorder::new(false);

        let connected = AmqpConnectedListener::start(addressed(handler), channels.as_ref()).await;
        assert_eq!(broker.consumer_count("orders"), 1);

        connected.close().await.unwrap();
        assert!(connected.is_closed());
        assert_eq!(broker.consumer_count("orders"), 0);

        connected.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_bind_leaves_the_listener_closed() {
        let mut channels = MockChannelProvider::new();
        channels
            .expect_create_channel()
            .times(1)
            .returning(|| Err(AmqpError::ConnectionError("refused".into())));
        let (handler, _seen) = Recorder::new(false);

        let connected = AmqpConnectedListener::start(addressed(handler), &channels).await;

        assert!(connected.is_closed());
        assert!(!connected.is_attached());
        connected.close().await.unwrap();
    }

    #[tokio::test]
    async fn broker_disconnect_marks_the_listener_closed() {
        let broker = MemoryBroker::new();
        let channels = FixedChannels::connect(&broker).await;
        let (handler, _seen) = Recorder::new(false);

        let connected = AmqpConnectedListener::start(addressed(handler), channels.as_ref()).await;
        broker.disconnect_all();

        eventually("listener closed", || connected.is_closed()).await;
        assert!(!connected.is_attached());
        connected.close().await.unwrap();
    }
}
