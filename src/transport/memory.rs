// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living inside the process, with the AMQP semantics the messaging layer
//! relies on: durable direct exchanges, named, server-named and exclusive queues,
//! bindings by routing key, round-robin consumers, per-channel delivery tags, and
//! unacknowledged messages going back to their queue when the channel closes.
//!
//! It can also be told to refuse connections ([`MemoryBroker::set_reachable`]) or to
//! drop every live connection at once ([`MemoryBroker::disconnect_all`]), which makes it
//! the reference for exercising reconnect behaviour.

use crate::{
    config::AmqpMessageConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Delivery, DeliveryStream, MessageProperties, Transport, TransportChannel,
        TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// Name of the exchange that routes straight to the queue named by the routing key.
const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
struct QueueEntry {
    exclusive_owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

struct ConnectionEntry {
    open: bool,
    shutdown_listeners: Vec<oneshot::Sender<AmqpError>>,
}

struct BrokerState {
    reachable: bool,
    next_id: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueEntry>,
    bindings: HashMap<(String, String), BTreeSet<String>>,
    connects: usize,
    consumes: HashMap<String, usize>,
    acks: HashMap<String, usize>,
}

impl Default for BrokerState {
    fn default() -> Self {
        BrokerState {
            reachable: true,
            next_id: 0,
            connections: HashMap::default(),
            channels: HashMap::default(),
            exchanges: HashSet::default(),
            queues: HashMap::default(),
            bindings: HashMap::default(),
            connects: 0,
            consumes: HashMap::default(),
            acks: HashMap::default(),
        }
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_usable(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|ch| {
            ch.open
                && self
                    .connections
                    .get(&ch.connection)
                    .is_some_and(|conn| conn.open)
        })
    }

    fn route(&mut self, exchange: &str, routing_key: &str, msg: StoredMessage) {
        if exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(routing_key) {
                self.enqueue(routing_key, msg);
            }
            return;
        }

        let targets = self
            .bindings
            .get(&(exchange.to_owned(), routing_key.to_owned()))
            .cloned()
            .unwrap_or_default();

        if targets.is_empty() {
            debug!(exchange, routing_key, "message dropped, no queue bound");
        }

        for queue in targets {
            self.enqueue(&queue, msg.clone());
        }
    }

    fn enqueue(&mut self, queue: &str, msg: StoredMessage) {
        if let Some(entry) = self.queues.get_mut(queue) {
            entry.ready.push_back(msg);
        }
        self.dispatch(queue);
    }

    /// Hands ready messages to consumers, round robin, until either runs out.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(entry) = self.queues.get_mut(queue) else {
                return;
            };
            entry.consumers.retain(|c| !c.tx.is_closed());
            if entry.consumers.is_empty() || entry.ready.is_empty() {
                return;
            }

            let index = entry.next_consumer % entry.consumers.len();
            entry.next_consumer = index + 1;

            let Some(msg) = entry.ready.pop_front() else {
                return;
            };
            let (channel_id, no_ack, tx) = {
                let consumer = &entry.consumers[index];
                (consumer.channel, consumer.no_ack, consumer.tx.clone())
            };

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                continue;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            if !no_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue.to_owned(), msg.clone()));
            }

            let delivery = Delivery {
                body: msg.body,
                delivery_tag,
                properties: msg.properties,
            };
            if tx.send(Ok(delivery)).is_err() {
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.unacked.remove(&delivery_tag);
                }
            }
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);

        for entry in self.queues.values_mut() {
            entry.consumers.retain(|c| c.channel != channel_id);
        }

        let mut requeued: Vec<(u64, (String, StoredMessage))> = unacked.into_iter().collect();
        requeued.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        let mut touched = BTreeSet::new();
        for (_, (queue, msg)) in requeued {
            if let Some(entry) = self.queues.get_mut(&queue) {
                entry.ready.push_front(msg);
                touched.insert(queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection_id: u64, unexpected: bool) {
        let Some(conn) = self.connections.get_mut(&connection_id) else {
            return;
        };
        if !conn.open {
            return;
        }
        conn.open = false;
        let listeners = std::mem::take(&mut conn.shutdown_listeners);

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive_owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.queues.remove(&queue);
            for targets in self.bindings.values_mut() {
                targets.remove(&queue);
            }
        }

        if unexpected {
            for tx in listeners {
                let _ = tx.send(AmqpError::ShutdownSignal(
                    "connection reset by broker".to_owned(),
                ));
            }
        }
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While unreachable, every connection attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Drops every open connection as if the broker had gone away.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            state.close_connection(id, true);
        }
    }

    /// Number of successful connection attempts so far.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Number of currently open connections.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.values().filter(|c| c.open).count()
    }

    /// Number of consumers ever started on the queue.
    pub fn consume_count(&self, queue: &str) -> usize {
        self.lock().consumes.get(queue).copied().unwrap_or_default()
    }

    /// Number of consumers currently attached to the queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
            .unwrap_or_default()
    }

    /// Number of acknowledgements received for deliveries of the queue.
    pub fn ack_count(&self, queue: &str) -> usize {
        self.lock().acks.get(queue).copied().unwrap_or_default()
    }

    /// Number of messages waiting in the queue for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Number of delivered but not yet acknowledged messages of the queue.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        cfg: &AmqpMessageConfig,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(AmqpError::ConnectionError(format!(
                "broker unreachable at {}",
                cfg.hosts
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            )));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionEntry {
                open: true,
                shutdown_listeners: vec![],
            },
        );
        state.connects += 1;

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        let mut state = self.broker.lock();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(AmqpError::ShutdownSignal("connection is closed".to_owned()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                open: true,
                next_tag: 0,
                unacked: HashMap::default(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
        }))
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn on_shutdown(&self) -> oneshot::Receiver<AmqpError> {
        let (tx, rx) = oneshot::channel();
        if let Some(conn) = self.broker.lock().connections.get_mut(&self.id) {
            if conn.open {
                conn.shutdown_listeners.push(tx);
            }
        }
        rx
    }

    async fn close(&self, _timeout: Duration) -> Result<(), AmqpError> {
        self.broker.lock().close_connection(self.id, false);
        Ok(())
    }
}

/// Channel of a [`MemoryConnection`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
}

impl MemoryChannel {
    fn usable(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.lock();
        if state.channel_usable(self.id) {
            Ok(state)
        } else {
            Err(AmqpError::ShutdownSignal("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        state.exchanges.insert(def.name.to_owned());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.usable()?;
        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing
                .exclusive_owner
                .is_some_and(|owner| owner != self.connection)
            {
                return Err(AmqpError::DeclareQueueError(name));
            }
            return Ok(name);
        }
        state.queues.insert(
            name.clone(),
            QueueEntry {
                exclusive_owner: def.exclusive.then_some(self.connection),
                ..QueueEntry::default()
            },
        );
        Ok(name)
    }

    async fn queue_bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        if !state.exchanges.contains(binding.exchange_name)
            || !state.queues.contains_key(binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.to_owned(),
                binding.queue_name.to_owned(),
            ));
        }

        state
            .bindings
            .entry((
                binding.exchange_name.to_owned(),
                binding.routing_key.to_owned(),
            ))
            .or_default()
            .insert(binding.queue_name.to_owned());
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        state.route(
            exchange,
            routing_key,
            StoredMessage {
                body: body.to_vec(),
                properties,
            },
        );
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<(String, DeliveryStream), AmqpError> {
        let mut state = self.usable()?;
        let Some(entry) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };

        let tag = format!("{}-{}", queue, Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        entry.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            channel: self.id,
            no_ack,
            tx,
        });
        *state.consumes.entry(queue.to_owned()).or_default() += 1;
        state.dispatch(queue);

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed();

        Ok((tag, deliveries))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        let mut found = false;
        for entry in state.queues.values_mut() {
            let before = entry.consumers.len();
            entry.consumers.retain(|c| c.tag != consumer_tag);
            found |= entry.consumers.len() != before;
        }

        if found {
            Ok(())
        } else {
            Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
        }
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        let acked = state
            .channels
            .get_mut(&self.id)
            .and_then(|ch| ch.unacked.remove(&delivery_tag));

        match acked {
            Some((queue, _)) => {
                *state.acks.entry(queue).or_default() += 1;
                Ok(())
            }
            None => Err(AmqpError::AckMessageError(format!(
                "unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channel_usable(self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.usable()?;
        state.close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MemoryBroker) -> (Arc<dyn TransportConnection>, Arc<dyn TransportChannel>) {
        let conn = broker
            .connect(&AmqpMessageConfig::default())
            .await
            .unwrap();
        let channel = conn.create_channel().await.unwrap();
        (conn, channel)
    }

    async fn bound_queue(channel: &Arc<dyn TransportChannel>, queue: &str, key: &str) {
        channel
            .exchange_declare(&ExchangeDefinition::new("ex").durable())
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new(queue).durable())
            .await
            .unwrap();
        channel
            .queue_bind(&QueueBinding::new(queue).exchange("ex").routing_key(key))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn routes_by_binding_and_holds_until_consumed() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = channel(&broker).await;
        bound_queue(&channel, "q", "a.b.c").await;

        channel
            .basic_publish("ex", "a.b.c", b"hello", MessageProperties::default())
            .await
            .unwrap();
        channel
            .basic_publish("ex", "x.y.z", b"lost", MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.ready_count("q"), 1);

        let (_tag, mut deliveries) = channel.basic_consume("q", false).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"hello");
        assert_eq!(broker.unacked_count("q"), 1);

        channel.basic_ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.ack_count("q"), 1);
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn unacked_messages_return_to_the_queue_when_the_channel_closes() {
        let broker = MemoryBroker::new();
        let (conn, channel) = channel(&broker).await;
        bound_queue(&channel, "q", "k").await;

        let (_tag, mut deliveries) = channel.basic_consume("q", false).await.unwrap();
        channel
            .basic_publish("ex", "k", b"once", MessageProperties::default())
            .await
            .unwrap();
        deliveries.next().await.unwrap().unwrap();

        channel.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.ready_count("q"), 1);

        let other = conn.create_channel().await.unwrap();
        let (_tag, mut again) = other.basic_consume("q", false).await.unwrap();
        assert_eq!(again.next().await.unwrap().unwrap().body, b"once");
    }

    #[tokio::test]
    async fn disconnect_signals_shutdown_and_drops_exclusive_queues() {
        let broker = MemoryBroker::new();
        let (conn, channel) = channel(&broker).await;
        let shutdown = conn.on_shutdown();
        let queue = channel
            .queue_declare(&QueueDefinition::server_named().exclusive())
            .await
            .unwrap();
        assert!(queue.starts_with("amq.gen-"));

        broker.disconnect_all();

        assert!(shutdown.await.unwrap().is_shutdown());
        assert!(!conn.is_open());
        assert!(!channel.is_open());
        assert!(!broker.has_queue(&queue));
        assert!(channel
            .basic_publish("", &queue, b"x", MessageProperties::default())
            .await
            .unwrap_err()
            .is_shutdown());
    }

    #[tokio::test]
    async fn explicit_close_does_not_signal_shutdown() {
        let broker = MemoryBroker::new();
        let (conn, _channel) = channel(&broker).await;
        let shutdown = conn.on_shutdown();

        conn.close(Duration::from_millis(10)).await.unwrap();

        assert!(shutdown.await.is_err());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);

        let result = broker.connect(&AmqpMessageConfig::default()).await;
        assert!(matches!(result, Err(AmqpError::ConnectionError(_))));
        assert_eq!(broker.connect_count(), 0);
    }
}
