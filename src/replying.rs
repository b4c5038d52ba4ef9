// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Replying Destinations
//!
//! Request/reply over the broker. A replying destination owns a private reply queue and
//! a consumer on it. Each request is published with a fresh correlation id and the reply
//! queue as its reply address; the caller then waits until the reply carrying that id is
//! delivered, or until its timeout expires.
//!
//! The pending cell of a request is registered before the request is published, so a
//! reply can never arrive ahead of the cell it belongs to.

use crate::{
    address::DestinationAddress,
    channel::ChannelProvider,
    errors::{AmqpError, MessagingError},
    message::OutMessage,
    otel,
    topology::AddressTopology,
    transport::{DeliveryStream, MessageProperties, TransportChannel},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// A destination supporting synchronous, timeout-bounded calls.
#[async_trait]
pub trait ReplyingDestination: Send + Sync {
    /// Sends `message` and waits up to `timeout` for the reply, returning its body.
    async fn send_message(
        &self,
        message: &dyn OutMessage,
        timeout: Duration,
    ) -> Result<Vec<u8>, MessagingError>;

    /// Releases the reply channel. Later sends fail.
    async fn close(&self) -> Result<(), MessagingError>;

    fn is_closed(&self) -> bool;
}

type ReplyCell = oneshot::Sender<Result<Vec<u8>, AmqpError>>;

/// Outstanding requests of one reply consumer, keyed by correlation id.
#[derive(Default)]
struct PendingCells {
    stopped: bool,
    cells: HashMap<String, ReplyCell>,
}

type SharedCells = Arc<Mutex<PendingCells>>;

fn lock(cells: &SharedCells) -> MutexGuard<'_, PendingCells> {
    cells.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits for the reply to one request. Dropping it abandons the request.
struct PendingReply {
    correlation_id: String,
    cells: SharedCells,
    reply: oneshot::Receiver<Result<Vec<u8>, AmqpError>>,
}

impl PendingReply {
    async fn wait(&mut self) -> Result<Vec<u8>, AmqpError> {
        match (&mut self.reply).await {
            Ok(reply) => reply,
            Err(_) => Err(AmqpError::ShutdownSignal("reply consumer went away".to_owned())),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        lock(&self.cells).cells.remove(&self.correlation_id);
    }
}

/// Reply queue, its consumer, and the requests waiting on it.
struct ReplyClient {
    channel: Arc<dyn TransportChannel>,
    reply_queue: String,
    consumer_tag: String,
    cells: SharedCells,
}

impl ReplyClient {
    async fn create(
        channels: &dyn ChannelProvider,
        address: &DestinationAddress,
    ) -> Result<ReplyClient, AmqpError> {
        let channel = channels.create_channel().await?;

        match Self::consume_replies(channel.clone(), address).await {
            Ok(client) => Ok(client),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    async fn consume_replies(
        channel: Arc<dyn TransportChannel>,
        address: &DestinationAddress,
    ) -> Result<ReplyClient, AmqpError> {
        let reply_queue = AddressTopology::reply_queue(address)
            .install(channel.as_ref())
            .await?;
        let (consumer_tag, replies) = channel.basic_consume(&reply_queue, true).await?;

        let cells = SharedCells::default();
        tokio::spawn(dispatch_replies(replies, cells.clone()));

        debug!(
            reply_queue = reply_queue.as_str(),
            address = address.to_string(),
            "reply client created"
        );
        Ok(ReplyClient {
            channel,
            reply_queue,
            consumer_tag,
            cells,
        })
    }

    /// Registers a cell under the next correlation id, then publishes the request.
    async fn request(
        &self,
        address: &DestinationAddress,
        next_id: &AtomicU64,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<PendingReply, AmqpError> {
        let (tx, rx) = oneshot::channel();
        let correlation_id = {
            let mut pending = lock(&self.cells);
            if pending.stopped {
                return Err(AmqpError::ShutdownSignal(
                    "reply consumer stopped".to_owned(),
                ));
            }
            let id = next_id.fetch_add(1, Ordering::SeqCst).to_string();
            pending.cells.insert(id.clone(), tx);
            id
        };
        let pending = PendingReply {
            correlation_id,
            cells: self.cells.clone(),
            reply: rx,
        };

        let properties = MessageProperties::default()
            .with_correlation_id(&pending.correlation_id)
            .with_reply_to(&self.reply_queue)
            .with_content_type(content_type)
            .with_headers(otel::trace_headers());
        self.channel
            .basic_publish(&address.exchange, &address.routing_key(), body, properties)
            .await?;

        Ok(pending)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.is_open() {
            return Ok(());
        }
        let cancelled = self.channel.basic_cancel(&self.consumer_tag).await;
        let closed = self.channel.close().await;
        cancelled.and(closed)
    }
}

/// Hands every reply to the request waiting for its correlation id. When the consumer
/// stops, every request still waiting is failed with a shutdown signal.
async fn dispatch_replies(mut replies: DeliveryStream, cells: SharedCells) {
    while let Some(next) = replies.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(err) if err.is_shutdown() => break,
            Err(err) => {
                warn!(error = err.to_string(), "failure to receive reply");
                continue;
            }
        };

        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            warn!("dropping reply without correlation id");
            continue;
        };
        let cell = lock(&cells).cells.remove(correlation_id);
        match cell {
            Some(cell) => {
                let _ = cell.send(Ok(delivery.body));
            }
            None => debug!(correlation_id, "dropping reply nobody is waiting for"),
        }
    }

    let waiting: Vec<ReplyCell> = {
        let mut pending = lock(&cells);
        pending.stopped = true;
        pending.cells.drain().map(|(_, cell)| cell).collect()
    };
    for cell in waiting {
        let _ = cell.send(Err(AmqpError::ShutdownSignal(
            "reply consumer stopped".to_owned(),
        )));
    }
}

/// Replying destination backed by a private reply queue on the broker.
pub struct AmqpReplyingDestination {
    channels: Arc<dyn ChannelProvider>,
    address: DestinationAddress,
    client: AsyncMutex<Option<ReplyClient>>,
    next_correlation: AtomicU64,
    closed: AtomicBool,
}

impl AmqpReplyingDestination {
    /// Creates the destination and its reply queue.
    pub async fn create(
        channels: Arc<dyn ChannelProvider>,
        address: DestinationAddress,
    ) -> Result<AmqpReplyingDestination, MessagingError> {
        let client = ReplyClient::create(channels.as_ref(), &address).await?;

        Ok(AmqpReplyingDestination {
            channels,
            address,
            client: AsyncMutex::new(Some(client)),
            next_correlation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &DestinationAddress {
        &self.address
    }

    /// Publishes the request, recreating the reply client once if its channel is gone.
    async fn publish(
        &self,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<PendingReply, MessagingError> {
        let mut retries = 1;
        let mut client = self.client.lock().await;

        loop {
            if self.is_closed() {
                return Err(MessagingError::DestinationClosedError);
            }

            let attempt = match client.as_ref() {
                Some(current) => {
                    current
                        .request(&self.address, &self.next_correlation, body, content_type)
                        .await
                }
                None => Err(AmqpError::ShutdownSignal(
                    "reply client is not connected".to_owned(),
                )),
            };

            match attempt {
                Ok(pending) => return Ok(pending),
                Err(err) if err.is_shutdown() && retries > 0 => {
                    retries -= 1;
                    debug!(
                        error = err.to_string(),
                        address = self.address.to_string(),
                        "recreating reply client"
                    );
                    if let Some(stale) = client.take() {
                        let _ = stale.close().await;
                    }
                    *client = Some(ReplyClient::create(self.channels.as_ref(), &self.address).await?);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl ReplyingDestination for AmqpReplyingDestination {
    async fn send_message(
        &self,
        message: &dyn OutMessage,
        timeout: Duration,
    ) -> Result<Vec<u8>, MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::DestinationClosedError);
        }

        let body = message.encode_message()?;
        let mut pending = self.publish(&body, message.content_type()).await?;

        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(reply) => reply.map_err(MessagingError::from),
            Err(_) => Err(MessagingError::TimeoutError(timeout.as_millis() as u64)),
        }
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let mut client = self.client.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        match client.take() {
            Some(client) => client.close().await.map_err(MessagingError::from),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
