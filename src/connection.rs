// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Connection
//!
//! The entry point of the crate. A message connection keeps one broker connection alive
//! in the background, owns the registered listeners, and hands out a sender.
//!
//! Connection attempts run on a background scheduler and are retried every
//! `reconnect_interval` until they succeed or the connection is closed. When the broker
//! connection dies unexpectedly the same schedule kicks in again. After every successful
//! connect each registered listener is re-attached by its own job, which retries every
//! `listener_retry_interval` on failure, so one listener that cannot attach never holds
//! back the others.
//!
//! # Example
//! ```no_run
//! use amqp_messaging::{
//!     AckingHandler, AckingMessageListener, AddressedMessageListener, AmqpMessageConfig,
//!     AmqpMessageConnection, DestinationAddress, InMessage, MessageConnection, MessagingError,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct PrintOrders;
//!
//! #[async_trait]
//! impl AckingHandler for PrintOrders {
//!     async fn process_received(&self, message: &InMessage) -> Result<(), MessagingError> {
//!         println!("{} bytes", message.body().len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), MessagingError> {
//! let config = AmqpMessageConfig::new("localhost:5672", "/", "guest", "guest", "/data", 30)?;
//! let connection = AmqpMessageConnection::amqp(config);
//!
//! let address = DestinationAddress::parse("shop.orders.create@commerce")?;
//! connection
//!     .listen(AddressedMessageListener::new(
//!         "orders",
//!         address,
//!         Arc::new(AckingMessageListener::new(PrintOrders)),
//!     ))
//!     .await;
//!
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::Session,
    config::AmqpMessageConfig,
    consumer::{AmqpConnectedListener, ConnectedListener},
    errors::AmqpError,
    listener::AddressedMessageListener,
    null::NullConnectedListener,
    scheduler::{JobHandler, Scheduler},
    sender::{AmqpMessageSender, MessageSender},
    transport::{amqp::AmqpTransport, Transport},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Lifecycle of a message connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Closed,
}

/// A connection to the messaging server.
#[async_trait]
pub trait MessageConnection: Send + Sync {
    /// Starts delivering messages of the listener's queue to it, replacing a live
    /// subscription of the same listener. If the server is not reachable yet the listener
    /// is attached once it is.
    async fn listen(&self, listener: AddressedMessageListener);

    /// Stops delivering messages to the listener.
    async fn remove_listener(&self, listener: &AddressedMessageListener);

    /// The sender bound to this connection.
    fn sender(&self) -> Arc<dyn MessageSender>;

    /// Closes every listener and replying destination, then the connection itself.
    /// Calling it again does nothing.
    async fn close(&self);
}

/// Background work of a message connection.
#[derive(Debug, Clone)]
pub(crate) enum ReconnectJob {
    Connect,
    ReattachListeners,
    AttachListener(AddressedMessageListener),
}

type ListenerMap = HashMap<AddressedMessageListener, Arc<dyn ConnectedListener>>;

#[derive(Debug, PartialEq, Eq)]
enum Attachment {
    Attached,
    Deferred,
    Failed,
    Dropped,
}

/// Message connection to an AMQP broker.
pub struct AmqpMessageConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    session: Arc<Session>,
    listeners: Mutex<ListenerMap>,
    // serializes subscribing, replacing and removing listeners
    attaching: AsyncMutex<()>,
    sender: Arc<AmqpMessageSender>,
}

impl AmqpMessageConnection {
    /// Creates the connection and schedules the first connection attempt right away.
    /// Must be called from within a tokio runtime.
    pub fn new(config: AmqpMessageConfig, transport: Arc<dyn Transport>) -> AmqpMessageConnection {
        let inner = Arc::new_cyclic(|weak: &Weak<ConnectionInner>| {
            let scheduler = Scheduler::start(Reconnector {
                inner: weak.clone(),
            });
            let session = Arc::new(Session::new(config, transport, scheduler));
            let sender = Arc::new(AmqpMessageSender::new(session.clone()));

            ConnectionInner {
                session,
                listeners: Mutex::new(HashMap::new()),
                attaching: AsyncMutex::new(()),
                sender,
            }
        });

        inner
            .session
            .scheduler()
            .schedule(ReconnectJob::Connect, Duration::ZERO);
        AmqpMessageConnection { inner }
    }

    /// Connection to a RabbitMQ broker.
    pub fn amqp(config: AmqpMessageConfig) -> AmqpMessageConnection {
        AmqpMessageConnection::new(config, AmqpTransport::new())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.session.subscribe_state()
    }
}

#[async_trait]
impl MessageConnection for AmqpMessageConnection {
    async fn listen(&self, listener: AddressedMessageListener) {
        self.inner.listen(listener).await
    }

    async fn remove_listener(&self, listener: &AddressedMessageListener) {
        self.inner.remove_listener(listener).await
    }

    fn sender(&self) -> Arc<dyn MessageSender> {
        self.inner.sender.clone()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

impl ConnectionInner {
    fn listeners(&self) -> MutexGuard<'_, ListenerMap> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retry_later(&self, listener: AddressedMessageListener) {
        self.session.scheduler().schedule(
            ReconnectJob::AttachListener(listener),
            self.session.config().listener_retry_interval(),
        );
    }

    async fn listen(&self, listener: AddressedMessageListener) {
        if self.session.is_closed() {
            warn!(listener = ?listener, "ignoring listener of a closed connection");
            return;
        }

        let _attaching = self.attaching.lock().await;
        self.close_previous(&listener).await;
        match self.attach(&listener, false).await {
            Attachment::Failed => self.retry_later(listener),
            Attachment::Deferred if self.session.is_connected() => {
                // connected while we were deferring; the reattach pass may have missed it
                self.session
                    .scheduler()
                    .schedule(ReconnectJob::AttachListener(listener), Duration::ZERO);
            }
            _ => {}
        }
    }

    async fn remove_listener(&self, listener: &AddressedMessageListener) {
        let _attaching = self.attaching.lock().await;
        let removed = self.listeners().remove(listener);

        let Some(connected) = removed else {
            warn!(listener = ?listener, "tried to remove an unknown listener");
            return;
        };
        info!(listener = ?listener, "removing listener");

        if !connected.is_closed() {
            if let Err(err) = connected.close().await {
                warn!(error = err.to_string(), listener = ?listener, "failure to close listener");
            }
        }
    }

    async fn close(&self) {
        if !self.session.mark_closed() {
            debug!("connection already closed");
            return;
        }
        info!("closing connection to the broker");
        self.session.scheduler().shutdown();

        if let Err(err) = self.sender.close().await {
            warn!(error = err.to_string(), "failure to close sender");
        }

        let listeners: Vec<_> = self.listeners().drain().collect();
        for (listener, connected) in listeners.into_iter().filter(|(_, c)| !c.is_closed()) {
            if let Err(err) = connected.close().await {
                warn!(error = err.to_string(), listener = ?listener, "failure to close listener");
            }
        }

        if let Err(err) = self.session.release().await {
            warn!(error = err.to_string(), "failure to close connection");
        }
    }

    /// Closes the live subscription of an already registered listener.
    async fn close_previous(&self, listener: &AddressedMessageListener) {
        let previous = self.listeners().get(listener).cloned();

        if let Some(previous) = previous.filter(|p| !p.is_closed()) {
            if previous.is_attached() {
                warn!(listener = ?listener, "reconnecting listener");
            }
            if let Err(err) = previous.close().await {
                warn!(
                    error = err.to_string(),
                    listener = ?listener,
                    "could not close old listener subscription"
                );
            }
        }
    }

    /// Subscribes the listener if connected, or leaves it deferred.
    ///
    /// With `registered_only` the outcome is dropped when the listener was removed in the
    /// meantime, and a deferred listener keeps its current entry.
    async fn attach(&self, listener: &AddressedMessageListener, registered_only: bool) -> Attachment {
        if !self.session.is_connected() {
            if !registered_only {
                info!(listener = ?listener, "deferring listener until we reconnect");
                self.listeners()
                    .insert(listener.clone(), Arc::new(NullConnectedListener::default()));
            }
            return Attachment::Deferred;
        }

        info!(listener = ?listener, "connecting listener");
        let connected = AmqpConnectedListener::start(listener.clone(), self.session.as_ref()).await;
        let failed = connected.is_closed();

        let stored = {
            let mut listeners = self.listeners();
            let keep = !self.session.is_closed()
                && (!registered_only || listeners.contains_key(listener));
            if keep {
                listeners.insert(listener.clone(), connected.clone());
            }
            keep
        };

        if !stored {
            let _ = connected.close().await;
            return Attachment::Dropped;
        }
        if failed {
            Attachment::Failed
        } else {
            Attachment::Attached
        }
    }

    async fn reattach(&self, listener: AddressedMessageListener) {
        let _attaching = self.attaching.lock().await;
        let current = match self.listeners().get(&listener) {
            Some(entry) => entry.clone(),
            None => {
                debug!(listener = ?listener, "listener was removed, not reattaching");
                return;
            }
        };
        if current.is_attached() {
            debug!(listener = ?listener, "listener already attached");
            return;
        }

        self.close_previous(&listener).await;
        match self.attach(&listener, true).await {
            Attachment::Attached => {}
            Attachment::Deferred => info!(listener = ?listener, "listener connection deferred"),
            Attachment::Failed => {
                warn!(listener = ?listener, "failed to connect listener, will retry");
                self.retry_later(listener);
            }
            Attachment::Dropped => debug!(listener = ?listener, "listener went away while attaching"),
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.session.scheduler().shutdown();
    }
}

/// Runs reconnect jobs on behalf of a connection that may already be gone.
struct Reconnector {
    inner: Weak<ConnectionInner>,
}

#[async_trait]
impl JobHandler<ReconnectJob> for Reconnector {
    async fn run(&self, job: ReconnectJob, scheduler: &Scheduler<ReconnectJob>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.session.is_closed() {
            return;
        }

        match job {
            ReconnectJob::Connect => match inner.session.connect().await {
                Ok(_) => {}
                Err(AmqpError::ConnectionClosedError) => {}
                Err(err) => {
                    debug!(error = err.to_string(), "could not connect to the broker, retrying");
                    scheduler.schedule(
                        ReconnectJob::Connect,
                        inner.session.config().reconnect_interval(),
                    );
                }
            },
            ReconnectJob::ReattachListeners => {
                let listeners: Vec<_> = inner.listeners().keys().cloned().collect();
                for listener in listeners {
                    scheduler.schedule(ReconnectJob::AttachListener(listener), Duration::ZERO);
                }
            }
            ReconnectJob::AttachListener(listener) => inner.reattach(listener).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::DestinationAddress,
        errors::MessagingError,
        listener::{AckingMessageListener, MessageListener},
        message::RawMessage,
        queue::QueueDefinition,
        testing::{eventually, init_tracing, Echo, Recorder},
        transport::{memory::MemoryBroker, TransportChannel, TransportConnection},
    };
    use tokio::sync::mpsc;

    fn connection(broker: &MemoryBroker) -> AmqpMessageConnection {
        let config = AmqpMessageConfig::default()
            .with_reconnect_interval(Duration::from_millis(20))
            .with_listener_retry_interval(Duration::from_millis(20));
        AmqpMessageConnection::new(config, Arc::new(broker.clone()))
    }

    fn address() -> DestinationAddress {
        DestinationAddress::parse("shop.orders.create@commerce").unwrap()
    }

    fn recording(queue: &str) -> (AddressedMessageListener, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (handler, seen) = Recorder::new(false);
        let listener = AddressedMessageListener::new(
            queue,
            address(),
            Arc::new(AckingMessageListener::new(handler)),
        );
        (listener, seen)
    }

    #[tokio::test]
    async fn deferred_listeners_attach_once_the_broker_is_reachable() {
        init_tracing();
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let conn = connection(&broker);
        let (listener, mut seen) = recording("orders");

        conn.listen(listener.clone()).await;
        assert_eq!(broker.consume_count("orders"), 0);
        assert!(!conn.is_connected());
        let waiting = conn.inner.listeners().get(&listener).cloned().unwrap();
        assert!(!waiting.is_attached());
        assert!(!waiting.is_closed());

        broker.set_reachable(true);
        let mut state = conn.subscribe_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        eventually("listener attached", || broker.consumer_count("orders") == 1).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.consume_count("orders"), 1);
        assert!(conn.inner.listeners()[&listener].is_attached());

        conn.sender()
            .send_message(&RawMessage::from("late order"), &address())
            .await
            .unwrap();
        assert_eq!(seen.recv().await.unwrap(), b"late order");
        conn.close().await;
    }

    #[tokio::test]
    async fn listeners_come_back_after_the_broker_drops_the_connection() {
        init_tracing();
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        eventually("connected", || conn.is_connected()).await;

        let (listener, mut seen) = recording("orders");
        conn.listen(listener).await;
        assert_eq!(broker.consumer_count("orders"), 1);

        broker.disconnect_all();
        eventually("reconnected", || broker.connect_count() == 2).await;
        eventually("listener reattached", || broker.consumer_count("orders") == 1).await;
        assert_eq!(broker.consume_count("orders"), 2);
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.sender()
            .send_message(&RawMessage::from("after outage"), &address())
            .await
            .unwrap();
        assert_eq!(seen.recv().await.unwrap(), b"after outage");
        conn.close().await;
    }

    #[tokio::test]
    async fn listening_again_replaces_the_live_subscription() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        eventually("connected", || conn.is_connected()).await;
        let (listener, _seen) = recording("orders");

        conn.listen(listener.clone()).await;
        conn.listen(listener.clone()).await;

        assert_eq!(broker.consume_count("orders"), 2);
        assert_eq!(broker.consumer_count("orders"), 1);

        conn.remove_listener(&listener).await;
        assert_eq!(broker.consumer_count("orders"), 0);
        conn.remove_listener(&listener).await;
        conn.close().await;
    }

    #[tokio::test]
    async fn a_listener_that_cannot_attach_does_not_hold_back_the_others() {
        init_tracing();
        let broker = MemoryBroker::new();
        let owner = broker.connect(&AmqpMessageConfig::default()).await.unwrap();
        owner
            .create_channel()
            .await
            .unwrap()
            .queue_declare(&QueueDefinition::new("blocked").exclusive())
            .await
            .unwrap();

        let conn = connection(&broker);
        eventually("connected", || conn.is_connected()).await;
        let (blocked, _blocked_seen) = recording("blocked");
        let (ok, mut ok_seen) = recording("ok");

        conn.listen(blocked).await;
        conn.listen(ok).await;
        assert_eq!(broker.consumer_count("ok"), 1);
        assert_eq!(broker.consumer_count("blocked"), 0);

        conn.sender()
            .send_message(&RawMessage::from("still served"), &address())
            .await
            .unwrap();
        assert_eq!(ok_seen.recv().await.unwrap(), b"still served");

        owner.close(Duration::from_secs(1)).await.unwrap();
        eventually("blocked listener attached", || {
            broker.consumer_count("blocked") == 1
        })
        .await;
        assert_eq!(broker.consumer_count("ok"), 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn close_releases_everything_and_can_be_repeated() {
        init_tracing();
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        eventually("connected", || conn.is_connected()).await;

        let (listener, _seen) = recording("orders");
        conn.listen(listener).await;
        let destination = conn
            .sender()
            .create_replying_destination(&address())
            .await
            .unwrap();

        conn.close().await;
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(destination.is_closed());
        assert_eq!(broker.consumer_count("orders"), 0);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(
            conn.sender()
                .send_message(&RawMessage::from("too late"), &address())
                .await,
            Err(MessagingError::ConnectivityError(
                AmqpError::ConnectionClosedError
            ))
        );
    }

    #[tokio::test]
    async fn requests_get_replies_through_the_connection() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker);
        let echo: Arc<dyn MessageListener> = Arc::new(Echo);
        conn.listen(AddressedMessageListener::new("echo", address(), echo))
            .await;
        eventually("echo attached", || broker.consumer_count("echo") == 1).await;

        let destination = conn
            .sender()
            .create_replying_destination(&address())
            .await
            .unwrap();
        let reply = destination
            .send_message(&RawMessage::from("hi"), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(reply, b"re:hi");
        conn.close().await;
    }
}
