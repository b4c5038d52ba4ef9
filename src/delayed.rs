// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Message Connection
//!
//! A message connection that can be handed out before the real one exists. Until
//! [`DelayedMessageConnection::init`] is called, listeners are kept aside and attached to
//! the real connection on init, senders drop their messages, and closing does nothing.

use crate::{
    connection::MessageConnection,
    errors::MessagingError,
    listener::AddressedMessageListener,
    null::NullMessageSender,
    sender::MessageSender,
};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Default)]
pub struct DelayedMessageConnection {
    delegate: OnceLock<Arc<dyn MessageConnection>>,
    impatient: Mutex<Vec<AddressedMessageListener>>,
}

impl DelayedMessageConnection {
    pub fn new() -> DelayedMessageConnection {
        DelayedMessageConnection::default()
    }

    /// Starts using `delegate`, attaching every listener registered so far. May only be
    /// called once.
    pub async fn init(&self, delegate: Arc<dyn MessageConnection>) -> Result<(), MessagingError> {
        let mut impatient = self.impatient.lock().await;
        if self.delegate.set(delegate.clone()).is_err() {
            return Err(MessagingError::AlreadyInitializedError);
        }

        for listener in impatient.drain(..) {
            delegate.listen(listener).await;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.delegate.get().is_some()
    }
}

#[async_trait]
impl MessageConnection for DelayedMessageConnection {
    async fn listen(&self, listener: AddressedMessageListener) {
        if let Some(delegate) = self.delegate.get() {
            return delegate.listen(listener).await;
        }

        let mut impatient = self.impatient.lock().await;
        match self.delegate.get() {
            Some(delegate) => {
                drop(impatient);
                delegate.listen(listener).await;
            }
            None => {
                info!(listener = ?listener, "message connection not yet initialized");
                impatient.push(listener);
            }
        }
    }

    async fn remove_listener(&self, listener: &AddressedMessageListener) {
        if let Some(delegate) = self.delegate.get() {
            return delegate.remove_listener(listener).await;
        }

        let mut impatient = self.impatient.lock().await;
        match self.delegate.get() {
            Some(delegate) => {
                drop(impatient);
                delegate.remove_listener(listener).await;
            }
            None => impatient.retain(|waiting| waiting != listener),
        }
    }

    fn sender(&self) -> Arc<dyn MessageSender> {
        match self.delegate.get() {
            Some(delegate) => delegate.sender(),
            None => Arc::new(NullMessageSender),
        }
    }

    async fn close(&self) {
        match self.delegate.get() {
            Some(delegate) => delegate.close().await,
            None => debug!("closing message connection that was never initialized"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::DestinationAddress,
        config::AmqpMessageConfig,
        connection::{AmqpMessageConnection, ConnectionState},
        listener::AckingMessageListener,
        message::RawMessage,
        testing::{eventually, Recorder},
        transport::memory::MemoryBroker,
    };
    use std::time::Duration;

    fn listener(queue: &str) -> AddressedMessageListener {
        let (handler, _seen) = Recorder::new(false);
        AddressedMessageListener::new(
            queue,
            DestinationAddress::parse("app.jobs.run@work").unwrap(),
            Arc::new(AckingMessageListener::new(handler)),
        )
    }

    #[tokio::test]
    async fn stays_inert_until_initialized() {
        let delayed = DelayedMessageConnection::new();
        let address = DestinationAddress::parse("app.jobs.run@work").unwrap();

        let sender = delayed.sender();
        sender
            .send_message(&RawMessage::from("dropped"), &address)
            .await
            .unwrap();
        let destination = sender.create_replying_destination(&address).await.unwrap();
        assert_eq!(
            destination
                .send_message(&RawMessage::from("ping"), Duration::from_millis(10))
                .await,
            Err(MessagingError::NullDestinationError)
        );

        delayed.close().await;
        assert!(!delayed.is_initialized());
    }

    #[tokio::test]
    async fn hands_waiting_listeners_to_the_delegate() {
        let broker = MemoryBroker::new();
        let delayed = DelayedMessageConnection::new();
        let kept = listener("kept");
        let dropped = listener("dropped");

        delayed.listen(kept).await;
        delayed.listen(dropped.clone()).await;
        delayed.remove_listener(&dropped).await;

        let real = Arc::new(AmqpMessageConnection::new(
            AmqpMessageConfig::default().with_reconnect_interval(Duration::from_millis(20)),
            Arc::new(broker.clone()),
        ));
        delayed.init(real.clone()).await.unwrap();

        eventually("kept listener attached", || broker.consumer_count("kept") == 1).await;
        assert_eq!(broker.consume_count("dropped"), 0);

        assert_eq!(
            delayed.init(real.clone()).await,
            Err(MessagingError::AlreadyInitializedError)
        );

        delayed.close().await;
        assert_eq!(real.state(), ConnectionState::Closed);
        assert_eq!(broker.consumer_count("kept"), 0);
    }
}
