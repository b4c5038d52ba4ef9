// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Null Variants
//!
//! Stand-ins honouring the same contracts as the broker-backed types while doing
//! nothing. They are what a [`DelayedMessageConnection`](crate::delayed::DelayedMessageConnection)
//! hands out before it is initialized.

use crate::{
    address::DestinationAddress,
    consumer::ConnectedListener,
    errors::{AmqpError, MessagingError},
    message::OutMessage,
    replying::ReplyingDestination,
    sender::MessageSender,
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info};

/// A listener that never received anything. Stands in for listeners waiting for a
/// connection.
#[derive(Debug, Default)]
pub struct NullConnectedListener {
    closed: AtomicBool,
}

#[async_trait]
impl ConnectedListener for NullConnectedListener {
    async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing null connected listener");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_attached(&self) -> bool {
        false
    }
}

/// Drops every message it is asked to send.
#[derive(Debug, Default)]
pub struct NullMessageSender;

#[async_trait]
impl MessageSender for NullMessageSender {
    async fn send_message(
        &self,
        message: &dyn OutMessage,
        address: &DestinationAddress,
    ) -> Result<(), MessagingError> {
        info!(message = ?message, address = address.to_string(), "dropping message");
        Ok(())
    }

    async fn create_replying_destination(
        &self,
        _address: &DestinationAddress,
    ) -> Result<Arc<dyn ReplyingDestination>, MessagingError> {
        Ok(Arc::new(NullReplyingDestination::default()))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        Ok(())
    }
}

/// A destination nothing can be sent through, since no reply could ever come back.
#[derive(Debug, Default)]
pub struct NullReplyingDestination {
    closed: AtomicBool,
}

#[async_trait]
impl ReplyingDestination for NullReplyingDestination {
    async fn send_message(
        &self,
        _message: &dyn OutMessage,
        _timeout: Duration,
    ) -> Result<Vec<u8>, MessagingError> {
        Err(MessagingError::NullDestinationError)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        debug!("closing null replying destination");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IntMessage;

    #[tokio::test]
    async fn null_sender_drops_messages_and_hands_out_dead_destinations() {
        let sender = NullMessageSender;
        let address = DestinationAddress::parse("a.b.c@d").unwrap();

        sender
            .send_message(&IntMessage::new(1), &address)
            .await
            .unwrap();

        let destination = sender.create_replying_destination(&address).await.unwrap();
        assert_eq!(
            destination
                .send_message(&IntMessage::new(1), Duration::from_secs(1))
                .await,
            Err(MessagingError::NullDestinationError)
        );
        assert!(!destination.is_closed());
        destination.close().await.unwrap();
        assert!(destination.is_closed());
        sender.close().await.unwrap();
    }

    #[tokio::test]
    async fn null_listener_only_tracks_closing() {
        let listener = NullConnectedListener::default();
        assert!(!listener.is_closed());
        assert!(!listener.is_attached());
        listener.close().await.unwrap();
        assert!(listener.is_closed());
    }
}
