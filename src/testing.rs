// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Shared helpers for the unit tests.

use crate::{
    channel::ChannelProvider,
    config::AmqpMessageConfig,
    errors::{AmqpError, MessagingError},
    listener::{AckingHandler, MessageListener},
    message::{InMessage, RawMessage},
    transport::{memory::MemoryBroker, Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::Level;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init();
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Hands out channels of one fixed connection, without any reconnect logic.
pub(crate) struct FixedChannels {
    conn: Arc<dyn TransportConnection>,
}

impl FixedChannels {
    pub(crate) async fn connect(broker: &MemoryBroker) -> Arc<FixedChannels> {
        let conn = broker
            .connect(&AmqpMessageConfig::default())
            .await
            .unwrap();
        Arc::new(FixedChannels { conn })
    }
}

#[async_trait]
impl ChannelProvider for FixedChannels {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        self.conn.create_channel().await
    }
}

/// Records every body it sees; fails instead of processing when asked to.
pub(crate) struct Recorder {
    pub(crate) seen: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) fail: bool,
}

impl Recorder {
    pub(crate) fn new(fail: bool) -> (Recorder, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (Recorder { seen, fail }, rx)
    }
}

#[async_trait]
impl AckingHandler for Recorder {
    async fn process_received(&self, message: &InMessage) -> Result<(), MessagingError> {
        let _ = self.seen.send(message.body().to_vec());
        if self.fail {
            return Err(MessagingError::handler("refusing to process"));
        }
        Ok(())
    }
}

/// Replies to every request with its own body prefixed by `re:`.
pub(crate) struct Echo;

#[async_trait]
impl MessageListener for Echo {
    async fn received(&self, message: InMessage) -> Result<(), MessagingError> {
        let mut body = b"re:".to_vec();
        body.extend_from_slice(message.body());
        message.reply(&RawMessage(body)).await?;
        message.ack().await
    }
}
