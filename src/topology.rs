// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Address Topology
//!
//! The minimal broker-side topology the messaging layer needs for one address: the
//! address's exchange (durable, direct), a queue, and the binding between them.
//! Listeners get a durable named queue bound by the address routing key; replying
//! destinations get an exclusive, server-named queue bound by its own name.

use crate::{
    address::DestinationAddress,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::TransportChannel,
};
use tracing::debug;

/// How the declared queue is bound to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BindingKey {
    /// The address routing key, `application.service.command`.
    Routing(String),
    /// The queue's own (possibly broker generated) name.
    QueueName,
}

/// Exchange, queue and binding for one address.
#[derive(Debug, Clone)]
pub(crate) struct AddressTopology<'tp> {
    exchange: ExchangeDefinition<'tp>,
    queue: QueueDefinition,
    key: BindingKey,
}

impl<'tp> AddressTopology<'tp> {
    /// Durable queue `queue_name` receiving everything sent to `addr`.
    pub(crate) fn listener(queue_name: &str, addr: &'tp DestinationAddress) -> Self {
        AddressTopology {
            exchange: exchange_for(addr),
            queue: QueueDefinition::new(queue_name).durable(),
            key: BindingKey::Routing(addr.routing_key()),
        }
    }

    /// Private queue collecting replies to requests sent to `addr`.
    pub(crate) fn reply_queue(addr: &'tp DestinationAddress) -> Self {
        AddressTopology {
            exchange: exchange_for(addr),
            queue: QueueDefinition::server_named().exclusive().delete(),
            key: BindingKey::QueueName,
        }
    }

    /// Declares everything on `channel` and returns the queue name.
    pub(crate) async fn install(&self, channel: &dyn TransportChannel) -> Result<String, AmqpError> {
        channel.exchange_declare(&self.exchange).await?;
        let queue = channel.queue_declare(&self.queue).await?;

        let key = match &self.key {
            BindingKey::Routing(key) => key.as_str(),
            BindingKey::QueueName => queue.as_str(),
        };
        channel
            .queue_bind(
                &QueueBinding::new(&queue)
                    .exchange(self.exchange.name())
                    .routing_key(key),
            )
            .await?;

        debug!(
            queue = queue.as_str(),
            exchange = self.exchange.name(),
            key,
            "queue was bounded"
        );
        Ok(queue)
    }
}

/// The durable direct exchange backing an address's grouping.
pub(crate) fn exchange_for(addr: &DestinationAddress) -> ExchangeDefinition<'_> {
    ExchangeDefinition::new(&addr.exchange).durable()
}
