// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod scheduler;
mod topology;

#[cfg(test)]
mod testing;

pub mod address;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delayed;
pub mod errors;
pub mod exchange;
pub mod listener;
pub mod message;
pub mod null;
pub mod queue;
pub mod replying;
pub mod sender;
pub mod transport;

pub use address::DestinationAddress;
pub use config::{AmqpMessageConfig, HostAddress};
pub use connection::{AmqpMessageConnection, ConnectionState, MessageConnection};
pub use consumer::{AmqpConnectedListener, ConnectedListener};
pub use delayed::DelayedMessageConnection;
pub use errors::{AmqpError, MessagingError};
pub use listener::{AckingHandler, AckingMessageListener, AddressedMessageListener, MessageListener};
pub use message::{InMessage, IntMessage, JsonMessage, OutMessage, RawMessage};
pub use null::{NullConnectedListener, NullMessageSender, NullReplyingDestination};
pub use replying::{AmqpReplyingDestination, ReplyingDestination};
pub use sender::{AmqpMessageSender, MessageSender};
