// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module owns the single live broker connection of a message connection and hands
//! out channels derived from it. Asking for a channel while no usable connection exists
//! re-establishes one on the spot; unexpected shutdowns of the live connection are
//! observed and turned into background reconnect attempts.

use crate::{
    config::AmqpMessageConfig,
    connection::{ConnectionState, ReconnectJob},
    errors::AmqpError,
    scheduler::Scheduler,
    transport::{Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Produces fresh channels from the current connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Creates a channel, reconnecting the underlying connection if necessary.
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;
}

type ConnectionSlot = Arc<RwLock<Option<Arc<dyn TransportConnection>>>>;

/// The authoritative connection handle of one message connection, plus its state.
pub(crate) struct Session {
    config: AmqpMessageConfig,
    transport: Arc<dyn Transport>,
    current: ConnectionSlot,
    state: Arc<watch::Sender<ConnectionState>>,
    connect_lock: Mutex<()>,
    scheduler: Scheduler<ReconnectJob>,
}

impl Session {
    pub(crate) fn new(
        config: AmqpMessageConfig,
        transport: Arc<dyn Transport>,
        scheduler: Scheduler<ReconnectJob>,
    ) -> Session {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Session {
            config,
            transport,
            current: Arc::new(RwLock::new(None)),
            state: Arc::new(state),
            connect_lock: Mutex::new(()),
            scheduler,
        }
    }

    pub(crate) fn config(&self) -> &AmqpMessageConfig {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> &Scheduler<ReconnectJob> {
        &self.scheduler
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.current_open().is_some()
    }

    /// Moves to the terminal closed state. Returns false if it was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
            true
        })
    }

    fn current_open(&self) -> Option<Arc<dyn TransportConnection>> {
        read_slot(&self.current).filter(|conn| conn.is_open())
    }

    /// Returns the live connection, establishing a new one if there is none.
    ///
    /// Every newly established connection gets a shutdown observer and triggers the
    /// re-attachment of registered listeners.
    pub(crate) async fn connect(&self) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let _guard = self.connect_lock.lock().await;

        if self.is_closed() {
            return Err(AmqpError::ConnectionClosedError);
        }
        if let Some(conn) = self.current_open() {
            return Ok(conn);
        }

        set_state(&self.state, ConnectionState::Connecting);
        let conn = self.transport.connect(&self.config).await?;

        if self.is_closed() {
            let _ = conn.close(self.config.close_timeout()).await;
            return Err(AmqpError::ConnectionClosedError);
        }

        {
            let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(conn.clone());
        }
        self.observe_shutdown(conn.clone());
        set_state(&self.state, ConnectionState::Connected);
        info!(config = self.config.to_string(), "connection established");

        self.scheduler
            .schedule(ReconnectJob::ReattachListeners, Duration::ZERO);
        Ok(conn)
    }

    fn observe_shutdown(&self, conn: Arc<dyn TransportConnection>) {
        let shutdown = conn.on_shutdown();
        let current = self.current.clone();
        let state = self.state.clone();
        let scheduler = self.scheduler.clone();
        let backoff = self.config.reconnect_interval();

        tokio::spawn(async move {
            let reason = match shutdown.await {
                Ok(reason) => reason,
                Err(_) if !conn.is_open() => {
                    AmqpError::ShutdownSignal("connection lost before it was observed".to_owned())
                }
                Err(_) => return,
            };
            if *state.borrow() == ConnectionState::Closed {
                return;
            }
            let is_current = read_slot(&current).is_some_and(|live| same_connection(&live, &conn));
            if !is_current {
                debug!(error = reason.to_string(), "ignoring shutdown of a stale connection");
                return;
            }

            warn!(error = reason.to_string(), "connection lost, scheduling reconnect");
            set_state(&state, ConnectionState::Connecting);
            scheduler.schedule(ReconnectJob::Connect, backoff);
        });
    }

    /// Closes and forgets the live connection, if any.
    pub(crate) async fn release(&self) -> Result<(), AmqpError> {
        let conn = {
            let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };

        match conn {
            Some(conn) if conn.is_open() => conn.close(self.config.close_timeout()).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ChannelProvider for Session {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if let Some(conn) = self.current_open() {
            match conn.create_channel().await {
                Err(err) if err.is_shutdown() => {
                    debug!(error = err.to_string(), "connection went away, reconnecting");
                }
                other => return other,
            }
        }

        let conn = self.connect().await?;
        conn.create_channel().await
    }
}

fn read_slot(slot: &ConnectionSlot) -> Option<Arc<dyn TransportConnection>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn same_connection(a: &Arc<dyn TransportConnection>, b: &Arc<dyn TransportConnection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Closed is terminal; any other transition is applied as is.
fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == ConnectionState::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scheduler::JobHandler, transport::memory::MemoryBroker};
    use tokio::sync::mpsc;

    struct Jobs(mpsc::UnboundedSender<ReconnectJob>);

    #[async_trait]
    impl JobHandler<ReconnectJob> for Jobs {
        async fn run(&self, job: ReconnectJob, _: &Scheduler<ReconnectJob>) {
            let _ = self.0.send(job);
        }
    }

    fn session(broker: &MemoryBroker) -> (Session, mpsc::UnboundedReceiver<ReconnectJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = AmqpMessageConfig::default().with_reconnect_interval(Duration::from_millis(10));
        let session = Session::new(config, Arc::new(broker.clone()), Scheduler::start(Jobs(tx)));
        (session, rx)
    }

    #[tokio::test]
    async fn channels_share_one_connection_and_trigger_reattachment_once() {
        let broker = MemoryBroker::new();
        let (session, mut jobs) = session(&broker);
        assert_eq!(session.state(), ConnectionState::Uninitialized);

        session.create_channel().await.unwrap();
        session.create_channel().await.unwrap();

        assert_eq!(broker.connect_count(), 1);
        assert!(session.is_connected());
        assert!(matches!(jobs.recv().await, Some(ReconnectJob::ReattachListeners)));
    }

    #[tokio::test]
    async fn unexpected_shutdown_schedules_a_reconnect() {
        let broker = MemoryBroker::new();
        let (session, mut jobs) = session(&broker);
        session.connect().await.unwrap();
        assert!(matches!(jobs.recv().await, Some(ReconnectJob::ReattachListeners)));

        broker.disconnect_all();

        assert!(matches!(jobs.recv().await, Some(ReconnectJob::Connect)));
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(!session.is_connected());

        session.create_channel().await.unwrap();
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn closed_sessions_refuse_to_connect() {
        let broker = MemoryBroker::new();
        let (session, _jobs) = session(&broker);
        session.connect().await.unwrap();

        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        session.release().await.unwrap();

        assert_eq!(broker.open_connections(), 0);
        assert_eq!(
            session.create_channel().await.err(),
            Some(AmqpError::ConnectionClosedError)
        );
    }
}
