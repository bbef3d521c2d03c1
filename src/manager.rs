// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Manager
//!
//! The manager owns the receiver registry and the broker connection. It runs
//! an endless sequence of epochs; each epoch:
//! 1. Opens a session (connection, channel and QoS)
//! 2. Spawns one consumption loop per registered receiver, staggered
//! 3. Waits for every loop to exit
//! 4. Closes the session and sleeps before the next attempt
//!
//! Any failure to open the session simply ends the epoch early. Retries are
//! infinite and happen at a fixed interval.

use crate::{
    channel::AmqpConnector,
    configs::RabbitMQConfigs,
    consumer::ConsumptionTask,
    receiver::Receiver,
    session::{Connector, Session},
};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::watch, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the manager's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Consumption loops are running; the manager waits for all of them to exit
    Draining,
}

/// Multiplexes receivers over one self-healing broker connection.
///
/// Receivers must be registered before the manager is started: registration
/// needs `&mut self` while `start` and `run` borrow the manager for as long as
/// they run.
pub struct RabbitMQManager<C = AmqpConnector> {
    cfg: RabbitMQConfigs,
    connector: C,
    receivers: Vec<Arc<dyn Receiver>>,
    state: watch::Sender<ConnectionState>,
}

impl RabbitMQManager<AmqpConnector> {
    /// Creates a manager connecting through lapin.
    pub fn new(cfg: RabbitMQConfigs) -> Self {
        RabbitMQManager::with_connector(cfg, AmqpConnector)
    }
}

impl<C> RabbitMQManager<C>
where
    C: Connector,
{
    pub fn with_connector(cfg: RabbitMQConfigs, connector: C) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        RabbitMQManager {
            cfg,
            connector,
            receivers: vec![],
            state,
        }
    }

    /// Appends a receiver to the registry. Duplicates are not detected.
    pub fn register_receiver(&mut self, receiver: Arc<dyn Receiver>) -> &mut Self {
        self.receivers.push(receiver);
        self
    }

    pub fn receivers(&self) -> usize {
        self.receivers.len()
    }

    /// Subscribes to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Runs the reconnect loop forever.
    pub async fn start(&self) {
        self.run(CancellationToken::new()).await
    }

    /// Runs the reconnect loop until `cancel` is triggered.
    ///
    /// Cancellation stops every consumption loop at its next wait for a
    /// delivery; the method returns once all of them exited and the session was
    /// closed. Dropping the returned future aborts the running consumption
    /// loops and closes the session in the background.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut epoch: u64 = 0;

        while !cancel.is_cancelled() {
            epoch += 1;
            self.run_epoch(epoch, &cancel).await;
            self.state.send_replace(ConnectionState::Disconnected);

            if cancel.is_cancelled() {
                break;
            }

            warn!(
                epoch,
                delay_ms = self.cfg.reconnect_delay_ms,
                "waiting before reconnect"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.cfg.reconnect_delay()) => {}
            }
        }

        info!(epoch, "rabbitmq manager stopped");
    }

    async fn run_epoch(&self, epoch: u64, cancel: &CancellationToken) {
        self.state.send_replace(ConnectionState::Connecting);
        debug!(epoch, uri = self.cfg.redacted_uri(), "trying to connect");

        let session = match self.connector.connect(&self.cfg).await {
            Ok(session) => session,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    epoch,
                    uri = self.cfg.redacted_uri(),
                    "failure to open session, will retry"
                );
                return;
            }
        };

        self.state.send_replace(ConnectionState::Connected);
        info!(epoch, receivers = self.receivers.len(), "connected");

        // Declared before the join set so it drops last: consumers are aborted
        // first, then the session is closed.
        let teardown = SessionGuard(Some(session.clone()));
        let mut consumers = JoinSet::new();

        for (index, receiver) in self.receivers.iter().enumerate() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.cfg.spawn_stagger()) => {}
            }

            let task = ConsumptionTask {
                epoch,
                session: session.clone(),
                receiver: receiver.clone(),
                policy: self.cfg.topology.clone(),
                cancel: cancel.child_token(),
            };
            consumers.spawn(async move { (index, task.run().await) });
        }

        self.state.send_replace(ConnectionState::Draining);

        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok((index, Ok(()))) => debug!(epoch, receiver = index, "consumer finished"),
                Ok((index, Err(err))) => warn!(
                    error = err.to_string(),
                    epoch,
                    receiver = index,
                    "consumer aborted"
                ),
                Err(err) => error!(error = err.to_string(), epoch, "consumer task failed"),
            }
        }

        teardown.close().await;
        warn!(epoch, "all consumers exited, session closed");
    }
}

/// Closes an epoch's session exactly once.
///
/// If the epoch future is dropped before its teardown (e.g. `start()` raced
/// in a `select!` or wrapped in a timeout) the close runs on a spawned task.
struct SessionGuard(Option<Arc<dyn Session>>);

impl SessionGuard {
    async fn close(mut self) {
        if let Some(session) = self.0.take() {
            session.close().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.0.take() else {
            return;
        };

        if let Ok(handle) = Handle::try_current() {
            warn!("epoch dropped before teardown, closing session");
            handle.spawn(async move { session.close().await });
        }
    }
}
