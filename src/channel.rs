// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels with lapin
//! and exposes them to the manager as a [`Session`]. A channel is only handed
//! out once the connection is up, the channel is open and the QoS is applied;
//! any of those steps failing aborts the whole attempt and closes whatever was
//! already opened.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    session::{Connector, DeliveryStream, InboundDelivery, Session},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// AMQP reply code for a regular close
const REPLY_SUCCESS: u16 = 200;

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// This function establishes a connection using the configured connection
/// string, creates a channel on that connection and applies the prefetch limit
/// to it. Both the connection and channel are wrapped in Arc for thread-safe sharing.
///
/// # Parameters
/// * `cfg` - Configuration containing the connection string and the QoS limit
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), AmqpError>` -
///   A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!(uri = cfg.redacted_uri(), "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    conn.on_error(|err| error!(error = err.to_string(), "amqp connection failure"));
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            close_connection(&conn).await;
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }?;
    debug!("channel created");

    if let Err(err) = channel
        .basic_qos(cfg.qos, BasicQosOptions { global: true })
        .await
    {
        error!(error = err.to_string(), qos = cfg.qos, "failure to configure qos");
        close_channel(&channel).await;
        close_connection(&conn).await;
        return Err(AmqpError::QoSDeclarationError(err.to_string()));
    }
    debug!(qos = cfg.qos, "qos configured");

    Ok((Arc::new(conn), Arc::new(channel)))
}

async fn close_channel(channel: &Channel) {
    if let Err(err) = channel.close(REPLY_SUCCESS, "OK").await {
        debug!(error = err.to_string(), "channel already closed");
    }
}

async fn close_connection(conn: &Connection) {
    if let Err(err) = conn.close(REPLY_SUCCESS, "OK").await {
        debug!(error = err.to_string(), "connection already closed");
    }
}

/// Lapin backed [`Connector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, cfg: &RabbitMQConfigs) -> Result<Arc<dyn Session>, AmqpError> {
        let (conn, channel) = new_amqp_channel(cfg).await?;
        Ok(Arc::new(AmqpSession { conn, channel }))
    }
}

/// A live lapin connection and the channel shared by every consumption loop.
///
/// Lapin channels are safe for concurrent use, so no extra locking is needed.
pub struct AmqpSession {
    conn: Arc<Connection>,
    channel: Arc<Channel>,
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    auto_delete: def.delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(
                    def.name.clone(),
                    err.to_string(),
                ))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.to_owned(),
                    binding.queue_name.to_owned(),
                    binding.routing_key.to_owned(),
                    err.to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(
                    queue.to_owned(),
                    err.to_string(),
                ))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(InboundDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(delivery_tag, err.to_string()))
    }

    async fn close(&self) {
        close_channel(&self.channel).await;
        close_connection(&self.conn).await;
    }
}
