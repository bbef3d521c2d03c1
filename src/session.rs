// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Sessions
//!
//! A session is one connection plus one channel, live for the duration of a
//! single epoch. The manager only talks to the broker through the [`Session`]
//! and [`Connector`] traits; `channel::AmqpConnector` provides the lapin
//! implementation.
//!
//! Implementations must tolerate concurrent calls: every consumption loop of an
//! epoch declares topology and acknowledges messages on the same session.

use crate::{
    configs::RabbitMQConfigs, errors::AmqpError, exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{message::Delivery, BasicProperties};
use std::sync::Arc;

/// A message delivered to a consumption loop.
#[derive(Debug, Clone, Default)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Stream of deliveries for one consumer; it ends when the broker closes it.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// One connection and one channel to the broker.
#[async_trait]
pub trait Session: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError>;

    /// Opens a manually acknowledged consumption stream on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Acknowledges exactly the delivery identified by `delivery_tag`.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Closes the channel and then the connection. Failures are only logged.
    async fn close(&self);
}

/// Opens sessions, one per epoch.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dials the broker, opens a channel and applies the configured QoS.
    ///
    /// Any of the three steps failing aborts the attempt.
    async fn connect(&self, cfg: &RabbitMQConfigs) -> Result<Arc<dyn Session>, AmqpError>;
}

#[async_trait]
impl<T> Connector for Arc<T>
where
    T: Connector + ?Sized,
{
    async fn connect(&self, cfg: &RabbitMQConfigs) -> Result<Arc<dyn Session>, AmqpError> {
        (**self).connect(cfg).await
    }
}
