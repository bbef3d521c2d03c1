// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Receivers
//!
//! A receiver is the caller-supplied consumer of one logical queue binding.
//! The manager pulls the receiver's [`BindingDescriptor`] at the start of each
//! epoch, declares the matching topology, and forwards every delivered payload
//! to [`Receiver::on_receive`].

use crate::errors::AmqpError;
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Where a receiver wants to listen: the exchange, the routing key it binds
/// with and the queue it consumes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BindingDescriptor {
    pub exchange_name: String,
    pub routing_key: String,
    pub queue_name: String,
}

impl BindingDescriptor {
    pub fn new(exchange: &str, routing_key: &str, queue: &str) -> BindingDescriptor {
        BindingDescriptor {
            exchange_name: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            queue_name: queue.to_owned(),
        }
    }
}

/// Capability interface implemented by message consumers.
///
/// The binding returned by `bind_info` must stay the same for the lifetime of
/// the receiver; rebinding is not supported.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Receiver: Send + Sync {
    /// The exchange, routing key and queue this receiver listens to.
    fn bind_info(&self) -> BindingDescriptor;

    /// Notification of an infrastructure failure affecting this receiver.
    fn on_error(&self, err: &AmqpError);

    /// Handles one payload.
    ///
    /// Returning `true` acknowledges the message. Returning `false` leaves it
    /// unacknowledged, so the broker redelivers it once the channel is closed
    /// on the next reconnect.
    async fn on_receive(&self, payload: &[u8]) -> bool;
}
