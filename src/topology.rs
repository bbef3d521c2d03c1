// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the topology a receiver needs before it can consume:
//! its exchange, its queue and the binding between them, in that order.
//!
//! The main components are:
//! - `TopologyPolicy`: the exchange and queue flags applied to every receiver
//! - `AmqpTopology`: installs one receiver's binding over a session

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    receiver::BindingDescriptor,
    session::Session,
};
use serde::Deserialize;
use tracing::debug;

/// Exchange and queue flags applied to every declared binding.
///
/// The defaults are a durable topic exchange that is never auto-deleted and a
/// durable, shared queue that is never auto-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopologyPolicy {
    pub exchange_kind: ExchangeKind,
    pub exchange_durable: bool,
    pub exchange_auto_delete: bool,
    pub queue_durable: bool,
    pub queue_exclusive: bool,
    pub queue_auto_delete: bool,
}

impl Default for TopologyPolicy {
    fn default() -> Self {
        TopologyPolicy {
            exchange_kind: ExchangeKind::Topic,
            exchange_durable: true,
            exchange_auto_delete: false,
            queue_durable: true,
            queue_exclusive: false,
            queue_auto_delete: false,
        }
    }
}

impl TopologyPolicy {
    /// Builds the exchange definition for `name` under this policy.
    pub fn exchange(&self, name: &str) -> ExchangeDefinition {
        let mut def = ExchangeDefinition::new(name).kind(self.exchange_kind.clone());
        if self.exchange_durable {
            def = def.durable();
        }
        if self.exchange_auto_delete {
            def = def.delete();
        }
        def
    }

    /// Builds the queue definition for `name` under this policy.
    pub fn queue(&self, name: &str) -> QueueDefinition {
        let mut def = QueueDefinition::new(name);
        if self.queue_durable {
            def = def.durable();
        }
        if self.queue_exclusive {
            def = def.exclusive();
        }
        if self.queue_auto_delete {
            def = def.delete();
        }
        def
    }
}

/// Installs a receiver's exchange, queue and binding over a session.
pub struct AmqpTopology<'tp> {
    session: &'tp dyn Session,
    policy: &'tp TopologyPolicy,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(session: &'tp dyn Session, policy: &'tp TopologyPolicy) -> AmqpTopology<'tp> {
        AmqpTopology { session, policy }
    }

    /// Installs the topology for one binding.
    ///
    /// This method performs the following operations in order, stopping at the
    /// first failure:
    /// 1. Declares the exchange
    /// 2. Declares the queue
    /// 3. Binds the queue to the exchange with the routing key
    pub async fn install(&self, bind: &BindingDescriptor) -> Result<(), AmqpError> {
        self.session
            .declare_exchange(&self.policy.exchange(&bind.exchange_name))
            .await?;

        self.session
            .declare_queue(&self.policy.queue(&bind.queue_name))
            .await?;

        let binding = QueueBinding::new(&bind.queue_name)
            .exchange(&bind.exchange_name)
            .routing_key(&bind.routing_key);
        self.session.bind_queue(&binding).await?;

        debug!(
            exchange = %bind.exchange_name,
            routing_key = %bind.routing_key,
            queue = %bind.queue_name,
            "queue was bounded"
        );

        Ok(())
    }
}
