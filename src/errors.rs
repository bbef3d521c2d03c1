// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Manager
//!
//! This module provides the error type shared by the connection lifecycle,
//! the topology declaration steps and the per-receiver consumption loops.
//! Every variant carries the names involved and the broker's reason, so an
//! error handed to `Receiver::on_error` identifies the step that failed.

use thiserror::Error;

/// Represents errors that can occur while managing RabbitMQ consumers.
///
/// Transport-level variants (`ConnectionError`, `ChannelError`,
/// `QoSDeclarationError`) abort the current epoch. Topology-level variants
/// abort one consumption loop and are reported to its receiver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// The provided configuration could not be parsed
    #[error("invalid configs `{0}`")]
    InvalidConfigs(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange: exchange, queue, routing key, reason
    #[error("failure to bind queue `{1}` to exchange `{0}` with key `{2}`: {3}")]
    BindingExchangeToQueueError(String, String, String, String),

    /// Error opening a consumption stream on a queue
    #[error("failure to declare consumer on queue `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`: {1}")]
    AckMessageError(u64, String),

    /// Error reported by an open consumption stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
