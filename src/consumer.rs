// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module implements the per-receiver consumption loop. For one epoch it:
//! 1. Reads the receiver's binding
//! 2. Declares the exchange, the queue and the binding between them
//! 3. Opens a manually acknowledged consumption stream on the queue
//! 4. Forwards every delivery to the receiver and acks it when the receiver
//!    reports success
//!
//! A failure in steps 2 or 3 is reported to the receiver and ends the loop with
//! that error. A delivery the receiver could not process is left unacked; the
//! broker redelivers it once the channel is closed on the next reconnect.

use crate::{
    errors::AmqpError,
    otel,
    receiver::{BindingDescriptor, Receiver},
    session::{InboundDelivery, Session},
    topology::{AmqpTopology, TopologyPolicy},
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything one consumption loop needs for the duration of an epoch.
pub(crate) struct ConsumptionTask {
    pub(crate) epoch: u64,
    pub(crate) session: Arc<dyn Session>,
    pub(crate) receiver: Arc<dyn Receiver>,
    pub(crate) policy: TopologyPolicy,
    pub(crate) cancel: CancellationToken,
}

impl ConsumptionTask {
    /// Runs the loop until the delivery stream closes or the token is cancelled.
    ///
    /// # Returns
    /// Ok(()) when the stream ended or the loop was cancelled, or the topology /
    /// consumer declaration error that aborted it
    pub(crate) async fn run(self) -> Result<(), AmqpError> {
        let bind = self.receiver.bind_info();

        if let Err(err) = AmqpTopology::new(self.session.as_ref(), &self.policy)
            .install(&bind)
            .await
        {
            error!(
                error = err.to_string(),
                epoch = self.epoch,
                queue = %bind.queue_name,
                "failure to declare receiver topology"
            );
            self.receiver.on_error(&err);
            return Err(err);
        }

        let tag = consumer_tag(&bind.queue_name);
        let mut deliveries = match self.session.consume(&bind.queue_name, &tag).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    epoch = self.epoch,
                    queue = %bind.queue_name,
                    "failure to open consumer"
                );
                self.receiver.on_error(&err);
                return Err(err);
            }
        };

        info!(
            epoch = self.epoch,
            exchange = %bind.exchange_name,
            routing_key = %bind.routing_key,
            queue = %bind.queue_name,
            consumer_tag = %tag,
            "waiting for messages"
        );

        let tracer = global::tracer("amqp consumer");

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(epoch = self.epoch, queue = %bind.queue_name, "consumer cancelled");
                    break;
                }
                next = deliveries.next() => next,
            };

            let Some(result) = next else {
                warn!(epoch = self.epoch, queue = %bind.queue_name, "delivery stream closed");
                break;
            };

            match result {
                Ok(delivery) => {
                    if let Err(err) = consume(
                        &tracer,
                        &delivery,
                        &bind,
                        self.receiver.as_ref(),
                        self.session.as_ref(),
                    )
                    .await
                    {
                        error!(
                            error = err.to_string(),
                            epoch = self.epoch,
                            queue = %bind.queue_name,
                            delivery_tag = delivery.delivery_tag,
                            "error consume msg"
                        );
                        self.receiver.on_error(&err);
                    }
                }

                Err(err) => error!(
                    error = err.to_string(),
                    epoch = self.epoch,
                    queue = %bind.queue_name,
                    "errors consume msg"
                ),
            }
        }

        Ok(())
    }
}

/// Unique consumer tag for one consumption stream on `queue`.
fn consumer_tag(queue: &str) -> String {
    format!("{}-{}", queue, Uuid::new_v4())
}

/// Forwards one delivery to its receiver and applies the verdict.
///
/// A `true` verdict acks exactly this delivery tag; a `false` verdict leaves
/// the delivery unacked.
///
/// # Returns
/// Ok(()) on success, or AmqpError if the ack failed
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    bind: &BindingDescriptor,
    receiver: &dyn Receiver,
    session: &dyn Session,
) -> Result<(), AmqpError> {
    let (_ctx, mut span) = otel::new_span(&delivery.properties, tracer, &bind.queue_name);

    debug!(
        "received: {} - exchange: {} - routing key: {}",
        delivery.delivery_tag, delivery.exchange, delivery.routing_key,
    );

    if !receiver.on_receive(&delivery.data).await {
        warn!(
            queue = %bind.queue_name,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "receiver failed to process message, it will be redelivered after reconnect"
        );
        span.set_status(Status::Error {
            description: Cow::from("message left unacked for redelivery"),
        });
        return Ok(());
    }

    match session.ack(delivery.delivery_tag).await {
        Err(err) => {
            error!("error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(err)
        }
        _ => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}
