// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Declarations are recorded before any injected failure is returned, so a
//! test can tell which step was attempted last.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    receiver::{BindingDescriptor, Receiver},
    session::{Connector, DeliveryStream, InboundDelivery, Session},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{
    field::{Field, Visit},
    subscriber::DefaultGuard,
    Event, Subscriber,
};
use tracing_subscriber::{layer::Context, prelude::*, Layer, Registry};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type DeliverySender = mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    },
    DeclareQueue {
        name: String,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
        tag: String,
    },
}

#[derive(Default)]
struct SessionState {
    ops: Vec<Op>,
    consumed_at: Vec<Instant>,
    acked: Vec<u64>,
    consumers: HashMap<String, DeliverySender>,
    failing_exchanges: HashSet<String>,
    failing_queues: HashSet<String>,
    failing_consumes: HashSet<String>,
    failing_acks: HashSet<u64>,
    closed: bool,
}

/// Records every call and hands out streams fed by the test.
#[derive(Default)]
pub(crate) struct FakeSession {
    state: Mutex<SessionState>,
}

impl FakeSession {
    pub(crate) fn new() -> FakeSession {
        FakeSession::default()
    }

    pub(crate) fn fail_exchange(&self, name: &str) {
        self.state.lock().unwrap().failing_exchanges.insert(name.to_owned());
    }

    pub(crate) fn fail_queue(&self, name: &str) {
        self.state.lock().unwrap().failing_queues.insert(name.to_owned());
    }

    pub(crate) fn fail_consume(&self, queue: &str) {
        self.state.lock().unwrap().failing_consumes.insert(queue.to_owned());
    }

    pub(crate) fn fail_ack(&self, delivery_tag: u64) {
        self.state.lock().unwrap().failing_acks.insert(delivery_tag);
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub(crate) fn acked(&self) -> Vec<u64> {
        self.state.lock().unwrap().acked.clone()
    }

    /// When each consumption stream was opened, in order.
    pub(crate) fn consumed_at(&self) -> Vec<Instant> {
        self.state.lock().unwrap().consumed_at.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn consumes(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Consume { .. }))
            .count()
    }

    pub(crate) async fn wait_for_consumers(&self, count: usize) {
        while self.consumes() < count {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub(crate) fn deliver(&self, queue: &str, delivery_tag: u64, payload: &[u8]) {
        self.push(
            queue,
            Ok(InboundDelivery {
                delivery_tag,
                routing_key: queue.to_owned(),
                data: payload.to_vec(),
                ..Default::default()
            }),
        );
    }

    pub(crate) fn deliver_error(&self, queue: &str, reason: &str) {
        self.push(queue, Err(AmqpError::ConsumerError(reason.to_owned())));
    }

    fn push(&self, queue: &str, item: Result<InboundDelivery, AmqpError>) {
        let state = self.state.lock().unwrap();
        let sender = state.consumers.get(queue).expect("no consumer on queue");
        sender.send(item).expect("consumer stream dropped");
    }

    /// Ends every open delivery stream, like a broker connection loss.
    pub(crate) fn drop_connection(&self) {
        self.state.lock().unwrap().consumers.clear();
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::DeclareExchange {
            name: def.name().to_owned(),
            kind: def.exchange_kind().clone(),
            durable: def.is_durable(),
            auto_delete: def.is_auto_delete(),
        });

        if state.failing_exchanges.contains(def.name()) {
            return Err(AmqpError::DeclareExchangeError(
                def.name().to_owned(),
                "PRECONDITION_FAILED".to_owned(),
            ));
        }
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::DeclareQueue {
            name: def.name().to_owned(),
            durable: def.is_durable(),
            exclusive: def.is_exclusive(),
            auto_delete: def.is_auto_delete(),
        });

        if state.failing_queues.contains(def.name()) {
            return Err(AmqpError::DeclareQueueError(
                def.name().to_owned(),
                "PRECONDITION_FAILED".to_owned(),
            ));
        }
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        self.state.lock().unwrap().ops.push(Op::Bind {
            queue: binding.queue_name().to_owned(),
            exchange: binding.exchange_name().to_owned(),
            routing_key: binding.key().to_owned(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_consumes.contains(queue) {
            return Err(AmqpError::BindingConsumerError(
                queue.to_owned(),
                "NOT_FOUND".to_owned(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.insert(queue.to_owned(), tx);
        state.ops.push(Op::Consume {
            queue: queue.to_owned(),
            tag: consumer_tag.to_owned(),
        });
        state.consumed_at.push(Instant::now());

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_acks.contains(&delivery_tag) {
            return Err(AmqpError::AckMessageError(
                delivery_tag,
                "channel closed".to_owned(),
            ));
        }

        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.consumers.clear();
        state.closed = true;
    }
}

#[derive(Default)]
struct ConnectorState {
    attempts: Vec<Instant>,
    failures: VecDeque<AmqpError>,
    failing_exchanges: Vec<String>,
    sessions: Vec<Arc<FakeSession>>,
}

/// Opens a fresh [`FakeSession`] per attempt unless a failure is queued.
#[derive(Default)]
pub(crate) struct FakeConnector {
    state: Mutex<ConnectorState>,
}

impl FakeConnector {
    pub(crate) fn new() -> FakeConnector {
        FakeConnector::default()
    }

    /// Makes the next pending connect attempt fail with `err`.
    pub(crate) fn fail_next(&self, err: AmqpError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    /// Every session opened from now on rejects declarations of `exchange`.
    pub(crate) fn fail_exchange(&self, exchange: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_exchanges
            .push(exchange.to_owned());
    }

    pub(crate) fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts.len()
    }

    pub(crate) fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub(crate) fn session(&self, index: usize) -> Arc<FakeSession> {
        self.state.lock().unwrap().sessions[index].clone()
    }

    pub(crate) async fn wait_for_attempts(&self, count: usize) {
        while self.attempts() < count {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub(crate) async fn wait_for_session(&self, index: usize) -> Arc<FakeSession> {
        loop {
            if let Some(session) = self.state.lock().unwrap().sessions.get(index) {
                return session.clone();
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _cfg: &RabbitMQConfigs) -> Result<Arc<dyn Session>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(Instant::now());

        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let session = Arc::new(FakeSession::new());
        for exchange in &state.failing_exchanges {
            session.fail_exchange(exchange);
        }
        state.sessions.push(session.clone());

        Ok(session)
    }
}

/// Receiver that records payloads and errors; payload `fail` is rejected.
pub(crate) struct RecordingReceiver {
    bind: BindingDescriptor,
    payloads: Mutex<Vec<Vec<u8>>>,
    errors: Mutex<Vec<AmqpError>>,
}

impl RecordingReceiver {
    pub(crate) fn new(exchange: &str, routing_key: &str, queue: &str) -> RecordingReceiver {
        RecordingReceiver {
            bind: BindingDescriptor::new(exchange, routing_key, queue),
            payloads: Mutex::new(vec![]),
            errors: Mutex::new(vec![]),
        }
    }

    pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }

    pub(crate) fn errors(&self) -> Vec<AmqpError> {
        self.errors.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for_payloads(&self, count: usize) {
        while self.payloads.lock().unwrap().len() < count {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Receiver for RecordingReceiver {
    fn bind_info(&self) -> BindingDescriptor {
        self.bind.clone()
    }

    fn on_error(&self, err: &AmqpError) {
        self.errors.lock().unwrap().push(err.clone());
    }

    async fn on_receive(&self, payload: &[u8]) -> bool {
        self.payloads.lock().unwrap().push(payload.to_vec());
        payload != b"fail"
    }
}

/// A log event captured by [`LogCapture`], fields rendered as text.
#[derive(Debug, Clone, Default)]
pub(crate) struct CapturedEvent {
    pub(crate) message: String,
    pub(crate) fields: HashMap<String, String>,
}

impl Visit for CapturedEvent {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.insert(field.name().into(), format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.into();
        } else {
            self.fields.insert(field.name().into(), value.into());
        }
    }
}

/// Layer keeping every event emitted on the current thread.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    /// Captures this thread's events until the guard is dropped.
    ///
    /// Tasks spawned on a current-thread runtime are covered as well.
    pub(crate) fn install() -> (LogCapture, DefaultGuard) {
        let capture = LogCapture::default();
        let guard = tracing::subscriber::set_default(Registry::default().with(capture.clone()));
        (capture, guard)
    }

    pub(crate) fn find(&self, message: &str) -> Option<CapturedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|event| event.message == message)
            .cloned()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = CapturedEvent::default();
        event.record(&mut captured);
        self.events.lock().unwrap().push(captured);
    }
}
