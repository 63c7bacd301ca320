// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and their bindings,
//! and the [`RobustQueue`] handle returned by [`RobustChannel::declare_queue`].
//! It includes support for Dead Letter Queues (DLQ) and retry queues; the
//! auxiliary queues are declared, and recovered, together with the main queue.

use crate::{
    channel::RobustChannel,
    consumer::{ConsumerDefinition, ConsumerHandler},
    errors::AmqpError,
    topology::Fault,
    transport::QueueState,
};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, sync::Arc};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports standard queue options as well as advanced features like message TTL,
/// max length, Dead Letter Queues (DLQ), and retry mechanisms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    /// An empty name asks the broker to generate one.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes, so another client
    /// may claim the name while this one is reconnecting.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration an existence check instead of a creation request.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a single declaration argument.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ will receive messages that are rejected, expired, or overflow
    /// from the main queue. The DLQ name will be the main queue name with "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry mechanism to the queue.
    ///
    /// This creates a retry queue that temporarily holds failed messages before
    /// redelivering them to the main queue. The retry queue name will be the main
    /// queue name with "-retry" suffix.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds to wait before retrying
    /// * `retries` - Maximum number of retry attempts
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self
    }

    /// Maximum number of retries configured with [`QueueDefinition::with_retry`].
    pub fn retries(&self) -> Option<i32> {
        self.retries
    }

    /// The auxiliary queues (retry first, then DLQ) that must exist before this one.
    pub(crate) fn auxiliary_queues(&self) -> Vec<QueueDefinition> {
        let mut queues = vec![];

        if let Some(retry_name) = &self.retry_name {
            let mut retry = self.sibling(retry_name);
            retry.params.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            retry.params.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(self.name.clone())),
            );
            if let Some(ttl) = self.retry_ttl {
                retry.params.insert(
                    ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                    AMQPValue::LongInt(LongInt::from(ttl)),
                );
            }
            queues.push(retry);
        }

        if let Some(dlq_name) = &self.dlq_name {
            queues.push(self.sibling(dlq_name));
        }

        queues
    }

    fn sibling(&self, name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            passive: self.passive,
            ..QueueDefinition::default()
        }
    }

    /// Declaration arguments, including the dead-lettering wiring to the
    /// retry queue or the DLQ.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = self.params.clone();

        let dead_letter_target = match (&self.retry_name, &self.dlq_name) {
            (Some(retry), _) => Some(retry.clone()),
            (None, Some(dlq)) => Some(dlq.clone()),
            (None, None) => None,
        };

        if let Some(target) = dead_letter_target {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(target)),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        FieldTable::from(args)
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: FieldTable,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            arguments: FieldTable::default(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A declared queue that survives reconnects.
///
/// A passive queue handle asserts the queue's existence on every recovery. When
/// the queue vanished during an outage the failure is recorded on the handle and
/// returned by its next operation.
#[derive(Clone)]
pub struct RobustQueue {
    pub(crate) channel: RobustChannel,
    pub(crate) definition: QueueDefinition,
    pub(crate) state: QueueState,
    pub(crate) fault: Fault,
}

impl RobustQueue {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub fn is_passive(&self) -> bool {
        self.definition.passive
    }

    /// Message count reported by the declaration that created this handle.
    pub fn message_count(&self) -> u32 {
        self.state.message_count
    }

    pub fn consumer_count(&self) -> u32 {
        self.state.consumer_count
    }

    /// Returns the failure recorded when the queue could not be recovered.
    pub fn check(&self) -> Result<(), AmqpError> {
        self.fault.check()
    }

    /// Declares the queue again on the live channel. Success clears a recorded failure.
    pub async fn declare(&self) -> Result<QueueState, AmqpError> {
        self.channel
            .declare_queue(self.definition.clone())
            .await
            .map(|queue| queue.state)
    }

    /// Binds the queue to an exchange. The binding is replayed after reconnects.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange
    /// * `routing_key` - Routing key of the binding
    pub async fn bind(&self, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.check()?;
        self.channel
            .bind_queue(
                QueueBinding::new(self.name())
                    .exchange(exchange)
                    .routing_key(routing_key),
            )
            .await
    }

    /// Removes a binding of the queue.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange
    /// * `routing_key` - Routing key of the binding
    pub async fn unbind(&self, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.check()?;
        self.channel
            .unbind_queue(
                QueueBinding::new(self.name())
                    .exchange(exchange)
                    .routing_key(routing_key),
            )
            .await
    }

    /// Starts consuming with a generated consumer tag. Returns the tag.
    pub async fn consume(&self, handler: Arc<dyn ConsumerHandler>) -> Result<String, AmqpError> {
        self.consume_with(ConsumerDefinition::new(self.name()), handler)
            .await
    }

    /// Starts consuming with the given definition. Its queue is replaced by this
    /// queue's name.
    ///
    /// # Returns
    /// The consumer tag
    pub async fn consume_with(
        &self,
        def: ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String, AmqpError> {
        self.check()?;
        self.channel
            .consume(ConsumerDefinition { queue: self.name().to_owned(), ..def }, handler)
            .await
    }

    /// Cancels a consumer of this queue. It is not restarted after reconnects.
    ///
    /// # Parameters
    /// * `consumer_tag` - Tag returned by `consume`
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel.cancel(consumer_tag).await
    }

    /// Deletes the queue and forgets it, along with its bindings and consumers.
    pub async fn delete(self, if_unused: bool, if_empty: bool) -> Result<u32, AmqpError> {
        self.check()?;
        self.channel
            .delete_queue(self.name(), if_unused, if_empty)
            .await
    }
}

impl std::fmt::Debug for RobustQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustQueue")
            .field("channel", &self.channel.id())
            .field("definition", &self.definition)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(table: &FieldTable, key: &str) -> Option<AMQPValue> {
        table.inner().get(key).cloned()
    }

    #[test]
    fn should_wire_dead_lettering_to_retry_queue() {
        let def = QueueDefinition::new("orders")
            .durable()
            .with_dlq()
            .with_retry(1_000, 3)
            .ttl(60_000);

        let args = def.arguments();
        assert_eq!(
            arg(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(AMQPValue::LongString(LongString::from("orders-retry")))
        );
        assert_eq!(
            arg(&args, AMQP_HEADERS_MESSAGE_TTL),
            Some(AMQPValue::LongInt(60_000))
        );

        let aux = def.auxiliary_queues();
        assert_eq!(aux.len(), 2);
        assert_eq!(aux[0].name, "orders-retry");
        assert!(aux[0].durable);
        assert_eq!(
            arg(&aux[0].arguments(), AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(AMQPValue::LongString(LongString::from("orders")))
        );
        assert_eq!(aux[1].name, "orders-dlq");
        assert!(aux[1].params.is_empty());
    }

    #[test]
    fn should_route_dead_letters_to_dlq_without_retry() {
        let def = QueueDefinition::new("billing").with_dlq().max_length(10);
        let args = def.arguments();

        assert_eq!(
            arg(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(AMQPValue::LongString(LongString::from("billing-dlq")))
        );
        assert_eq!(arg(&args, AMQP_HEADERS_MAX_LENGTH), Some(AMQPValue::LongInt(10)));
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        let def = QueueDefinition::new("plain").passive();

        assert!(def.is_passive());
        assert!(def.arguments().inner().is_empty());
        assert!(def.auxiliary_queues().is_empty());
    }
}
