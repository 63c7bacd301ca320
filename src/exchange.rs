// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the exchange definition builder, exchange-to-exchange
//! bindings and the [`RobustExchange`] handle returned by
//! [`RobustChannel::declare_exchange`]. The handle stays valid across reconnects:
//! its declaration is replayed by the owning channel.

use crate::{channel::RobustChannel, errors::AmqpError, topology::Fault};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// The definition is kept verbatim by the channel's topology registry and used
/// to declare the exchange again after every reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn direct_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("direct")),
        );
        self
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn fanout_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("fanout")),
        );
        self
    }

    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive: declaring it only asserts that it exists.
    ///
    /// After a reconnect a passive exchange that vanished is reported as a
    /// recovery failure instead of being re-created.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// Binding of an exchange (destination) to another exchange (source).
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeBinding {
    pub(crate) destination: String,
    pub(crate) source: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: FieldTable,
}

impl ExchangeBinding {
    pub fn new(destination: &str) -> ExchangeBinding {
        ExchangeBinding {
            destination: destination.to_owned(),
            source: String::new(),
            routing_key: String::new(),
            arguments: FieldTable::default(),
        }
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_owned();
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

/// A declared exchange that survives reconnects.
#[derive(Clone)]
pub struct RobustExchange {
    pub(crate) channel: RobustChannel,
    pub(crate) definition: ExchangeDefinition,
    pub(crate) fault: Fault,
}

impl RobustExchange {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ExchangeDefinition {
        &self.definition
    }

    /// Returns the failure recorded when the exchange could not be recovered.
    pub fn check(&self) -> Result<(), AmqpError> {
        self.fault.check()
    }

    /// Declares the exchange again on the live channel. Success clears a recorded failure.
    pub async fn declare(&self) -> Result<(), AmqpError> {
        self.channel
            .declare_exchange(self.definition.clone())
            .await
            .map(|_| ())
    }

    /// Binds this exchange, as destination, to `source`.
    pub async fn bind(&self, source: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.check()?;
        self.channel
            .bind_exchange(
                ExchangeBinding::new(self.name())
                    .source(source)
                    .routing_key(routing_key),
            )
            .await
    }

    /// Removes a binding of this exchange to `source`.
    pub async fn unbind(&self, source: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.check()?;
        self.channel
            .unbind_exchange(
                ExchangeBinding::new(self.name())
                    .source(source)
                    .routing_key(routing_key),
            )
            .await
    }

    /// Publishes a message to this exchange.
    ///
    /// # Parameters
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Message body
    /// * `properties` - AMQP properties of the message
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.check()?;
        self.channel
            .publish(self.name(), routing_key, payload, properties)
            .await
    }

    /// Deletes the exchange and forgets it, along with its bindings.
    pub async fn delete(self, if_unused: bool) -> Result<(), AmqpError> {
        self.check()?;
        self.channel.delete_exchange(self.name(), if_unused).await
    }
}

impl std::fmt::Debug for RobustExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustExchange")
            .field("channel", &self.channel.id())
            .field("definition", &self.definition)
            .finish()
    }
}
