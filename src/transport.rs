// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The robust layer never talks to the wire itself. It opens raw, non-recoverable
//! connections and channels through a [`Connector`], and treats them as disposable:
//! once a raw object dies it is dropped and replaced. `crate::lapin_transport`
//! provides the production connector.

use crate::{
    config::ConnectionParams, errors::AmqpError, exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use lapin::{types::FieldTable, BasicProperties};
use std::sync::Arc;

/// Why a raw connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The socket died without a close handshake.
    Transport(String),
    /// The connection was closed with an AMQP reply code, by either peer.
    Closed { code: u16, reason: String },
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Transport(reason) => write!(f, "transport lost: {}", reason),
            CloseReason::Closed { code, reason } => write!(f, "closed ({}): {}", code, reason),
        }
    }
}

impl From<&AmqpError> for CloseReason {
    fn from(err: &AmqpError) -> Self {
        match err {
            AmqpError::BrokerError { code, reason } => CloseReason::Closed {
                code: *code,
                reason: reason.clone(),
            },
            other => CloseReason::Transport(other.to_string()),
        }
    }
}

/// Channel-level flow control: how much unacknowledged data the broker may push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Qos {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueState {
    /// The queue name, as assigned by the broker for server-named queues.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message pushed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Deliveries of a single consumer. The stream ends when the transport channel dies.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens raw connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams)
        -> Result<Arc<dyn RawConnection>, AmqpError>;
}

/// A transport connection. Dies on any network fault and is never reused afterwards.
#[async_trait]
pub trait RawConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection is gone, immediately if it already is.
    fn closed(&self) -> BoxFuture<'static, CloseReason>;
}

/// A transport channel. Broker rejections close it, as do connection failures.
#[async_trait]
pub trait RawChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn basic_qos(&self, qos: Qos) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), AmqpError>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError>;

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueState, AmqpError>;

    async fn queue_delete(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        exclusive: bool,
        arguments: &FieldTable,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError>;
}

/// Identity of a raw object, used to tell a stale handle from the current one.
pub(crate) fn same_object<T: ?Sized>(left: &Arc<T>, right: &Arc<T>) -> bool {
    Arc::as_ptr(left) as *const () == Arc::as_ptr(right) as *const ()
}
