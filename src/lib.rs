// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Connections, channels and topology handles for RabbitMQ that survive
//! network failures and broker restarts.
//!
//! A [`RobustConnection`] re-opens its transport according to a
//! [`ReconnectPolicy`]; every [`RobustChannel`] opened from it reapplies its QoS
//! and replays the exchanges, queues, bindings and consumers declared through it.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod lapin_transport;
pub mod policy;
pub mod queue;
pub mod topology;
pub mod transport;

pub use channel::{ChannelState, RobustChannel};
pub use config::ConnectionParams;
pub use connection::{
    ConnectionState, ReconnectCallback, RobustConnection, RobustConnectionBuilder,
};
pub use consumer::{ConsumerDefinition, ConsumerHandler, Delivery, RegisteredConsumer};
pub use errors::AmqpError;
pub use exchange::{ExchangeBinding, ExchangeDefinition, ExchangeKind, RobustExchange};
pub use policy::{Decision, ExponentialBackoff, FixedInterval, ReconnectPolicy};
pub use queue::{QueueBinding, QueueDefinition, RobustQueue};
pub use topology::{AmqpTopology, Topology, TopologyEntry};
pub use transport::{CloseReason, Qos, QueueState};
