// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides consumer definitions, the handler trait invoked for each
//! delivery, and the task that pumps deliveries from a transport channel to the
//! handler. A consumer's tag and handler outlive the transport channel: after a
//! reconnect the channel restarts consumption with both, and a new pump.

use crate::{errors::AmqpError, otel, transport::DeliveryStream, transport::RawChannel};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::types::FieldTable;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub use crate::transport::Delivery;

/// Processes deliveries of a consumer.
///
/// Returning `Ok` acknowledges the message; returning an error rejects it without
/// requeue. Consumers started with `no_ack` are never acknowledged.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError>;
}

/// Parameters of a `basic.consume`, kept to restart the consumer after recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDefinition {
    pub(crate) queue: String,
    pub(crate) tag: String,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) arguments: FieldTable,
}

impl ConsumerDefinition {
    /// Creates a consumer of `queue` with a generated tag.
    pub fn new(queue: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            queue: queue.to_owned(),
            tag: format!("ctag-{}", Uuid::new_v4()),
            no_ack: false,
            exclusive: false,
            arguments: FieldTable::default(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.tag
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A consumer as recorded in the topology: its parameters and its handler.
#[derive(Clone)]
pub struct RegisteredConsumer {
    pub definition: ConsumerDefinition,
    pub handler: Arc<dyn ConsumerHandler>,
}

impl std::fmt::Debug for RegisteredConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredConsumer")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Spawns the task feeding `stream` to the consumer's handler.
///
/// The task ends with the stream, i.e. when the transport channel dies or the
/// consumer is cancelled by the broker, and then calls `on_exit` with whether
/// the transport channel was lost. An aborted pump never calls it.
pub(crate) fn spawn_pump<F>(
    raw: Arc<dyn RawChannel>,
    consumer: RegisteredConsumer,
    mut stream: DeliveryStream,
    on_exit: F,
) -> JoinHandle<()>
where
    F: FnOnce(bool) + Send + 'static,
{
    tokio::spawn(async move {
        let tracer = global::tracer("amqp consumer");
        let mut failed = false;

        while let Some(result) = stream.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = consume(&tracer, &delivery, &consumer, raw.as_ref()).await {
                        error!(error = err.to_string(), "error consume msg");

                        if !raw.is_open() {
                            failed = true;
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        consumer_tag = consumer.definition.tag,
                        "consumer stream failed"
                    );
                    failed = true;
                    break;
                }
            }
        }

        debug!(consumer_tag = consumer.definition.tag, "consumer stream ended");
        on_exit(failed || !raw.is_open());
    })
}

/// Runs the handler for one delivery and settles it.
async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    consumer: &RegisteredConsumer,
    raw: &dyn RawChannel,
) -> Result<(), AmqpError> {
    let name = delivery
        .properties
        .kind()
        .as_ref()
        .map(|kind| kind.to_string())
        .unwrap_or_else(|| consumer.definition.queue.clone());

    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &name);

    debug!(
        "received: {} - exchange: {}",
        name, delivery.exchange,
    );

    let result = consumer.handler.exec(&ctx, delivery).await;

    if consumer.definition.no_ack {
        if let Err(err) = &result {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
        }
        return result;
    }

    match result {
        Ok(()) => match raw.basic_ack(delivery.delivery_tag).await {
            Err(err) => {
                error!("error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(err)
            }
            Ok(()) => {
                span.set_status(Status::Ok);
                Ok(())
            }
        },
        Err(handler_err) => {
            warn!(error = handler_err.to_string(), "handler failure, rejecting msg");
            span.record_error(&handler_err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });

            raw.basic_nack(delivery.delivery_tag, false).await.map_err(|err| {
                error!("error whiling nack msg");
                err
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_generate_unique_tags() {
        let first = ConsumerDefinition::new("q");
        let second = ConsumerDefinition::new("q");

        assert!(first.consumer_tag().starts_with("ctag-"));
        assert_ne!(first.consumer_tag(), second.consumer_tag());
        assert_eq!(ConsumerDefinition::new("q").tag("fixed").consumer_tag(), "fixed");
    }
}
