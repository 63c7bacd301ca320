// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Production [`Connector`] built on `lapin`. Every lapin error is classified
//! into the crate's taxonomy, and lapin's connection error callback is turned
//! into the close event the reconnect loop waits for.

use crate::{
    config::ConnectionParams,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    transport::{
        CloseReason, Connector, Delivery, DeliveryStream, Qos, QueueState, RawChannel,
        RawConnection,
    },
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

/// Opens lapin connections.
#[derive(Clone, Default)]
pub struct LapinConnector {
    properties: Option<ConnectionProperties>,
}

impl LapinConnector {
    /// Uses `properties` (executor, reactor, client properties) for every connection.
    /// The connection name from the parameters is applied on top.
    pub fn with_properties(properties: ConnectionProperties) -> LapinConnector {
        LapinConnector {
            properties: Some(properties),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn RawConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = self
            .properties
            .clone()
            .unwrap_or_default()
            .with_connection_name(LongString::from(params.connection_name.clone()));

        let conn = match Connection::connect(&params.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::from(err))
            }
        }?;
        debug!("amqp connected");

        let (events, _) = watch::channel(None);
        let events = Arc::new(events);

        conn.on_error({
            let events = events.clone();
            move |err| {
                error!(error = err.to_string(), "amqp connection failure");
                let reason = match &err {
                    lapin::Error::ProtocolError(amqp) => CloseReason::Closed {
                        code: amqp.get_id(),
                        reason: amqp.get_message().to_string(),
                    },
                    _ => CloseReason::from(&AmqpError::from(err)),
                };
                events.send_if_modified(|current| {
                    if current.is_some() {
                        return false;
                    }
                    *current = Some(reason);
                    true
                });
            }
        });

        Ok(Arc::new(LapinConnection { conn, events }))
    }
}

struct LapinConnection {
    conn: Connection,
    events: Arc<watch::Sender<Option<CloseReason>>>,
}

#[async_trait]
impl RawConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::from(err))
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError> {
        let result = self.conn.close(code, reason).await.map_err(AmqpError::from);

        let closed = CloseReason::Closed {
            code,
            reason: reason.to_owned(),
        };
        self.events.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(closed);
            true
        });

        result
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn closed(&self) -> BoxFuture<'static, CloseReason> {
        let mut events = self.events.subscribe();

        async move {
            match events.wait_for(Option::is_some).await {
                Ok(reason) => reason
                    .clone()
                    .unwrap_or_else(|| CloseReason::Transport("connection lost".to_owned())),
                Err(_) => CloseReason::Transport("connection dropped".to_owned()),
            }
        }
        .boxed()
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl RawChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn basic_qos(&self, qos: Qos) -> Result<(), AmqpError> {
        if qos.prefetch_size != 0 {
            return Err(AmqpError::QoSDeclarationError(format!(
                "prefetch_size {} is not supported",
                qos.prefetch_size
            )));
        }

        self.channel
            .basic_qos(
                qos.prefetch_count,
                BasicQosOptions {
                    global: qos.global,
                },
            )
            .await
            .map_err(AmqpError::from)
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map_err(AmqpError::from)
    }

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await
            .map_err(AmqpError::from)
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions { nowait: false },
                arguments.clone(),
            )
            .await
            .map_err(AmqpError::from)
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions { nowait: false },
                arguments.clone(),
            )
            .await
            .map_err(AmqpError::from)
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueState, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map_err(AmqpError::from)?;

        Ok(QueueState {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_delete(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(
                name,
                QueueDeleteOptions {
                    if_unused,
                    if_empty,
                    nowait: false,
                },
            )
            .await
            .map_err(AmqpError::from)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                arguments.clone(),
            )
            .await
            .map_err(AmqpError::from)
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, arguments.clone())
            .await
            .map_err(AmqpError::from)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        exclusive: bool,
        arguments: &FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive,
                    nowait: false,
                },
                arguments.clone(),
            )
            .await
            .map_err(AmqpError::from)?;

        let tag = consumer_tag.to_owned();
        Ok(consumer
            .map(move |result| {
                result
                    .map(|delivery| Delivery {
                        delivery_tag: delivery.delivery_tag,
                        consumer_tag: tag.clone(),
                        exchange: delivery.exchange.to_string(),
                        routing_key: delivery.routing_key.to_string(),
                        redelivered: delivery.redelivered,
                        properties: delivery.properties,
                        data: delivery.data,
                    })
                    .map_err(AmqpError::from)
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(AmqpError::from)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(AmqpError::from)?
            .await
            .map(|_| ())
            .map_err(AmqpError::from)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(AmqpError::from)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(AmqpError::from)
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError> {
        self.channel
            .close(code, reason)
            .await
            .map_err(AmqpError::from)
    }
}
