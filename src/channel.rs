// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module provides `RobustChannel`, a channel that outlives the transport
//! channel underneath it. Every declaration accepted by the broker is recorded in
//! the channel's topology registry; when the transport channel is replaced, after
//! a reconnect or after the broker closed it, the channel reapplies its QoS and
//! replays the registry before serving operations again.
//!
//! Operations issued while the channel is being recovered either wait for the
//! recovery (bounded by the connection's operation timeout) or fail fast with
//! `AmqpError::ReconnectingError`, depending on the connection parameters.

use crate::{
    config::ConnectionParams,
    connection::ConnectionInner,
    consumer::{spawn_pump, ConsumerDefinition, ConsumerHandler, RegisteredConsumer},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition, RobustExchange},
    otel,
    queue::{QueueBinding, QueueDefinition, RobustQueue},
    topology::{Fault, ReplayStep, TopologyEntry, TopologyRegistry},
    transport::{same_object, DeliveryStream, Qos, QueueState, RawChannel, RawConnection},
};
use lapin::BasicProperties;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, RwLock, RwLockReadGuard},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;

/// Lifecycle of a robust channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The first transport channel is being opened.
    Opening,
    Open,
    /// The transport channel was lost and is being replaced.
    Reopening,
    /// Closed by the user or along with its connection. Terminal.
    Closed,
}

pub(crate) struct ChannelInner {
    id: u64,
    connection: Weak<ConnectionInner>,
    transport: Mutex<Option<Arc<dyn RawChannel>>>,
    state: watch::Sender<ChannelState>,
    qos: Mutex<Option<Qos>>,
    topology: TopologyRegistry,
    // one recovery at a time
    recovery: tokio::sync::Mutex<()>,
    // topology changes take it shared, replay takes it exclusive
    operations: RwLock<()>,
    // consumer tag -> (pump id, task)
    pumps: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    next_pump: AtomicU64,
    wait_for_recovery: bool,
    operation_timeout: Option<Duration>,
}

impl ChannelInner {
    pub(crate) fn new(
        id: u64,
        connection: Weak<ConnectionInner>,
        params: &ConnectionParams,
    ) -> Arc<ChannelInner> {
        let (state, _) = watch::channel(ChannelState::Opening);

        Arc::new(ChannelInner {
            id,
            connection,
            transport: Mutex::new(None),
            state,
            qos: Mutex::new(None),
            topology: TopologyRegistry::default(),
            recovery: tokio::sync::Mutex::new(()),
            operations: RwLock::new(()),
            pumps: Mutex::new(HashMap::new()),
            next_pump: AtomicU64::new(1),
            wait_for_recovery: params.wait_for_recovery,
            operation_timeout: params.operation_timeout(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    fn current(&self) -> Option<Arc<dyn RawChannel>> {
        self.transport.lock().clone()
    }

    fn is_current(&self, raw: &Arc<dyn RawChannel>) -> bool {
        self.transport
            .lock()
            .as_ref()
            .is_some_and(|current| same_object(current, raw))
    }

    /// Drops the transport channel because its connection is gone.
    pub(crate) fn detach(&self) {
        {
            let mut slot = self.transport.lock();
            slot.take();
            self.state.send_if_modified(|state| match state {
                ChannelState::Open => {
                    *state = ChannelState::Reopening;
                    true
                }
                _ => false,
            });
        }
        self.abort_pumps();
    }

    /// Drops `stale` if it is still the current transport channel.
    fn detach_if(&self, stale: &Arc<dyn RawChannel>) -> bool {
        {
            let mut slot = self.transport.lock();
            match slot.as_ref() {
                Some(current) if same_object(current, stale) => {
                    slot.take();
                }
                _ => return false,
            }
            self.state.send_if_modified(|state| match state {
                ChannelState::Open => {
                    *state = ChannelState::Reopening;
                    true
                }
                _ => false,
            });
        }
        self.abort_pumps();
        true
    }

    fn abort_pumps(&self) {
        for (_, (_, pump)) in self.pumps.lock().drain() {
            pump.abort();
        }
    }

    fn start_pump(
        self: &Arc<Self>,
        raw: Arc<dyn RawChannel>,
        consumer: RegisteredConsumer,
        stream: DeliveryStream,
    ) {
        let tag = consumer.definition.tag.clone();
        let id = self.next_pump.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::downgrade(self);
        let exited = (tag.clone(), raw.clone());

        // held across the spawn so that the pump cannot exit before it is listed
        let mut pumps = self.pumps.lock();
        let pump = spawn_pump(raw, consumer, stream, move |lost| {
            if let Some(channel) = channel.upgrade() {
                channel.pump_exited(&exited.0, id, &exited.1, lost);
            }
        });

        if let Some((_, previous)) = pumps.insert(tag, (id, pump)) {
            previous.abort();
        }
    }

    fn stop_pump(&self, tag: &str) {
        if let Some((_, pump)) = self.pumps.lock().remove(tag) {
            pump.abort();
        }
    }

    /// Called by a pump whose stream ended on its own. Pumps that were stopped
    /// or replaced in the meantime are no longer listed and are ignored.
    fn pump_exited(
        self: &Arc<Self>,
        tag: &str,
        id: u64,
        raw: &Arc<dyn RawChannel>,
        lost: bool,
    ) {
        {
            let mut pumps = self.pumps.lock();
            match pumps.get(tag) {
                Some((current, _)) if *current == id => {
                    pumps.remove(tag);
                }
                _ => return,
            }
        }

        if lost {
            warn!(
                channel = self.id,
                consumer_tag = tag,
                "consumer lost its transport channel"
            );
            self.on_transport_lost(raw);
        } else {
            warn!(channel = self.id, consumer_tag = tag, "consumer cancelled by the broker");
        }
    }

    /// Waits until a live transport channel is available.
    async fn transport(self: &Arc<Self>) -> Result<Arc<dyn RawChannel>, AmqpError> {
        let mut state = self.state.subscribe();
        let deadline = self.operation_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(raw) = self.current() {
                if raw.is_open() {
                    return Ok(raw);
                }
                self.on_transport_lost(&raw);
            }

            let current = *state.borrow_and_update();
            match current {
                ChannelState::Closed => return Err(AmqpError::ClosedError),
                ChannelState::Open => continue,
                ChannelState::Opening | ChannelState::Reopening => {}
            }

            if !self.wait_for_recovery {
                return Err(AmqpError::ReconnectingError);
            }

            let ready = state.wait_for(|s| matches!(s, ChannelState::Open | ChannelState::Closed));
            let outcome = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, ready)
                    .await
                    .map_err(|_| AmqpError::ReconnectingError)?
                    .map(|_| ()),
                None => ready.await.map(|_| ()),
            };
            outcome.map_err(|_| AmqpError::ClosedError)?;
        }
    }

    /// Waits for a live transport channel and holds off replay while the caller
    /// changes the topology.
    async fn transport_for_topology(
        self: &Arc<Self>,
    ) -> Result<(Arc<dyn RawChannel>, RwLockReadGuard<'_, ()>), AmqpError> {
        loop {
            let raw = self.transport().await?;
            let guard = self.operations.read().await;

            if self.is_current(&raw) {
                return Ok((raw, guard));
            }
        }
    }

    /// Reacts to a failed operation on `raw`.
    fn after_failure(self: &Arc<Self>, raw: &Arc<dyn RawChannel>, err: &AmqpError) {
        if err.is_transport() || !raw.is_open() {
            self.on_transport_lost(raw);
        }
    }

    /// Replaces a dead transport channel. When only the channel died it is
    /// reopened in place, otherwise the connection is told to reconnect.
    fn on_transport_lost(self: &Arc<Self>, stale: &Arc<dyn RawChannel>) {
        if !self.detach_if(stale) {
            return;
        }
        warn!(channel = self.id, "transport channel lost");

        if stale.is_open() {
            close_quietly(stale.clone(), "transport channel replaced");
        }

        let Some(connection) = self.connection.upgrade() else {
            return;
        };

        match connection.current_transport() {
            Some(transport) if transport.is_open() => {
                let channel = self.clone();
                tokio::spawn(async move { channel.reopen(transport).await });
            }
            Some(transport) => connection.report_transport_failure(&transport),
            // a reconnect cycle is running and will recover this channel
            None => {}
        }
    }

    async fn reopen(self: Arc<Self>, transport: Arc<dyn RawConnection>) {
        match self.recover(&transport).await {
            Ok(()) => info!(channel = self.id, "channel reopened"),
            Err(AmqpError::ClosedError) => {}
            Err(err) => {
                warn!(
                    channel = self.id,
                    error = err.to_string(),
                    "failure to reopen channel"
                );
                if let Some(connection) = self.connection.upgrade() {
                    connection.report_transport_failure(&transport);
                }
            }
        }
    }

    /// Opens a transport channel on `transport`, reapplies QoS and replays the
    /// topology. A no-op when a live transport channel is already installed.
    ///
    /// Broker rejections during the replay are recorded on the affected entries
    /// and do not fail the recovery; transport failures do.
    pub(crate) async fn recover(
        self: &Arc<Self>,
        transport: &Arc<dyn RawConnection>,
    ) -> Result<(), AmqpError> {
        let _recovery = self.recovery.lock().await;

        if self.is_closed() {
            return Err(AmqpError::ClosedError);
        }
        if self.current().is_some_and(|raw| raw.is_open()) {
            return Ok(());
        }

        let _operations = self.operations.write().await;
        let plan = self.topology.replay_plan();
        debug!(channel = self.id, entries = plan.len(), "recovering channel");

        let mut raw = self.open_transport(transport).await?;
        let mut failed = vec![false; plan.len()];

        'replay: loop {
            for (index, step) in plan.iter().enumerate() {
                if failed[index] {
                    continue;
                }

                if let Some(missing) = missing_dependency(step, &plan, &failed) {
                    failed[index] = true;
                    self.report(
                        step,
                        AmqpError::RecoveryError {
                            entity: step.entry.describe(),
                            reason: format!("depends on {} which was not recovered", missing),
                        },
                    );
                    continue;
                }

                match self.replay(&raw, &step.entry).await {
                    Ok(()) => step.fault.clear(),
                    Err(err) if err.is_transport() => {
                        self.abort_pumps();
                        return Err(err);
                    }
                    Err(err) => {
                        failed[index] = true;
                        self.report(step, AmqpError::recovery(step.entry.describe(), &err));

                        if !raw.is_open() {
                            // the rejection closed the transport channel
                            self.abort_pumps();
                            raw = self.open_transport(transport).await?;
                            continue 'replay;
                        }
                    }
                }
            }
            break;
        }

        {
            let mut slot = self.transport.lock();
            if self.is_closed() {
                drop(slot);
                self.abort_pumps();
                close_quietly(raw, "channel closed during recovery");
                return Err(AmqpError::ClosedError);
            }
            *slot = Some(raw.clone());
            self.state.send_replace(ChannelState::Open);
        }

        if !raw.is_open() {
            // died after the replay, its pumps found it not yet installed
            self.on_transport_lost(&raw);
        }

        debug!(channel = self.id, "channel recovered");
        Ok(())
    }

    async fn open_transport(
        &self,
        transport: &Arc<dyn RawConnection>,
    ) -> Result<Arc<dyn RawChannel>, AmqpError> {
        let raw = transport.create_channel().await?;
        debug!(
            channel = self.id,
            transport_channel = raw.id(),
            "transport channel opened"
        );

        let qos = *self.qos.lock();
        let Some(qos) = qos else {
            return Ok(raw);
        };

        match raw.basic_qos(qos).await {
            Ok(()) => Ok(raw),
            Err(err) if err.is_transport() => Err(err),
            Err(err) => {
                let err = AmqpError::recovery("qos", &err);
                error!(channel = self.id, error = err.to_string(), "failure to reapply qos");
                self.broadcast(err);

                if raw.is_open() {
                    Ok(raw)
                } else {
                    transport.create_channel().await
                }
            }
        }
    }

    async fn replay(
        self: &Arc<Self>,
        raw: &Arc<dyn RawChannel>,
        entry: &TopologyEntry,
    ) -> Result<(), AmqpError> {
        match entry {
            TopologyEntry::Exchange(def) => raw.exchange_declare(def).await,
            TopologyEntry::Queue(def) => raw.queue_declare(def).await.map(|_| ()),
            TopologyEntry::QueueBinding(b) => {
                raw.queue_bind(&b.queue_name, &b.exchange_name, &b.routing_key, &b.arguments)
                    .await
            }
            TopologyEntry::ExchangeBinding(b) => {
                raw.exchange_bind(&b.destination, &b.source, &b.routing_key, &b.arguments)
                    .await
            }
            TopologyEntry::Consumer(consumer) => {
                let def = &consumer.definition;
                let stream = raw
                    .basic_consume(&def.queue, &def.tag, def.no_ack, def.exclusive, &def.arguments)
                    .await?;
                self.start_pump(raw.clone(), consumer.clone(), stream);
                Ok(())
            }
        }
    }

    fn report(&self, step: &ReplayStep, err: AmqpError) {
        error!(
            channel = self.id,
            error = err.to_string(),
            "failure to recover topology entry"
        );
        step.fault.set(err.clone());
        self.broadcast(err);
    }

    fn broadcast(&self, err: AmqpError) {
        if let Some(connection) = self.connection.upgrade() {
            connection.report_recovery_error(err);
        }
    }

    /// Marks the channel closed and releases its transport channel.
    pub(crate) async fn shutdown(&self) {
        let raw = {
            let mut slot = self.transport.lock();
            self.state.send_replace(ChannelState::Closed);
            slot.take()
        };
        self.abort_pumps();

        if let Some(raw) = raw {
            if raw.is_open() {
                if let Err(err) = raw.close(REPLY_SUCCESS, "channel closed by client").await {
                    debug!(
                        channel = self.id,
                        error = err.to_string(),
                        "failure to close transport channel"
                    );
                }
            }
        }
    }
}

fn missing_dependency(step: &ReplayStep, plan: &[ReplayStep], failed: &[bool]) -> Option<String> {
    let (queues, exchanges) = step.entry.dependencies();

    plan.iter()
        .zip(failed)
        .filter(|(_, failed)| **failed)
        .find_map(|(other, _)| match &other.entry {
            TopologyEntry::Queue(def) if queues.contains(&def.name.as_str()) => {
                Some(other.entry.describe())
            }
            TopologyEntry::Exchange(def) if exchanges.contains(&def.name.as_str()) => {
                Some(other.entry.describe())
            }
            _ => None,
        })
}

fn close_quietly(raw: Arc<dyn RawChannel>, reason: &'static str) {
    tokio::spawn(async move {
        let _ = raw.close(REPLY_SUCCESS, reason).await;
    });
}

/// A channel that survives reconnects.
///
/// Cheap to clone; clones share the same channel. Exchanges, queues, bindings and
/// consumers declared through it are replayed, in that order, whenever its
/// transport channel is replaced.
#[derive(Clone)]
pub struct RobustChannel {
    inner: Arc<ChannelInner>,
}

impl RobustChannel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> RobustChannel {
        RobustChannel { inner }
    }

    /// Identifier of the channel, stable across reconnects.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Subscribes to state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// The QoS reapplied to every new transport channel.
    pub fn qos(&self) -> Option<Qos> {
        *self.inner.qos.lock()
    }

    /// Snapshot of the recorded topology, in declaration order.
    pub fn topology(&self) -> Vec<TopologyEntry> {
        self.inner.topology.entries()
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Arc<dyn RawChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let raw = self.inner.transport().await?;
        let result = op(raw.clone()).await;

        if let Err(err) = &result {
            self.inner.after_failure(&raw, err);
        }

        result
    }

    /// Sets the prefetch limits. They are remembered and reapplied after every
    /// reconnect.
    ///
    /// # Parameters
    /// * `prefetch_count` - Maximum number of unacknowledged deliveries
    /// * `prefetch_size` - Maximum size of unacknowledged deliveries, 0 for no limit
    /// * `global` - Whether the limits apply to the whole channel rather than per consumer
    pub async fn set_qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), AmqpError> {
        let qos = Qos {
            prefetch_count,
            prefetch_size,
            global,
        };

        let (raw, _guard) = self.inner.transport_for_topology().await?;
        if let Err(err) = raw.basic_qos(qos).await {
            error!(channel = self.id(), error = err.to_string(), "failure to configure qos");
            self.inner.after_failure(&raw, &err);
            return Err(err);
        }

        *self.inner.qos.lock() = Some(qos);
        debug!(channel = self.id(), prefetch_count, "qos configured");
        Ok(())
    }

    /// Declares an exchange and records it for recovery.
    ///
    /// # Parameters
    /// * `def` - The exchange definition
    ///
    /// # Returns
    /// A handle to the exchange, or the broker's rejection
    pub async fn declare_exchange(
        &self,
        def: ExchangeDefinition,
    ) -> Result<RobustExchange, AmqpError> {
        let (raw, _guard) = self.inner.transport_for_topology().await?;

        debug!("creating exchange: {}", def.name);
        if let Err(err) = raw.exchange_declare(&def).await {
            error!(error = err.to_string(), name = def.name, "error to declare the exchange");
            self.inner.after_failure(&raw, &err);
            return Err(err);
        }
        debug!("exchange: {} was created", def.name);

        let fault = self.inner.topology.register_exchange(def.clone());
        fault.clear();

        Ok(RobustExchange {
            channel: self.clone(),
            definition: def,
            fault,
        })
    }

    /// Declares a queue, its retry and dead letter queues first when configured,
    /// and records them for recovery.
    pub async fn declare_queue(&self, def: QueueDefinition) -> Result<RobustQueue, AmqpError> {
        for auxiliary in def.auxiliary_queues() {
            self.declare_single_queue(auxiliary).await?;
        }

        let (definition, state, fault) = self.declare_single_queue(def).await?;

        Ok(RobustQueue {
            channel: self.clone(),
            definition,
            state,
            fault,
        })
    }

    async fn declare_single_queue(
        &self,
        mut def: QueueDefinition,
    ) -> Result<(QueueDefinition, QueueState, Fault), AmqpError> {
        let (raw, _guard) = self.inner.transport_for_topology().await?;

        debug!("creating queue: {}", def.name);
        let state = match raw.queue_declare(&def).await {
            Ok(state) => state,
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                self.inner.after_failure(&raw, &err);
                return Err(err);
            }
        };
        debug!("queue: {} was created", state.name);

        if def.name.is_empty() {
            def.name = state.name.clone();
        }

        let fault = self.inner.topology.register_queue(def.clone());
        fault.clear();

        Ok((def, state, fault))
    }

    /// Binds a queue to an exchange and records the binding for recovery.
    ///
    /// Fails with the recorded recovery error when the queue could not be
    /// recovered.
    ///
    /// # Parameters
    /// * `binding` - The queue binding
    pub async fn bind_queue(&self, binding: QueueBinding) -> Result<(), AmqpError> {
        if let Some(fault) = self.inner.topology.queue_fault(&binding.queue_name) {
            fault.check()?;
        }

        let (raw, _guard) = self.inner.transport_for_topology().await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        if let Err(err) = raw
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                &binding.arguments,
            )
            .await
        {
            error!(error = err.to_string(), "error to bind queue to exchange");
            self.inner.after_failure(&raw, &err);
            return Err(err);
        }

        self.inner.topology.register_queue_binding(binding);
        Ok(())
    }

    /// Removes a queue binding and forgets it.
    ///
    /// # Parameters
    /// * `binding` - The binding to remove, as it was declared
    pub async fn unbind_queue(&self, binding: QueueBinding) -> Result<(), AmqpError> {
        let (raw, _guard) = self.inner.transport_for_topology().await?;

        if let Err(err) = raw
            .queue_unbind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                &binding.arguments,
            )
            .await
        {
            error!(error = err.to_string(), "error to unbind queue from exchange");
            self.inner.after_failure(&raw, &err);
            return Err(err);
        }

        self.inner.topology.deregister_queue_binding(&binding);
        Ok(())
    }

    /// Binds an exchange to another exchange and records the binding for recovery.
    ///
    /// # Parameters
    /// * `binding` - The exchange-to-exchange binding
    pub async fn bind_exchange(&self, binding: ExchangeBinding) -> Result<(), AmqpError> {
        let (raw, _guard) = self.inner.transport_for_topology().await?;

        debug!(
            "binding exchange: {} to the exchange: {} with the key: {}",
            binding.destination, binding.source, binding.routing_key
        );
        if let Err(err) = raw
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                &binding.arguments,
            )
            .await
        {
            error!(error = err.to_string(), "error to bind exchanges");
            self.inner.after_failure(&raw, &err);
            return Err(err);
        }

        self.inner.topology.register_exchange_binding(binding);
        Ok(())
    }

    /// Removes an exchange-to-exchange binding and forgets it.
    ///
    /// # Parameters
    /// * `binding` - The binding to remove, as it was declared
    pub async fn unbind_exchange(&self, binding: ExchangeBinding) -> Result<(), AmqpError> {
        let (raw, _guard) = self.inner.transport_for_topology().await?;

        if let Err(err) = raw
            .exchange_unbind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                &binding.arguments,
            )
            .await
        {
            error!(error = err.to_string(), "error to unbind exchanges");
            self.inner.after_failure(&raw, &err);
            return Err(err);
        }

        self.inner.topology.deregister_exchange_binding(&binding);
        Ok(())
    }

    /// Starts a consumer and records it, with its tag and handler, for recovery.
    ///
    /// # Parameters
    /// * `def` - The consumer definition, including its tag
    /// * `handler` - Handler invoked for every delivery
    ///
    /// # Returns
    /// The consumer tag, kept across reconnects
    pub async fn consume(
        &self,
        def: ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String, AmqpError> {
        if let Some(fault) = self.inner.topology.queue_fault(&def.queue) {
            fault.check()?;
        }

        let (raw, _guard) = self.inner.transport_for_topology().await?;

        let stream = match raw
            .basic_consume(&def.queue, &def.tag, def.no_ack, def.exclusive, &def.arguments)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = err.to_string(), queue = def.queue, "failure to consume");
                self.inner.after_failure(&raw, &err);
                return Err(err);
            }
        };

        let tag = def.tag.clone();
        let consumer = RegisteredConsumer {
            definition: def,
            handler,
        };

        self.inner.topology.register_consumer(consumer.clone());
        self.inner.start_pump(raw, consumer, stream);
        debug!(consumer_tag = tag, "consumer started");

        Ok(tag)
    }

    /// Cancels a consumer. It is forgotten even when the transport channel died
    /// in the meantime.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let (raw, _guard) = self.inner.transport_for_topology().await?;

        self.inner.topology.deregister_consumer(consumer_tag);
        self.inner.stop_pump(consumer_tag);

        match raw.basic_cancel(consumer_tag).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_transport() => {
                self.inner.after_failure(&raw, &err);
                Ok(())
            }
            Err(err) => {
                self.inner.after_failure(&raw, &err);
                Err(err)
            }
        }
    }

    /// Publishes a message. The current trace context is added to its headers.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Message body
    /// * `properties` - AMQP properties of the message
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let headers = otel::inject_current(properties.headers().as_ref());
        let properties = properties.with_headers(headers);

        self.run(|raw| async move {
            raw.basic_publish(exchange, routing_key, payload, properties)
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error publishing message");
                    err
                })
        })
        .await
    }

    /// Deletes a queue and forgets it, along with its bindings and consumers.
    /// Returns the number of messages deleted with it.
    pub async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        let (raw, _guard) = self.inner.transport_for_topology().await?;

        let purged = match raw.queue_delete(name, if_unused, if_empty).await {
            Ok(purged) => purged,
            Err(err) => {
                self.inner.after_failure(&raw, &err);
                return Err(err);
            }
        };

        for tag in self.inner.topology.deregister_queue(name) {
            self.inner.stop_pump(&tag);
        }
        debug!(queue = name, purged, "queue deleted");

        Ok(purged)
    }

    /// Deletes an exchange and forgets it, along with its bindings.
    pub async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        let (raw, _guard) = self.inner.transport_for_topology().await?;

        if let Err(err) = raw.exchange_delete(name, if_unused).await {
            self.inner.after_failure(&raw, &err);
            return Err(err);
        }

        self.inner.topology.deregister_exchange(name);
        debug!(exchange = name, "exchange deleted");
        Ok(())
    }

    /// Closes the channel. Its topology is dropped and it is never recovered.
    /// Closing an already closed channel is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.inner.is_closed() {
            return Ok(());
        }

        if let Some(connection) = self.inner.connection.upgrade() {
            connection.forget_channel(self.inner.id);
        }

        self.inner.shutdown().await;
        info!(channel = self.id(), "channel closed");
        Ok(())
    }
}

impl std::fmt::Debug for RobustChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustChannel")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}
