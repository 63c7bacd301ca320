// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module keeps the record of everything a channel declared, so that the
//! channel can replay it on a fresh transport channel after a reconnect.
//!
//! The main components are:
//! - `TopologyRegistry`: ordered record of exchanges, queues, bindings and consumers
//! - `Fault`: slot in which a failed replay is stored for the affected handle
//! - `Topology` trait and `AmqpTopology`: batch declaration of a whole topology

use crate::{
    channel::RobustChannel,
    consumer::RegisteredConsumer,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Replay failure recorded for one declaration and shared with its handle.
#[derive(Debug, Clone, Default)]
pub(crate) struct Fault(Arc<Mutex<Option<AmqpError>>>);

impl Fault {
    pub(crate) fn set(&self, err: AmqpError) {
        *self.0.lock() = Some(err);
    }

    pub(crate) fn clear(&self) {
        *self.0.lock() = None;
    }

    pub(crate) fn check(&self) -> Result<(), AmqpError> {
        match self.0.lock().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// One recorded declaration, with everything needed to replay it.
#[derive(Debug, Clone)]
pub enum TopologyEntry {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    QueueBinding(QueueBinding),
    ExchangeBinding(ExchangeBinding),
    Consumer(RegisteredConsumer),
}

/// Replay order. Entries of one phase keep their insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ReplayPhase {
    Declaration,
    Assertion,
    Binding,
    Consumer,
}

impl TopologyEntry {
    pub(crate) fn phase(&self) -> ReplayPhase {
        match self {
            TopologyEntry::Exchange(def) if def.passive => ReplayPhase::Assertion,
            TopologyEntry::Queue(def) if def.passive => ReplayPhase::Assertion,
            TopologyEntry::Exchange(_) | TopologyEntry::Queue(_) => ReplayPhase::Declaration,
            TopologyEntry::QueueBinding(_) | TopologyEntry::ExchangeBinding(_) => {
                ReplayPhase::Binding
            }
            TopologyEntry::Consumer(_) => ReplayPhase::Consumer,
        }
    }

    /// Human readable identity, used in logs and recovery errors.
    pub fn describe(&self) -> String {
        match self {
            TopologyEntry::Exchange(def) => format!("exchange `{}`", def.name),
            TopologyEntry::Queue(def) => format!("queue `{}`", def.name),
            TopologyEntry::QueueBinding(b) => format!(
                "binding of queue `{}` to exchange `{}` with key `{}`",
                b.queue_name, b.exchange_name, b.routing_key
            ),
            TopologyEntry::ExchangeBinding(b) => format!(
                "binding of exchange `{}` to exchange `{}` with key `{}`",
                b.destination, b.source, b.routing_key
            ),
            TopologyEntry::Consumer(c) => format!(
                "consumer `{}` of queue `{}`",
                c.definition.tag, c.definition.queue
            ),
        }
    }

    /// Queues and exchanges this entry needs, as `(queues, exchanges)`.
    pub(crate) fn dependencies(&self) -> (Vec<&str>, Vec<&str>) {
        match self {
            TopologyEntry::Exchange(_) | TopologyEntry::Queue(_) => (vec![], vec![]),
            TopologyEntry::QueueBinding(b) => {
                (vec![b.queue_name.as_str()], vec![b.exchange_name.as_str()])
            }
            TopologyEntry::ExchangeBinding(b) => {
                (vec![], vec![b.destination.as_str(), b.source.as_str()])
            }
            TopologyEntry::Consumer(c) => (vec![c.definition.queue.as_str()], vec![]),
        }
    }
}

/// A planned replay step.
#[derive(Debug, Clone)]
pub(crate) struct ReplayStep {
    pub(crate) entry: TopologyEntry,
    pub(crate) fault: Fault,
}

#[derive(Debug)]
struct Registered {
    entry: TopologyEntry,
    fault: Fault,
}

/// Ordered record of a channel's topology.
///
/// Entries are only added once the broker accepted them and only removed by an
/// explicit delete, unbind or cancel; reconnects never drop them.
#[derive(Debug, Default)]
pub(crate) struct TopologyRegistry {
    entries: Mutex<Vec<Registered>>,
}

impl TopologyRegistry {
    pub(crate) fn register_exchange(&self, def: ExchangeDefinition) -> Fault {
        let mut entries = self.entries.lock();

        let existing = entries.iter_mut().find_map(|r| match &mut r.entry {
            TopologyEntry::Exchange(current) if current.name == def.name => {
                Some((current, r.fault.clone()))
            }
            _ => None,
        });

        match existing {
            Some((current, fault)) => {
                if !(def.passive && !current.passive) {
                    *current = def;
                }
                fault
            }
            None => push(&mut entries, TopologyEntry::Exchange(def)),
        }
    }

    /// Forgets an exchange and every binding that involves it.
    pub(crate) fn deregister_exchange(&self, name: &str) {
        self.entries.lock().retain(|r| match &r.entry {
            TopologyEntry::Exchange(def) => def.name != name,
            TopologyEntry::ExchangeBinding(b) => b.destination != name && b.source != name,
            TopologyEntry::QueueBinding(b) => b.exchange_name != name,
            _ => true,
        });
    }

    pub(crate) fn register_queue(&self, def: QueueDefinition) -> Fault {
        let mut entries = self.entries.lock();

        let existing = entries.iter_mut().find_map(|r| match &mut r.entry {
            TopologyEntry::Queue(current) if current.name == def.name => {
                Some((current, r.fault.clone()))
            }
            _ => None,
        });

        match existing {
            Some((current, fault)) => {
                if !(def.passive && !current.passive) {
                    *current = def;
                }
                fault
            }
            None => push(&mut entries, TopologyEntry::Queue(def)),
        }
    }

    /// Forgets a queue, its bindings and its consumers. Returns the tags of the
    /// forgotten consumers.
    pub(crate) fn deregister_queue(&self, name: &str) -> Vec<String> {
        let mut tags = vec![];

        self.entries.lock().retain(|r| match &r.entry {
            TopologyEntry::Queue(def) => def.name != name,
            TopologyEntry::QueueBinding(b) => b.queue_name != name,
            TopologyEntry::Consumer(c) if c.definition.queue == name => {
                tags.push(c.definition.tag.clone());
                false
            }
            _ => true,
        });

        tags
    }

    pub(crate) fn register_queue_binding(&self, binding: QueueBinding) {
        let mut entries = self.entries.lock();

        let known = entries
            .iter()
            .any(|r| matches!(&r.entry, TopologyEntry::QueueBinding(b) if *b == binding));

        if !known {
            push(&mut entries, TopologyEntry::QueueBinding(binding));
        }
    }

    pub(crate) fn deregister_queue_binding(&self, binding: &QueueBinding) {
        self.entries
            .lock()
            .retain(|r| !matches!(&r.entry, TopologyEntry::QueueBinding(b) if b == binding));
    }

    pub(crate) fn register_exchange_binding(&self, binding: ExchangeBinding) {
        let mut entries = self.entries.lock();

        let known = entries
            .iter()
            .any(|r| matches!(&r.entry, TopologyEntry::ExchangeBinding(b) if *b == binding));

        if !known {
            push(&mut entries, TopologyEntry::ExchangeBinding(binding));
        }
    }

    pub(crate) fn deregister_exchange_binding(&self, binding: &ExchangeBinding) {
        self.entries
            .lock()
            .retain(|r| !matches!(&r.entry, TopologyEntry::ExchangeBinding(b) if b == binding));
    }

    pub(crate) fn register_consumer(&self, consumer: RegisteredConsumer) {
        let mut entries = self.entries.lock();

        let existing = entries.iter_mut().find(|r| {
            matches!(&r.entry, TopologyEntry::Consumer(c) if c.definition.tag == consumer.definition.tag)
        });

        match existing {
            Some(registered) => registered.entry = TopologyEntry::Consumer(consumer),
            None => {
                push(&mut entries, TopologyEntry::Consumer(consumer));
            }
        }
    }

    pub(crate) fn deregister_consumer(&self, tag: &str) -> Option<RegisteredConsumer> {
        let mut entries = self.entries.lock();

        let position = entries.iter().position(
            |r| matches!(&r.entry, TopologyEntry::Consumer(c) if c.definition.tag == tag),
        )?;

        match entries.remove(position).entry {
            TopologyEntry::Consumer(consumer) => Some(consumer),
            _ => None,
        }
    }

    pub(crate) fn queue_fault(&self, name: &str) -> Option<Fault> {
        self.entries.lock().iter().find_map(|r| match &r.entry {
            TopologyEntry::Queue(def) if def.name == name => Some(r.fault.clone()),
            _ => None,
        })
    }

    pub(crate) fn exchange_fault(&self, name: &str) -> Option<Fault> {
        self.entries.lock().iter().find_map(|r| match &r.entry {
            TopologyEntry::Exchange(def) if def.name == name => Some(r.fault.clone()),
            _ => None,
        })
    }

    /// Entries in insertion order.
    pub(crate) fn entries(&self) -> Vec<TopologyEntry> {
        self.entries.lock().iter().map(|r| r.entry.clone()).collect()
    }

    /// Entries in replay order: declarations, passive assertions, bindings,
    /// consumers, each phase in insertion order.
    pub(crate) fn replay_plan(&self) -> Vec<ReplayStep> {
        let mut plan: Vec<ReplayStep> = self
            .entries
            .lock()
            .iter()
            .map(|r| ReplayStep {
                entry: r.entry.clone(),
                fault: r.fault.clone(),
            })
            .collect();

        // stable
        plan.sort_by_key(|step| step.entry.phase());
        plan
    }
}

fn push(entries: &mut Vec<Registered>, entry: TopologyEntry) -> Fault {
    debug!("registering {}", entry.describe());

    let fault = Fault::default();
    entries.push(Registered {
        entry,
        fault: fault.clone(),
    });
    fault
}

/// Trait defining the interface for batch topology declaration.
///
/// This trait provides methods for collecting exchanges, queues, and bindings,
/// and installing them through a robust channel, which records them for recovery.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds an exchange-to-exchange binding to the topology.
    fn exchange_binding(self, binding: ExchangeBinding) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: RobustChannel,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) exchanges_binding: Vec<ExchangeBinding>,
}

impl AmqpTopology {
    pub fn new(channel: RobustChannel) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
            exchanges_binding: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn exchange_binding(mut self, binding: ExchangeBinding) -> Self {
        self.exchanges_binding.push(binding);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues (including DLQs and retry queues if configured)
    /// 3. Sets up exchange-to-exchange bindings
    /// 4. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.channel.declare_exchange(exch.clone()).await?;
        }

        for queue in &self.queues {
            self.channel.declare_queue(queue.clone()).await?;
        }

        for binding in &self.exchanges_binding {
            self.channel.bind_exchange(binding.clone()).await?;
        }

        for binding in &self.queues_binding {
            self.channel.bind_queue(binding.clone()).await?;
        }

        debug!("topology installed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerDefinition, ConsumerHandler, Delivery};
    use opentelemetry::Context;

    struct Noop;

    #[async_trait]
    impl ConsumerHandler for Noop {
        async fn exec(&self, _: &Context, _: &Delivery) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    fn consumer(queue: &str, tag: &str) -> RegisteredConsumer {
        RegisteredConsumer {
            definition: ConsumerDefinition::new(queue).tag(tag),
            handler: Arc::new(Noop),
        }
    }

    fn describe(plan: &[ReplayStep]) -> Vec<String> {
        plan.iter().map(|step| step.entry.describe()).collect()
    }

    #[test]
    fn replay_plan_orders_phases_and_keeps_insertion_order() {
        let registry = TopologyRegistry::default();

        registry.register_consumer(consumer("a", "c1"));
        registry.register_queue_binding(QueueBinding::new("a").exchange("x").routing_key("k"));
        registry.register_queue(QueueDefinition::new("p").passive());
        registry.register_queue(QueueDefinition::new("a"));
        registry.register_exchange(ExchangeDefinition::new("x"));

        assert_eq!(
            describe(&registry.replay_plan()),
            vec![
                "queue `a`",
                "exchange `x`",
                "queue `p`",
                "binding of queue `a` to exchange `x` with key `k`",
                "consumer `c1` of queue `a`",
            ]
        );
        assert_eq!(registry.entries().len(), 5);
    }

    #[test]
    fn redeclaring_keeps_position_and_fault() {
        let registry = TopologyRegistry::default();

        let first = registry.register_queue(QueueDefinition::new("q"));
        registry.register_queue(QueueDefinition::new("r"));
        first.set(AmqpError::ClosedError);

        let again = registry.register_queue(QueueDefinition::new("q").durable());
        assert_eq!(again.check(), Err(AmqpError::ClosedError));

        match &registry.entries()[0] {
            TopologyEntry::Queue(def) => assert!(def.durable),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn passive_redeclaration_does_not_downgrade() {
        let registry = TopologyRegistry::default();

        registry.register_queue(QueueDefinition::new("q").durable());
        registry.register_queue(QueueDefinition::new("q").passive());

        match &registry.entries()[..] {
            [TopologyEntry::Queue(def)] => {
                assert!(!def.passive);
                assert!(def.durable);
            }
            other => panic!("unexpected entries {:?}", other),
        }
    }

    #[test]
    fn deregistering_a_queue_drops_its_dependents() {
        let registry = TopologyRegistry::default();

        registry.register_exchange(ExchangeDefinition::new("x"));
        registry.register_queue(QueueDefinition::new("q"));
        registry.register_queue(QueueDefinition::new("other"));
        registry.register_queue_binding(QueueBinding::new("q").exchange("x"));
        registry.register_queue_binding(QueueBinding::new("other").exchange("x"));
        registry.register_consumer(consumer("q", "c1"));

        let tags = registry.deregister_queue("q");

        assert_eq!(tags, vec!["c1".to_owned()]);
        assert_eq!(
            describe(&registry.replay_plan()),
            vec![
                "exchange `x`",
                "queue `other`",
                "binding of queue `other` to exchange `x` with key ``",
            ]
        );

        registry.deregister_exchange("x");
        assert_eq!(describe(&registry.replay_plan()), vec!["queue `other`"]);
    }

    #[test]
    fn bindings_are_not_duplicated() {
        let registry = TopologyRegistry::default();
        let binding = QueueBinding::new("q").exchange("x").routing_key("k");

        registry.register_queue_binding(binding.clone());
        registry.register_queue_binding(binding.clone());
        assert_eq!(registry.entries().len(), 1);

        registry.deregister_queue_binding(&binding);
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn consumers_are_keyed_by_tag() {
        let registry = TopologyRegistry::default();

        registry.register_consumer(consumer("q", "c1"));
        registry.register_consumer(consumer("r", "c1"));
        assert_eq!(registry.entries().len(), 1);

        let removed = registry.deregister_consumer("c1").unwrap();
        assert_eq!(removed.definition.queue, "r");
        assert!(registry.deregister_consumer("c1").is_none());
    }

    #[test]
    fn fault_slot_is_shared() {
        let registry = TopologyRegistry::default();
        let fault = registry.register_queue(QueueDefinition::new("q").passive());

        registry
            .queue_fault("q")
            .unwrap()
            .set(AmqpError::ReconnectingError);
        assert_eq!(fault.check(), Err(AmqpError::ReconnectingError));

        fault.clear();
        assert!(registry.queue_fault("q").unwrap().check().is_ok());
        assert!(registry.exchange_fault("q").is_none());
    }
}
