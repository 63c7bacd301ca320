// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Robust Connection
//!
//! `RobustConnection` owns the transport connection and replaces it when it dies.
//! A single supervisor task per connection waits for the transport to close, asks
//! the reconnect policy how long to wait, opens a new transport, recovers every
//! channel on it, and finally notifies the reconnect callbacks. Failures reported
//! by channels are tagged with the transport generation they were observed on, so
//! that many channels noticing the same outage start a single reconnect.

use crate::{
    channel::{ChannelInner, RobustChannel},
    config::ConnectionParams,
    errors::AmqpError,
    lapin_transport::LapinConnector,
    policy::{Decision, ReconnectPolicy},
    transport::{same_object, CloseReason, Connector, RawConnection},
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;
const RECOVERY_ERRORS_CAPACITY: usize = 64;

/// Lifecycle of a robust connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// The transport was lost; the reconnect loop is running.
    Reconnecting,
    /// Closed by the user, or the reconnect policy gave up. Terminal.
    Closed,
}

/// Notified after every successful reconnect, once all channels are recovered.
///
/// Any `Fn(&RobustConnection) -> Result<(), AmqpError>` closure is a callback.
/// Errors and panics are logged and do not affect the connection or the other
/// callbacks.
pub trait ReconnectCallback: Send + Sync {
    fn on_reconnect(&self, connection: &RobustConnection) -> Result<(), AmqpError>;
}

impl<F> ReconnectCallback for F
where
    F: Fn(&RobustConnection) -> Result<(), AmqpError> + Send + Sync,
{
    fn on_reconnect(&self, connection: &RobustConnection) -> Result<(), AmqpError> {
        self(connection)
    }
}

/// Builder of a [`RobustConnection`] with a custom connector or reconnect policy.
pub struct RobustConnectionBuilder {
    params: ConnectionParams,
    connector: Option<Arc<dyn Connector>>,
    policy: Option<Arc<dyn ReconnectPolicy>>,
}

impl RobustConnectionBuilder {
    pub fn new(params: ConnectionParams) -> RobustConnectionBuilder {
        RobustConnectionBuilder {
            params,
            connector: None,
            policy: None,
        }
    }

    /// Opens transports with `connector` instead of lapin.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Overrides the policy derived from the parameters.
    pub fn policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validates the parameters and opens the first transport connection.
    ///
    /// A failure here is returned as is: there is no retry before the connection
    /// was established once.
    pub async fn open(self) -> Result<RobustConnection, AmqpError> {
        self.params.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(LapinConnector::default()));
        let policy = self
            .policy
            .unwrap_or_else(|| self.params.reconnect_policy());

        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let (recovery_errors, _) = broadcast::channel(RECOVERY_ERRORS_CAPACITY);

        let inner = Arc::new(ConnectionInner {
            params: self.params,
            connector,
            policy,
            transport: Mutex::new(None),
            generation: AtomicU64::new(0),
            state,
            channels: Mutex::new(vec![]),
            next_channel_id: AtomicU64::new(1),
            callbacks: Mutex::new(vec![]),
            failures,
            recovery_errors,
            reconnects: AtomicU64::new(0),
        });

        let transport = match inner.connector.connect(&inner.params).await {
            Ok(transport) => transport,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(match err {
                    AmqpError::ConnectionError(_) | AmqpError::ConfigError(_) => err,
                    other => AmqpError::ConnectionError(other.to_string()),
                });
            }
        };

        *inner.transport.lock() = Some(transport.clone());
        inner.state.send_replace(ConnectionState::Open);
        info!(name = inner.params.connection_name, "amqp connected");

        tokio::spawn(supervise(
            Arc::downgrade(&inner),
            transport,
            0,
            failures_rx,
            inner.state.subscribe(),
        ));

        Ok(RobustConnection { inner })
    }
}

pub(crate) struct ConnectionInner {
    params: ConnectionParams,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn ReconnectPolicy>,
    transport: Mutex<Option<Arc<dyn RawConnection>>>,
    // bumped every time a new transport is installed
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    channels: Mutex<Vec<Arc<ChannelInner>>>,
    next_channel_id: AtomicU64,
    callbacks: Mutex<Vec<Weak<dyn ReconnectCallback>>>,
    failures: mpsc::UnboundedSender<u64>,
    recovery_errors: broadcast::Sender<AmqpError>,
    reconnects: AtomicU64,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Moves to `to` unless the connection is closed.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut allowed = false;

        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            allowed = true;
            let modified = *state != to;
            *state = to;
            modified
        });

        allowed
    }

    pub(crate) fn current_transport(&self) -> Option<Arc<dyn RawConnection>> {
        self.transport.lock().clone()
    }

    /// Tells the supervisor that `transport` looks dead. Ignored when it was
    /// already replaced.
    pub(crate) fn report_transport_failure(&self, transport: &Arc<dyn RawConnection>) {
        let slot = self.transport.lock();

        if let Some(current) = slot.as_ref() {
            if same_object(current, transport) {
                let generation = self.generation.load(Ordering::SeqCst);
                debug!(generation, "transport failure reported");
                let _ = self.failures.send(generation);
            }
        }
    }

    pub(crate) fn report_recovery_error(&self, err: AmqpError) {
        // no subscriber is fine
        let _ = self.recovery_errors.send(err);
    }

    pub(crate) fn forget_channel(&self, id: u64) {
        self.channels.lock().retain(|channel| channel.id() != id);
    }

    fn channels(&self) -> Vec<Arc<ChannelInner>> {
        self.channels.lock().clone()
    }

    async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Waits until the connection is open, following the same rules as channel
    /// operations.
    async fn wait_open(&self) -> Result<(), AmqpError> {
        let mut state = self.state.subscribe();

        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Closed => return Err(AmqpError::ClosedError),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }

        if !self.params.wait_for_recovery {
            return Err(AmqpError::ReconnectingError);
        }

        let ready = state.wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Closed));
        let reached = match self.params.operation_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, ready)
                .await
                .map_err(|_| AmqpError::ReconnectingError)?
                .map(|state| *state),
            None => ready.await.map(|state| *state),
        };

        match reached {
            Ok(ConnectionState::Open) => Ok(()),
            _ => Err(AmqpError::ClosedError),
        }
    }

    /// Runs reconnect attempts until one succeeds, the policy gives up or the
    /// connection is closed. Returns the new transport and its generation.
    async fn reconnect(
        self: &Arc<Self>,
        reason: CloseReason,
    ) -> Option<(Arc<dyn RawConnection>, u64)> {
        if !self.transition(ConnectionState::Reconnecting) {
            return None;
        }
        warn!(reason = reason.to_string(), "transport connection lost, reconnecting");

        let stale = self.transport.lock().take();
        if let Some(stale) = stale {
            tokio::spawn(async move {
                let _ = stale.close(REPLY_SUCCESS, "replaced by a new connection").await;
            });
        }
        for channel in self.channels() {
            channel.detach();
        }

        let mut last = reason;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let delay = match self.policy.decide(&last, attempt) {
                Decision::RetryAfter(delay) => delay,
                Decision::GiveUp => {
                    error!(attempt, reason = last.to_string(), "giving up reconnecting");
                    self.terminate().await;
                    return None;
                }
            };
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "waiting before reconnect attempt"
            );

            let outcome = tokio::select! {
                _ = self.wait_closed() => return None,
                outcome = async {
                    tokio::time::sleep(delay).await;
                    self.attempt().await
                } => outcome,
            };

            match outcome {
                Ok(transport) => {
                    if !self.transition(ConnectionState::Open) {
                        return None;
                    }

                    let reconnects = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(attempt, reconnects, "connection recovered");

                    self.fire_callbacks();
                    return Some((transport, self.generation.load(Ordering::SeqCst)));
                }
                Err(err) => {
                    warn!(attempt, error = err.to_string(), "reconnect attempt failed");
                    last = CloseReason::from(&err);
                }
            }
        }
    }

    /// Opens a transport and recovers every channel on it.
    async fn attempt(self: &Arc<Self>) -> Result<Arc<dyn RawConnection>, AmqpError> {
        let transport = self.connector.connect(&self.params).await?;

        {
            let mut slot = self.transport.lock();
            if self.is_closed() {
                drop(slot);
                close_quietly(transport);
                return Err(AmqpError::ClosedError);
            }
            *slot = Some(transport.clone());
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        let channels = self.channels();
        debug!(channels = channels.len(), "recovering channels");

        let results = join_all(channels.iter().map(|channel| channel.recover(&transport))).await;

        for result in results {
            match result {
                Ok(()) | Err(AmqpError::ClosedError) => {}
                Err(err) => {
                    {
                        let mut slot = self.transport.lock();
                        if slot.as_ref().is_some_and(|current| same_object(current, &transport)) {
                            slot.take();
                        }
                    }
                    for channel in &channels {
                        channel.detach();
                    }
                    close_quietly(transport);
                    return Err(err);
                }
            }
        }

        Ok(transport)
    }

    fn fire_callbacks(self: &Arc<Self>) {
        let callbacks: Vec<Arc<dyn ReconnectCallback>> = {
            let mut callbacks = self.callbacks.lock();
            callbacks.retain(|callback| callback.strong_count() > 0);
            callbacks.iter().filter_map(Weak::upgrade).collect()
        };

        let connection = RobustConnection {
            inner: self.clone(),
        };

        for (index, callback) in callbacks.iter().enumerate() {
            if self.is_closed() {
                break;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| callback.on_reconnect(&connection))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(callback = index, error = err.to_string(), "reconnect callback failed")
                }
                Err(_) => error!(callback = index, "reconnect callback panicked"),
            }
        }
    }

    /// Closes the connection for good: channels, callbacks and transport.
    async fn terminate(&self) {
        self.state.send_replace(ConnectionState::Closed);

        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels {
            channel.shutdown().await;
        }

        self.callbacks.lock().clear();

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            if transport.is_open() {
                if let Err(err) = transport.close(REPLY_SUCCESS, "connection closed by client").await {
                    debug!(error = err.to_string(), "failure to close transport connection");
                }
            }
        }
    }
}

fn close_quietly(transport: Arc<dyn RawConnection>) {
    tokio::spawn(async move {
        let _ = transport.close(REPLY_SUCCESS, "reconnect attempt aborted").await;
    });
}

/// Watches the current transport and runs a reconnect cycle whenever it dies.
async fn supervise(
    connection: Weak<ConnectionInner>,
    mut transport: Arc<dyn RawConnection>,
    mut generation: u64,
    mut failures: mpsc::UnboundedReceiver<u64>,
    mut state: watch::Receiver<ConnectionState>,
) {
    loop {
        let reason = tokio::select! {
            reason = transport.closed() => reason,
            Some(observed) = failures.recv() => {
                if observed != generation {
                    debug!(observed, generation, "ignoring failure of a replaced transport");
                    continue;
                }
                CloseReason::Transport("failure observed by a channel".to_owned())
            }
            _ = state.wait_for(|s| *s == ConnectionState::Closed) => return,
        };

        let Some(inner) = connection.upgrade() else {
            return;
        };
        if inner.is_closed() {
            return;
        }

        match inner.reconnect(reason).await {
            Some((replacement, current)) => {
                transport = replacement;
                generation = current;
            }
            None => return,
        }
    }
}

/// A connection that survives transport failures.
///
/// Cheap to clone; clones share the same connection. The connection is closed
/// only by [`RobustConnection::close`] or when the reconnect policy gives up.
#[derive(Clone)]
pub struct RobustConnection {
    inner: Arc<ConnectionInner>,
}

impl RobustConnection {
    /// Opens a connection over lapin with the policy derived from `params`.
    pub async fn connect(params: ConnectionParams) -> Result<RobustConnection, AmqpError> {
        RobustConnectionBuilder::new(params).open().await
    }

    /// Starts building a connection, to replace the connector or the reconnect
    /// policy.
    ///
    /// # Parameters
    /// * `params` - Connection parameters
    ///
    /// # Returns
    /// A builder, opened with [`RobustConnectionBuilder::open`]
    pub fn builder(params: ConnectionParams) -> RobustConnectionBuilder {
        RobustConnectionBuilder::new(params)
    }

    /// The parameters the connection was opened with.
    pub fn params(&self) -> &ConnectionParams {
        &self.inner.params
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Subscribes to state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Configured delay between reconnect attempts.
    pub fn reconnect_interval(&self) -> Duration {
        self.inner.params.reconnect_interval()
    }

    /// Number of successful reconnects so far.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// The current transport connection, if any.
    pub fn transport(&self) -> Option<Arc<dyn RawConnection>> {
        self.inner.current_transport()
    }

    /// Subscribes to topology entries that failed to recover.
    pub fn recovery_errors(&self) -> broadcast::Receiver<AmqpError> {
        self.inner.recovery_errors.subscribe()
    }

    /// Opens a robust channel. Its first transport channel is opened before
    /// this returns.
    ///
    /// # Returns
    /// The channel, or `ReconnectingError` when the connection is being
    /// re-established and operations fail fast
    pub async fn channel(&self) -> Result<RobustChannel, AmqpError> {
        self.inner.wait_open().await?;

        let Some(transport) = self.inner.current_transport() else {
            return Err(AmqpError::ReconnectingError);
        };

        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let channel = ChannelInner::new(id, Arc::downgrade(&self.inner), &self.inner.params);
        self.inner.channels.lock().push(channel.clone());

        match channel.recover(&transport).await {
            Ok(()) => {
                debug!(channel = id, "channel created");
                Ok(RobustChannel::new(channel))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                self.inner.forget_channel(id);
                channel.shutdown().await;
                if err.is_transport() {
                    self.inner.report_transport_failure(&transport);
                }
                Err(err)
            }
        }
    }

    /// Registers a callback fired after every successful reconnect, in
    /// registration order. Only a weak reference is kept: dropping the last
    /// `Arc` unregisters it.
    ///
    /// # Parameters
    /// * `callback` - The callback; the caller keeps it alive
    pub fn add_reconnect_callback(&self, callback: &Arc<dyn ReconnectCallback>) {
        self.inner.callbacks.lock().push(Arc::downgrade(callback));
    }

    /// Unregisters a callback added with [`RobustConnection::add_reconnect_callback`].
    pub fn remove_reconnect_callback(&self, callback: &Arc<dyn ReconnectCallback>) {
        self.inner.callbacks.lock().retain(|registered| {
            registered
                .upgrade()
                .is_some_and(|registered| !same_object(&registered, callback))
        });
    }

    /// Closes the connection and its channels. Stops any reconnect in progress.
    /// Closing an already closed connection is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.inner.is_closed() {
            debug!("connection already closed");
            return Ok(());
        }

        info!("closing amqp connection");
        self.inner.terminate().await;
        Ok(())
    }
}

impl std::fmt::Debug for RobustConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustConnection")
            .field("params", &self.inner.params)
            .field("state", &self.inner.state())
            .field("reconnects", &self.reconnect_count())
            .finish()
    }
}
