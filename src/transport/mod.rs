//! Transport Manager
//!
//! Owns exactly one logical connection to the control backend and presents it as:
//! - a status observable ([`TransportManager::status`], [`TransportManager::on_status_change`],
//!   [`TransportManager::status_receiver`])
//! - a typed event subscription API ([`TransportManager::on`] / [`TransportManager::off`])
//! - a best-effort outbound primitive ([`TransportManager::send`])
//!
//! Two strategies feed it, chosen per deployment:
//!
//! - **Push** ([`push`]): a WebSocket receiving `{type, data}` frames
//! - **Pull** ([`pull`]): a fixed-interval REST poll loop with exponential backoff
//!
//! Both publish the same [`InboundEvent`] values. Transport errors never reach
//! subscribers; they become status transitions and retries.
//!
//! # Lifecycle
//!
//! Each `connect()` starts one strategy task tagged with a new generation number.
//! `disconnect()` bumps the generation and cancels the task; a task whose generation is
//! stale can no longer change status or publish events, so a slow socket or poll request
//! finishing after `disconnect()` has no visible effect.
//!
//! The manager is an ordinary value: build one per session and pass clones around.

pub mod bus;
pub mod frame;
mod pull;
mod push;
pub mod reconnect;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use frame::{
    decode_inbound_frame, DeviceSample, DeviceStatusReport, EventKind, FrameError, InboundEvent,
    StatusSnapshot,
};
pub use reconnect::{friendly_error_message, is_retriable_error, ConnectionStatus, ReconnectConfig};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::Backend;
use crate::config::{HmiConfig, StrategyKind, TransportConfig};
use crate::connection::{self, BackendAddress};
use crate::error::Result;
use crate::protocol::DeviceId;

/// Connection-status callback.
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Handle returned by [`TransportManager::on_status_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusSubscription(u64);

/// Strategy the manager runs.
#[derive(Clone)]
pub enum TransportStrategy {
    /// Persistent WebSocket at `url`
    Push {
        /// Socket URL
        url: Url,
    },
    /// REST polling through `backend`
    Pull {
        /// Backend polled every tick
        backend: Arc<dyn Backend>,
    },
}

impl TransportStrategy {
    /// Build the configured strategy.
    pub fn from_config(
        config: &HmiConfig,
        address: &BackendAddress,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        Ok(match config.transport.strategy {
            StrategyKind::Pull => Self::Pull { backend },
            StrategyKind::Push => Self::Push {
                url: connection::resolve_socket_url(config.transport.socket_url.as_deref(), address)?,
            },
        })
    }

    /// Which kind of strategy this is.
    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Push { .. } => StrategyKind::Push,
            Self::Pull { .. } => StrategyKind::Pull,
        }
    }
}

impl std::fmt::Debug for TransportStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push { url } => f.debug_struct("Push").field("url", &url.as_str()).finish(),
            Self::Pull { .. } => f.debug_struct("Pull").finish_non_exhaustive(),
        }
    }
}

struct Worker {
    // Dropping the sender also cancels the task.
    _cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct StatusState {
    current: ConnectionStatus,
    generation: u64,
}

struct Inner {
    strategy: TransportStrategy,
    config: TransportConfig,
    state: Mutex<StatusState>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_handlers: RwLock<Vec<(StatusSubscription, StatusHandler)>>,
    next_status_id: AtomicU64,
    bus: EventBus,
    worker: Mutex<Option<Worker>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    latest_data: RwLock<HashMap<DeviceId, DeviceSample>>,
}

impl Inner {
    /// Apply a transition if `generation` is current. Returns `false` for stale callers.
    fn transition(&self, generation: Option<u64>, next: ConnectionStatus) -> bool {
        let changed = {
            let mut state = self.state.lock();
            if generation.is_some_and(|g| g != state.generation) {
                return false;
            }
            if state.current == next {
                false
            } else {
                debug!(from = %state.current, to = %next, "Connection status changed");
                state.current = next;
                self.status_tx.send_replace(next);
                true
            }
        };
        if changed {
            self.notify_status(next);
        }
        true
    }

    /// Start a new generation in `Connecting`.
    fn begin_generation(&self) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.generation
        };
        self.transition(Some(generation), ConnectionStatus::Connecting);
        generation
    }

    /// Invalidate the running generation and settle in `Disconnected`.
    fn end_generation(&self) {
        self.state.lock().generation += 1;
        self.transition(None, ConnectionStatus::Disconnected);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn notify_status(&self, status: ConnectionStatus) {
        let handlers: Vec<StatusHandler> = self
            .status_handlers
            .read()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(status))).is_err() {
                tracing::error!(%status, "Status handler panicked");
            }
        }
    }
}

/// Connection from a strategy task back to its manager.
///
/// Holds a weak reference so a forgotten task cannot keep the manager alive, and a
/// generation so a superseded task cannot touch its state.
#[derive(Clone)]
pub(crate) struct Link {
    inner: Weak<Inner>,
    generation: u64,
}

impl Link {
    /// Report a status transition. Returns `false` when the task should exit.
    pub(crate) fn set_status(&self, status: ConnectionStatus) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.transition(Some(self.generation), status))
    }

    /// Publish an event to subscribers. Returns `false` when the task should exit.
    pub(crate) fn publish(&self, event: &InboundEvent) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        if !inner.is_current(self.generation) {
            return false;
        }
        if let InboundEvent::DeviceData(sample) = event {
            inner.latest_data.write().insert(sample.device, sample.clone());
        }
        inner.bus.publish(event);
        true
    }

    /// Decode and publish one raw frame; malformed frames are logged and dropped.
    pub(crate) fn handle_frame(&self, raw: &str) -> bool {
        match decode_inbound_frame(raw) {
            Ok(event) => self.publish(&event),
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                self.inner.strong_count() > 0
            }
        }
    }
}

/// Shared handle to the single backend connection.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("strategy", &self.inner.strategy)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl TransportManager {
    /// Create a manager in `Disconnected`; nothing runs until [`connect`](Self::connect).
    #[must_use]
    pub fn new(strategy: TransportStrategy, config: TransportConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                strategy,
                config,
                state: Mutex::new(StatusState {
                    current: ConnectionStatus::Disconnected,
                    generation: 0,
                }),
                status_tx,
                status_handlers: RwLock::new(Vec::new()),
                next_status_id: AtomicU64::new(0),
                bus: EventBus::new(),
                worker: Mutex::new(None),
                outbound: Mutex::new(None),
                latest_data: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Build the configured strategy and a manager for it.
    pub fn from_config(
        config: &HmiConfig,
        address: &BackendAddress,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        let strategy = TransportStrategy::from_config(config, address, backend)?;
        Ok(Self::new(strategy, config.transport.clone()))
    }

    /// Kind of strategy this manager runs.
    #[must_use]
    pub fn strategy_kind(&self) -> StrategyKind {
        self.inner.strategy.kind()
    }

    /// Start the strategy. No-op while already connecting or connected.
    ///
    /// Must be called from within a Tokio runtime; otherwise the manager settles in
    /// `Error`.
    pub fn connect(&self) {
        let mut worker = self.inner.worker.lock();
        let running = worker.as_ref().is_some_and(|w| !w.handle.is_finished());
        if running && self.status().is_active() {
            debug!("Transport already connecting or connected");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("connect() called outside a Tokio runtime");
            self.inner.transition(None, ConnectionStatus::Error);
            return;
        };

        // Replacing the worker drops the old cancel sender, which stops a pending retry.
        let generation = self.inner.begin_generation();
        let link = Link {
            inner: Arc::downgrade(&self.inner),
            generation,
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let handle = match &self.inner.strategy {
            TransportStrategy::Push { url } => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                *self.inner.outbound.lock() = Some(out_tx);
                info!(url = %url, "Starting push transport");
                runtime.spawn(push::run(
                    link,
                    url.clone(),
                    ReconnectConfig::for_push(&self.inner.config),
                    out_rx,
                    cancel_rx,
                ))
            }
            TransportStrategy::Pull { backend } => {
                info!(interval_ms = self.inner.config.poll_interval_ms, "Starting pull transport");
                runtime.spawn(pull::run(
                    link,
                    Arc::clone(backend),
                    self.inner.config.clone(),
                    cancel_rx,
                ))
            }
        };

        *worker = Some(Worker {
            _cancel: cancel_tx,
            handle,
        });
    }

    /// Stop the strategy and settle in `Disconnected`. Idempotent.
    pub fn disconnect(&self) {
        let worker = self.inner.worker.lock().take();
        self.inner.outbound.lock().take();
        self.inner.end_generation();
        if worker.is_some() {
            info!("Transport disconnected");
        }
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().current
    }

    /// Receiver that observes every status value.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Current generation; bumps on every `connect()` and `disconnect()`.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Subscribe to status transitions. The handler runs once immediately with the
    /// current status, then on every transition.
    pub fn on_status_change<F>(&self, handler: F) -> StatusSubscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let id = StatusSubscription(self.inner.next_status_id.fetch_add(1, Ordering::Relaxed));
        let handler: StatusHandler = Arc::new(handler);
        self.inner
            .status_handlers
            .write()
            .push((id, Arc::clone(&handler)));
        let current = self.status();
        if catch_unwind(AssertUnwindSafe(|| handler(current))).is_err() {
            tracing::error!(status = %current, "Status handler panicked");
        }
        id
    }

    /// Remove a status handler.
    pub fn off_status_change(&self, id: StatusSubscription) -> bool {
        let mut handlers = self.inner.status_handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Subscribe to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, handler)
    }

    /// Unsubscribe from events of `kind`.
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.inner.bus.off(kind, id)
    }

    /// Most recent telemetry sample for `device`.
    #[must_use]
    pub fn latest_device_data(&self, device: DeviceId) -> Option<DeviceSample> {
        self.inner.latest_data.read().get(&device).cloned()
    }

    /// Queue a JSON message on the socket. Returns `false` (and logs) when it cannot be
    /// sent: not connected, or the pull strategy, where requests come from the poll loop.
    pub fn send<M: Serialize + ?Sized>(&self, message: &M) -> bool {
        if self.strategy_kind() == StrategyKind::Pull {
            debug!("send() is not applicable to the pull strategy");
            return false;
        }
        if !self.status().is_connected() {
            warn!(status = %self.status(), "Socket is not connected, cannot send message");
            return false;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Outbound message does not serialize");
                return false;
            }
        };
        self.inner
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(text).is_ok())
    }

    /// Ask the backend for a fresh status snapshot (push strategy only).
    pub fn request_status(&self) -> bool {
        self.send(&push::request_status_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use parking_lot::Mutex as PlMutex;

    fn pull_manager() -> TransportManager {
        TransportManager::new(
            TransportStrategy::Pull {
                backend: Arc::new(MockBackend::new()),
            },
            TransportConfig::default(),
        )
    }

    #[test]
    fn starts_disconnected() {
        let manager = pull_manager();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.generation(), 0);
    }

    #[test]
    fn status_handler_gets_current_status_immediately() {
        let manager = pull_manager();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        manager.on_status_change(move |status| s.lock().push(status));
        assert_eq!(*seen.lock(), vec![ConnectionStatus::Disconnected]);
    }

    #[test]
    fn connect_outside_runtime_settles_in_error() {
        let manager = pull_manager();
        manager.connect();
        assert_eq!(manager.status(), ConnectionStatus::Error);
    }

    #[test]
    fn send_is_not_applicable_to_pull() {
        let manager = pull_manager();
        assert!(!manager.send(&serde_json::json!({"type": "request_status"})));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let manager = pull_manager();
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn stale_link_cannot_change_status() {
        let manager = pull_manager();
        let stale = Link {
            inner: Arc::downgrade(&manager.inner),
            generation: manager.generation(),
        };
        manager.disconnect();
        assert!(!stale.set_status(ConnectionStatus::Connected));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn link_publish_caches_samples() {
        let manager = pull_manager();
        let link = Link {
            inner: Arc::downgrade(&manager.inner),
            generation: manager.generation(),
        };
        let sample = DeviceSample {
            device: DeviceId::Sdu,
            data: serde_json::json!({"load": 3}),
            timestamp: None,
        };
        assert!(link.publish(&InboundEvent::DeviceData(sample.clone())));
        assert_eq!(manager.latest_device_data(DeviceId::Sdu), Some(sample));
    }
}
