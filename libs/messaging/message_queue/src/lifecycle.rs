//! Service Lifecycle
//!
//! Every reader and writer owns one [`Lifecycle`], which gates all queue
//! operations on broker readiness:
//!
//! ```text
//! Idle ──start──▶ Starting ──ok──▶ Running ──stop──▶ Stopping ──ok──▶ Terminated
//!   │                 │                                  │
//!   │                 └──err──▶ Failed ◀──────err────────┘
//!   └──────stop──────────────────────────────────────────────────────▶ Terminated
//! ```
//!
//! The current state lives in a `watch` channel. It works as a single-fire
//! gate: callers of [`Lifecycle::await_running`] park until the state leaves
//! `Idle`/`Starting`, and every waiter observes the same transition.
//!
//! While `Running` the lifecycle exclusively owns the broker handles `H`.
//! Operations borrow them as `Arc` clones via [`Lifecycle::handles`]; only
//! [`Lifecycle::stop`] closes them.

use crate::error::QueueError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Constructed, not yet started
    Idle,
    /// Connecting to the broker
    Starting,
    /// Handles established, operations allowed
    Running,
    /// Releasing handles
    Stopping,
    /// Shut down cleanly
    Terminated,
    /// Startup or shutdown raised an error
    Failed,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Idle, Terminated)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Stopping, Terminated)
                | (Stopping, Failed)
        )
    }

    /// Terminated or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Terminated | ServiceState::Failed)
    }

    /// States in which callers wait on the readiness gate
    pub fn is_pending(self) -> bool {
        matches!(self, ServiceState::Idle | ServiceState::Starting)
    }
}

/// Outcome of waiting on the readiness gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The wait was interrupted before the service became ready; no I/O may follow
    Interrupted,
}

/// Broker resources owned by a running service
#[async_trait]
pub trait ServiceHandles: Send + Sync + 'static {
    /// Release every resource, attempting each close even if an earlier one
    /// failed. Returns the first error.
    async fn close(&self) -> Result<(), QueueError>;
}

pub struct Lifecycle<H: ServiceHandles> {
    name: String,
    state: watch::Sender<ServiceState>,
    handles: RwLock<Option<Arc<H>>>,
    failure_cause: RwLock<Option<QueueError>>,
    interrupt: Mutex<CancellationToken>,
    /// Serializes start/stop
    transition_lock: tokio::sync::Mutex<()>,
}

impl<H: ServiceHandles> std::fmt::Debug for Lifecycle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<H: ServiceHandles> Lifecycle<H> {
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ServiceState::Idle);
        Self {
            name: name.into(),
            state,
            handles: RwLock::new(None),
            failure_cause: RwLock::new(None),
            interrupt: Mutex::new(CancellationToken::new()),
            transition_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Error that moved the service to `Failed`, if any
    pub fn failure_cause(&self) -> Option<QueueError> {
        self.failure_cause.read().clone()
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> Result<(), QueueError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if *current != from || !current.can_transition_to(to) {
                result = Err(QueueError::IllegalState {
                    name: self.name.clone(),
                    from: *current,
                    action: "transition",
                });
                return false;
            }
            *current = to;
            true
        });

        if result.is_ok() {
            tracing::debug!(
                "Message queue service '{}' state transition: {:?} -> {:?}",
                self.name,
                from,
                to
            );
        }
        result
    }

    /// Run `open` to acquire the broker handles and open the readiness gate
    pub async fn start<F, Fut>(&self, open: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<H, QueueError>> + Send,
    {
        let _guard = self.transition_lock.lock().await;

        let current = self.state();
        if current != ServiceState::Idle {
            return Err(QueueError::IllegalState {
                name: self.name.clone(),
                from: current,
                action: "start",
            });
        }
        self.transition(ServiceState::Idle, ServiceState::Starting)?;

        match open().await {
            Ok(handles) => {
                *self.handles.write() = Some(Arc::new(handles));
                self.transition(ServiceState::Starting, ServiceState::Running)?;
                tracing::info!("Message queue service '{}' is running", self.name);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Message queue service '{}' failed to start: {}", self.name, e);
                *self.failure_cause.write() = Some(e.clone());
                self.transition(ServiceState::Starting, ServiceState::Failed)?;
                Err(QueueError::StartupFailure {
                    name: self.name.clone(),
                    cause: Box::new(e),
                })
            }
        }
    }

    /// Close the handles and terminate
    ///
    /// Stopping an idle service terminates it without touching the broker.
    /// Stopping an already stopped or failed service is a no-op.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let _guard = self.transition_lock.lock().await;

        match self.state() {
            ServiceState::Idle => {
                self.transition(ServiceState::Idle, ServiceState::Terminated)?;
                tracing::info!("Message queue service '{}' terminated before start", self.name);
                return Ok(());
            }
            ServiceState::Running => {}
            ServiceState::Starting => {
                return Err(QueueError::IllegalState {
                    name: self.name.clone(),
                    from: ServiceState::Starting,
                    action: "stop",
                });
            }
            ServiceState::Stopping | ServiceState::Terminated | ServiceState::Failed => {
                return Ok(());
            }
        }

        self.transition(ServiceState::Running, ServiceState::Stopping)?;
        tracing::info!("Stopping message queue service '{}'", self.name);

        let handles = self.handles.write().take();
        let result = match handles {
            Some(handles) => handles.close().await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.transition(ServiceState::Stopping, ServiceState::Terminated)?;
                tracing::info!("Message queue service '{}' terminated", self.name);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Message queue service '{}' failed to stop: {}", self.name, e);
                *self.failure_cause.write() = Some(e.clone());
                self.transition(ServiceState::Stopping, ServiceState::Failed)?;
                Err(QueueError::ShutdownFailure {
                    name: self.name.clone(),
                    cause: Box::new(e),
                })
            }
        }
    }

    /// Wait until the service leaves `Idle`/`Starting`
    ///
    /// Returns `Ready` once running, `Interrupted` if [`Lifecycle::interrupt`]
    /// fired during the wait, and `NotRunning` if the service is stopping or
    /// already stopped.
    pub async fn await_running(&self) -> Result<Readiness, QueueError> {
        let interrupt = self.interrupt.lock().clone();
        let mut state_rx = self.state.subscribe();

        let state = tokio::select! {
            biased;
            state = async { state_rx.wait_for(|s| !s.is_pending()).await.map(|s| *s) } => match state {
                Ok(state) => state,
                // The sender lives as long as self
                Err(_) => self.state(),
            },
            _ = interrupt.cancelled() => {
                tracing::info!("Message queue service '{}' wait interrupted", self.name);
                return Ok(Readiness::Interrupted);
            }
        };

        if state == ServiceState::Running {
            Ok(Readiness::Ready)
        } else {
            Err(QueueError::not_running(&self.name, state))
        }
    }

    /// Interrupt every caller currently blocked in [`Lifecycle::await_running`]
    ///
    /// Later waits are unaffected.
    pub fn interrupt(&self) {
        let mut token = self.interrupt.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Handles of the running service
    pub fn handles(&self) -> Result<Arc<H>, QueueError> {
        let state = self.state();
        if state != ServiceState::Running {
            return Err(QueueError::not_running(&self.name, state));
        }
        self.handles
            .read()
            .clone()
            .ok_or_else(|| QueueError::not_running(&self.name, self.state()))
    }
}
