//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.
//!
//! The initializer provisions the key pool before it listens; workers skip
//! straight to starting the listener and attach to the shared rotator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

/// Which part of the process this instance plays in a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Provisions the pool and owns the shared state
    Initializer,
    /// Reads the pool the initializer wrote
    Worker,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Initializer => "initializer",
            Role::Worker => "worker",
        }
    }
}

/// Runtime counters tracked while the service is running
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Service states.
///
/// Some fields are only carried between transitions and never read on their
/// own.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceState {
    /// Loading config, setting up resources
    Initializing,
    /// Building the key pool; `attempt` counts retries so far
    Provisioning {
        attempt: u32,
        listen_addr: SocketAddr,
    },
    /// Binding the HTTP listener
    Starting { listen_addr: SocketAddr },
    /// Accepting and proxying requests
    Running {
        listen_addr: SocketAddr,
        metrics: ServiceMetrics,
    },
    /// Graceful shutdown, finishing in-flight requests
    Draining { deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
    /// Provisioning failed, waiting to retry
    Error {
        error: String,
        attempt: u32,
        listen_addr: SocketAddr,
    },
}

/// Events that drive state transitions.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceEvent {
    /// Configuration parsed successfully
    ConfigLoaded { listen_addr: SocketAddr, role: Role },
    /// Pool built and handed to the rotator
    PoolReady { pool_size: usize },
    /// Pool build failed; `retryable` is false for configuration errors
    ProvisioningFailed { error: String, retryable: bool },
    /// HTTP listener bound and ready
    ListenerReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// All in-flight requests finished
    Drained,
    /// Drain deadline exceeded
    DrainTimeout,
    /// Retry backoff expired
    RetryTimer,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum ServiceAction {
    /// Build the key pool and initialize the rotator
    Provision,
    /// Bind HTTP listener on the given address
    StartListener { addr: SocketAddr },
    /// Set retry timer
    ScheduleRetry { delay: Duration },
    /// Tear the rotator down and exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Provisioning retries before giving up
pub const MAX_PROVISION_RETRIES: u32 = 5;

/// Time allowed for in-flight requests after a shutdown signal
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (
            ServiceState::Initializing,
            ServiceEvent::ConfigLoaded {
                listen_addr,
                role: Role::Initializer,
            },
        ) => (
            ServiceState::Provisioning {
                attempt: 0,
                listen_addr,
            },
            ServiceAction::Provision,
        ),

        (
            ServiceState::Initializing,
            ServiceEvent::ConfigLoaded {
                listen_addr,
                role: Role::Worker,
            },
        ) => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        // --- Provisioning ---
        (ServiceState::Provisioning { listen_addr, .. }, ServiceEvent::PoolReady { .. }) => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        (
            ServiceState::Provisioning {
                attempt,
                listen_addr,
            },
            ServiceEvent::ProvisioningFailed {
                error,
                retryable: true,
            },
        ) if attempt < MAX_PROVISION_RETRIES => {
            let delay = Duration::from_secs(2u64.pow(attempt));
            (
                ServiceState::Error {
                    error,
                    attempt,
                    listen_addr,
                },
                ServiceAction::ScheduleRetry { delay },
            )
        }

        (ServiceState::Provisioning { .. }, ServiceEvent::ProvisioningFailed { .. }) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        // --- Error recovery ---
        (
            ServiceState::Error {
                attempt,
                listen_addr,
                ..
            },
            ServiceEvent::RetryTimer,
        ) => (
            ServiceState::Provisioning {
                attempt: attempt + 1,
                listen_addr,
            },
            ServiceAction::Provision,
        ),

        // --- Starting ---
        (ServiceState::Starting { listen_addr }, ServiceEvent::ListenerReady) => (
            ServiceState::Running {
                listen_addr,
                metrics: ServiceMetrics::new(),
            },
            ServiceAction::None,
        ),

        // --- Running ---
        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Draining {
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServiceAction::None,
        ),

        // --- Draining ---
        (ServiceState::Draining { .. }, ServiceEvent::Drained | ServiceEvent::DrainTimeout) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Any state + shutdown = stop ---
        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}
