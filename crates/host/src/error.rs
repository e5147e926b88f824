//! Host error types

use protocol::UsbError;
use thiserror::Error;

/// Start/stop misuse of a long-lived component
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// `start` called while already running
    #[error("{component} is already running")]
    AlreadyRunning { component: String },

    /// `stop` called while not running
    #[error("{component} is not running")]
    NotRunning { component: String },

    /// Operation on a component that has been disposed
    #[error("{component} has been disposed")]
    Disposed { component: String },

    /// Backend refused the subscription
    #[error("USB backend error: {0}")]
    Backend(#[from] UsbError),

    /// A helper thread could not be spawned
    #[error("failed to spawn {component} thread: {message}")]
    Spawn { component: String, message: String },
}

/// Failure to start an echo worker
#[derive(Debug, Error)]
pub enum RelayError {
    /// A worker is already relaying for this handle
    #[error("device {0} already has an active echo worker")]
    AlreadyRelaying(protocol::DeviceHandle),

    /// The OS refused to spawn the worker thread
    #[error("failed to spawn echo worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Endpoint resolution failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No bulk IN/OUT pair on the claimed interface
    #[error("no bulk pipe pair found (read: {read:?}, write: {write:?})")]
    NotFound { read: Option<u8>, write: Option<u8> },
}
