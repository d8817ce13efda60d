use std::fmt;

use super::TriggerState;

/// The error type returned by [`Trigger`](super::Trigger) operations.
#[derive(thiserror::Error, Debug)]
pub enum TriggerError {
    /// Failed to establish the transport session with the broker (dial, TLS, timeout).
    #[error("Failed to connect to the AMQP broker.")]
    Connection(#[source] anyhow::Error),
    /// Connected, but the broker refused to open a channel.
    #[error("Failed to open an AMQP channel.")]
    Channel(#[source] anyhow::Error),
    /// Declaring the topology of a message handler failed.
    #[error(transparent)]
    Declare(#[from] DeclareError),
    /// Failed to tear the trigger down.
    #[error(transparent)]
    Stop(#[from] StopError),
    /// The operation is not allowed in the current lifecycle state.
    #[error("Cannot {operation} a trigger in the `{state}` state.")]
    InvalidState {
        operation: &'static str,
        state: TriggerState,
    },
    /// Failed to install the SIGTERM handler.
    #[error("Failed to listen for the termination signal.")]
    Signal(#[source] std::io::Error),
}

/// Which of the declarative operations issued for a message handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareStep {
    Exchange,
    Queue,
    Bind,
    Consume,
}

impl fmt::Display for DeclareStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exchange => write!(f, "Exchange Declare"),
            Self::Queue => write!(f, "Queue Declare"),
            Self::Bind => write!(f, "Queue Bind"),
            Self::Consume => write!(f, "Queue Consume"),
        }
    }
}

/// Declaring the binding topology of a message handler failed.
///
/// Whatever was declared before the failure is left in place on the broker.
#[derive(thiserror::Error, Debug)]
#[error("{step} failed for queue `{queue}`.")]
pub struct DeclareError {
    pub step: DeclareStep,
    /// The queue of the message handler whose topology could not be declared.
    pub queue: String,
    #[source]
    pub source: anyhow::Error,
}

/// Failures reported by [`Trigger::stop`](super::Trigger::stop).
///
/// Consumer cancellation and connection close are always both attempted: when both fail,
/// both errors are reported.
#[derive(thiserror::Error, Debug)]
pub enum StopError {
    #[error("Consumer cancel failed for `{consumer_tag}`.")]
    Cancel {
        consumer_tag: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("AMQP connection close error.")]
    Close(#[source] anyhow::Error),
    #[error("Consumer cancel failed for `{consumer_tag}` and the AMQP connection could not be closed: {close}")]
    CancelAndClose {
        consumer_tag: String,
        #[source]
        cancel: anyhow::Error,
        close: anyhow::Error,
    },
}
