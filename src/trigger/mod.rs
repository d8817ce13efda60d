//! Consume messages from RabbitMq queues and hand them over to message handlers.
//! Check out [`Trigger`] as a starting point.
pub use dispatch::{DispatchExit, DispatchReport};
pub use error::{DeclareError, DeclareStep, StopError, TriggerError};
pub use handler::{ClosureHandler, Handler, HandlerError, MessageHandler, MessageHandlerBuilder};
pub use output::Output;
pub use registrar::Binding;

mod dispatch;
mod error;
mod handler;
mod output;
mod registrar;

use crate::amqp::{
    broker::{BrokerChannel, BrokerConnection},
    configuration::AmqpSettings,
    ConnectionFactory,
};
use futures_util::{stream::FuturesUnordered, StreamExt};
use registrar::Subscription;
use shutdown_handler::ShutdownHandler;
use std::{fmt, sync::Arc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Where a [`Trigger`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Connected, with a channel open. No topology has been declared yet.
    Uninitialized,
    /// Every message handler has its binding declared and a consumer registered.
    /// No message is being processed yet.
    Initialized,
    /// A dispatch loop is running for every message handler.
    Running,
    /// Consumers have been cancelled and the connection closed.
    Stopped,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// An AMQP ingress adapter: it declares a binding for each [`MessageHandler`] and dispatches
/// every message delivered on the bound queues to the matching handler.
///
/// # Lifecycle
///
/// 1. [`Trigger::connect`] (or [`Trigger::with_connection`]) establishes the connection and opens
///    the one channel shared by all message handlers;
/// 2. [`Trigger::initialize`] declares exchange, queue and binding for each handler and registers
///    a consumer on its queue;
/// 3. [`Trigger::start`] spawns one dispatch loop per handler;
/// 4. [`Trigger::stop`] cancels the consumers and closes the connection, which ends the loops.
///
/// [`Trigger::run_until_sigterm`] chains 3 and 4 around a termination signal.
///
/// # Failure isolation
///
/// Messages on the same queue are processed one at a time, in order. Different queues are
/// processed concurrently.
/// If a handler fails, its message is left unacknowledged and its dispatch loop exits: the other
/// handlers are not affected, but nothing restarts the failed one.
///
/// All handlers share a single channel: a protocol error triggered by one of them (e.g.
/// acknowledging twice) closes the channel for everybody.
pub struct Trigger<C: BrokerConnection = lapin::Connection> {
    connection: C,
    channel: C::Channel,
    consumer_tag: String,
    state: TriggerState,
    /// Registered consumers waiting for [`Trigger::start`].
    subscriptions: Vec<Subscription>,
    /// Tags of the consumers registered with the broker, to be cancelled on stop.
    consumer_tags: Vec<String>,
    dispatchers: Vec<JoinHandle<DispatchReport>>,
}

impl Trigger<lapin::Connection> {
    /// Connect to the broker described by `settings` and open a channel.
    pub async fn connect(settings: &AmqpSettings) -> Result<Self, TriggerError> {
        let connection = ConnectionFactory::new_from_config(settings)?
            .new_connection()
            .await?;
        Self::with_connection(connection, settings.consumer_tag.clone()).await
    }
}

impl<C: BrokerConnection> Trigger<C> {
    /// Build a trigger on top of an established connection, opening the channel that all
    /// message handlers will share.
    ///
    /// If `consumer_tag` is empty a random one is generated.
    #[tracing::instrument(name = "rabbitmq_create_channel", skip_all)]
    pub async fn with_connection(
        connection: C,
        consumer_tag: impl Into<String>,
    ) -> Result<Self, TriggerError> {
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_error) = connection.close_connection().await {
                    tracing::warn!(error = ?close_error, "Failed to close the AMQP connection");
                }
                return Err(TriggerError::Channel(e));
            }
        };

        let mut consumer_tag = consumer_tag.into();
        if consumer_tag.is_empty() {
            consumer_tag = format!("ctag-{}", Uuid::new_v4());
        }

        Ok(Self {
            connection,
            channel,
            consumer_tag,
            state: TriggerState::Uninitialized,
            subscriptions: vec![],
            consumer_tags: vec![],
            dispatchers: vec![],
        })
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// The process-wide consumer tag.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The tags of the consumers registered with the broker, one per message handler.
    pub fn consumer_tags(&self) -> &[String] {
        &self.consumer_tags
    }

    /// Declare the binding of every message handler and register a consumer on its queue.
    ///
    /// Handlers are processed in order, one at a time. The first failure aborts initialization:
    /// whatever was declared on the broker until then stays there, and the trigger remains
    /// uninitialized.
    ///
    /// `initialize` does NOT trigger consumption of messages! Check out [`Trigger::start`].
    #[tracing::instrument(name = "trigger_initialize", skip_all, fields(consumer_tag = %self.consumer_tag))]
    pub async fn initialize<I>(&mut self, message_handlers: I) -> Result<(), TriggerError>
    where
        I: IntoIterator<Item = MessageHandler>,
    {
        self.expect_state(TriggerState::Uninitialized, "initialize")?;

        let subscriptions = registrar::register(
            &self.channel,
            &self.consumer_tag,
            message_handlers.into_iter().collect(),
        )
        .await?;

        self.consumer_tags = subscriptions
            .iter()
            .map(|s| s.consumer_tag.clone())
            .collect();
        self.subscriptions = subscriptions;
        self.state = TriggerState::Initialized;
        Ok(())
    }

    /// Spawn one dispatch loop per message handler.
    ///
    /// `start` returns immediately: loops run in the background until their queue stops
    /// delivering (see [`Trigger::stop`]) or their handler fails.
    /// Use [`Trigger::join`] to wait for them.
    ///
    /// It must be called from within a `tokio` runtime.
    pub fn start(&mut self) -> Result<(), TriggerError> {
        self.expect_state(TriggerState::Initialized, "start")?;

        self.dispatchers = self
            .subscriptions
            .drain(..)
            .map(|subscription| tokio::spawn(dispatch::dispatch(subscription)))
            .collect();
        self.state = TriggerState::Running;
        tracing::info!(
            n_dispatchers = self.dispatchers.len(),
            "Trigger started"
        );
        Ok(())
    }

    /// Cancel every consumer and close the connection.
    ///
    /// Both steps are always attempted, even if cancelling fails. Dispatch loops are not waited
    /// for: their delivery streams end as the connection goes away.
    #[tracing::instrument(name = "trigger_stop", skip_all, fields(consumer_tag = %self.consumer_tag))]
    pub async fn stop(&mut self) -> Result<(), TriggerError> {
        if self.state == TriggerState::Stopped {
            return Err(TriggerError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }
        // Consumers that never got a dispatch loop go away with their streams.
        self.subscriptions.clear();

        let mut cancel_error = None;
        for consumer_tag in &self.consumer_tags {
            if let Err(e) = self.channel.cancel(consumer_tag).await {
                tracing::error!(consumer_tag = %consumer_tag, error = ?e, "Consumer cancel failed");
                if cancel_error.is_none() {
                    cancel_error = Some((consumer_tag.clone(), e));
                }
            }
        }
        let close_error = self.connection.close_connection().await.err();
        self.state = TriggerState::Stopped;

        let error = match (cancel_error, close_error) {
            (None, None) => {
                tracing::info!("Trigger stopped");
                return Ok(());
            }
            (Some((consumer_tag, source)), None) => StopError::Cancel {
                consumer_tag,
                source,
            },
            (None, Some(close)) => StopError::Close(close),
            (Some((consumer_tag, cancel)), Some(close)) => StopError::CancelAndClose {
                consumer_tag,
                cancel,
                close,
            },
        };
        Err(error.into())
    }

    /// Wait for every dispatch loop spawned by [`Trigger::start`] to exit.
    ///
    /// Loops exit once their handler fails or their delivery stream ends, usually after
    /// [`Trigger::stop`].
    pub async fn join(&mut self) -> Vec<DispatchReport> {
        let mut reports = Vec::with_capacity(self.dispatchers.len());
        for dispatcher in self.dispatchers.drain(..) {
            match dispatcher.await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(error = ?e, "Dispatch loop crashed"),
            }
        }
        reports
    }

    /// Start the trigger and run it until SIGTERM is received, then stop it.
    pub async fn run_until_sigterm(self) -> Result<Vec<DispatchReport>, TriggerError> {
        let shutdown = ShutdownHandler::sigterm().map_err(TriggerError::Signal)?;
        self.run_until_shutdown(shutdown).await
    }

    /// Start the trigger and run it until the shutdown handler fires or every dispatch loop has
    /// exited, whichever comes first. The trigger is then stopped.
    ///
    /// It returns the reports of all dispatch loops.
    #[tracing::instrument(skip_all, name = "trigger_run")]
    pub async fn run_until_shutdown(
        mut self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<Vec<DispatchReport>, TriggerError> {
        if let Err(e) = self.start() {
            // The trigger is consumed: tear it down before giving up on it.
            if self.state != TriggerState::Stopped {
                if let Err(stop_error) = self.stop().await {
                    tracing::warn!(error = ?stop_error, "Failed to stop the trigger");
                }
            }
            return Err(e);
        }

        let mut dispatchers = FuturesUnordered::from_iter(self.dispatchers.drain(..));
        let mut reports = Vec::with_capacity(dispatchers.len());

        let signal = shutdown.wait_for_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                biased;

                _ = &mut signal => {
                    tracing::info!("Trigger received shutdown event");
                    break;
                }

                dispatched = dispatchers.next() => match dispatched {
                    // Every loop has exited: there is nothing left to wait for.
                    None => break,
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(e)) => tracing::error!(error = ?e, "Dispatch loop crashed"),
                }
            }
        }

        let stopped = self.stop().await;

        while let Some(dispatched) = dispatchers.next().await {
            match dispatched {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(error = ?e, "Dispatch loop crashed"),
            }
        }

        stopped.map(|_| reports)
    }

    fn expect_state(
        &self,
        expected: TriggerState,
        operation: &'static str,
    ) -> Result<(), TriggerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TriggerError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}
