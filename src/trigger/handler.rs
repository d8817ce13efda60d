//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::trigger::{Binding, Output};
use std::{fmt, future::Future, sync::Arc};

/// Implementers of the `Handler` trait are invoked by the [`Trigger`] for every message
/// delivered on the queue of their [`MessageHandler`].
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The trigger takes care of acking the message once `handle` returns `Ok`.
/// If `handle` returns an error the message is left unacknowledged and the trigger stops
/// consuming from that queue: the other message handlers keep going.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be relying
/// on [`ClosureHandler`], our implementation of `Handler` for async functions that have a
/// matching signature - `Fn(Output) -> Fut`.
///
/// [`Trigger`]: crate::trigger::Trigger
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, output: Output) -> Result<(), HandlerError>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
///
/// E.g. Box<dyn Handler>.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, output: Output) -> Result<(), HandlerError> {
        H::handle(self, output).await
    }
}

/// Wrapper type to turn an async function into a [`Handler`].
///
/// We do not require the function to return a [`HandlerError`] directly - it is enough for it
/// to return an error type that can be converted into [`HandlerError`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, Err> Handler for ClosureHandler<F>
where
    F: Fn(Output) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Err>> + Send + 'static,
    Err: Into<HandlerError> + Send + 'static,
{
    async fn handle(&self, output: Output) -> Result<(), HandlerError> {
        (self.0)(output).await.map_err(Into::into)
    }
}

/// The error type returned by message handlers.
///
/// Any error implementing [`std::error::Error`] converts into a `HandlerError` via `?`.
/// Use [`HandlerError::new`] for `anyhow` errors.
pub struct HandlerError {
    /// The underlying error returned by the message handler.
    pub inner_error: anyhow::Error,
}

impl HandlerError {
    pub fn new(inner_error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: inner_error.into(),
        }
    }

    /// A handler error carrying nothing but a message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self {
            inner_error: anyhow::Error::msg(message),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self::new(e)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner_error, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handling of a message failed: {}", self.inner_error)
    }
}

/// A handler bound to the queue it consumes from.
///
/// Use [`MessageHandler::builder`] to pair a [`Binding`] with a [`Handler`].
#[derive(Clone)]
pub struct MessageHandler {
    pub(crate) binding: Binding,
    pub(crate) handler: Arc<dyn Handler>,
}

impl MessageHandler {
    /// Start building a [`MessageHandler`].
    ///
    /// You need to provide the topology the handler consumes from.
    pub fn builder(binding: impl Into<Binding>) -> MessageHandlerBuilder {
        MessageHandlerBuilder {
            binding: binding.into(),
        }
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }
}

/// A builder to compose a [`MessageHandler`].
///
/// Use [`MessageHandler::builder`] as entrypoint.
pub struct MessageHandlerBuilder {
    binding: Binding,
}

impl MessageHandlerBuilder {
    /// Finalise the builder with the handler in charge of processing messages.
    ///
    /// Any async function of the form `async fn(Output) -> Result<(), E>` works, as long as
    /// `E` converts into a [`HandlerError`].
    pub fn handler<F, Fut, Err>(self, handler: F) -> MessageHandler
    where
        F: Fn(Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Err>> + Send + 'static,
        Err: Into<HandlerError> + Send + 'static,
    {
        self.dyn_handler(Arc::new(ClosureHandler(handler)))
    }

    /// Finalise the builder with a handler that is already behind an `Arc`.
    ///
    /// Useful to share the same handler across multiple queues.
    pub fn dyn_handler(self, handler: Arc<dyn Handler>) -> MessageHandler {
        MessageHandler {
            binding: self.binding,
            handler,
        }
    }
}
