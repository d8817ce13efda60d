//! Declaration of the binding topology of every message handler.
use crate::amqp::broker::{BrokerChannel, DeliveryStream};
use crate::amqp::configuration::HandlerSettings;
use crate::trigger::{DeclareError, DeclareStep, Handler, MessageHandler};
use lapin::ExchangeKind;
use std::{collections::HashSet, sync::Arc};

/// Where a message handler consumes from: a queue bound to an exchange with a routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
}

impl From<HandlerSettings> for Binding {
    fn from(settings: HandlerSettings) -> Self {
        settings.binding()
    }
}

impl From<&HandlerSettings> for Binding {
    fn from(settings: &HandlerSettings) -> Self {
        settings.binding()
    }
}

/// A live consumer on a queue, waiting for its dispatch loop.
pub(crate) struct Subscription {
    pub(crate) queue_name: String,
    pub(crate) consumer_tag: String,
    pub(crate) deliveries: DeliveryStream,
    pub(crate) handler: Arc<dyn Handler>,
}

/// The tags used to register the consumers of the message handlers bound to `queues`, in order.
///
/// A broker does not accept two consumers with the same tag on a channel. A single handler
/// uses the configured tag. Otherwise each one gets `<tag>.<queue>`, with a numeric suffix
/// when several handlers consume from the same queue.
pub(crate) fn subscription_tags(consumer_tag: &str, queues: &[&str]) -> Vec<String> {
    if queues.len() == 1 {
        return vec![consumer_tag.to_owned()];
    }
    let mut taken = HashSet::with_capacity(queues.len());
    queues
        .iter()
        .map(|queue| {
            let mut tag = format!("{consumer_tag}.{queue}");
            let mut suffix = 1;
            while !taken.insert(tag.clone()) {
                tag = format!("{consumer_tag}.{queue}.{suffix}");
                suffix += 1;
            }
            tag
        })
        .collect()
}

/// Declare exchange, queue and binding for each message handler, in order, then start
/// consuming from its queue.
///
/// The first failure aborts the whole pass: nothing declared so far is rolled back.
#[tracing::instrument(name = "declare_bindings", skip_all, fields(n_handlers = message_handlers.len()))]
pub(crate) async fn register<Ch: BrokerChannel>(
    channel: &Ch,
    consumer_tag: &str,
    message_handlers: Vec<MessageHandler>,
) -> Result<Vec<Subscription>, DeclareError> {
    let queues: Vec<&str> = message_handlers
        .iter()
        .map(|h| h.binding.queue.as_str())
        .collect();
    let consumer_tags = subscription_tags(consumer_tag, &queues);
    let mut subscriptions = Vec::with_capacity(message_handlers.len());
    for (MessageHandler { binding, handler }, consumer_tag) in
        message_handlers.into_iter().zip(consumer_tags)
    {
        let deliveries = declare(channel, &binding, &consumer_tag).await?;
        tracing::info!(
            queue_name = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            consumer_tag = %consumer_tag,
            "Subscribed to queue"
        );
        subscriptions.push(Subscription {
            queue_name: binding.queue,
            consumer_tag,
            deliveries,
            handler,
        });
    }
    Ok(subscriptions)
}

async fn declare<Ch: BrokerChannel>(
    channel: &Ch,
    binding: &Binding,
    consumer_tag: &str,
) -> Result<DeliveryStream, DeclareError> {
    let failed = |step| {
        let queue = binding.queue.clone();
        move |source| DeclareError {
            step,
            queue,
            source,
        }
    };

    channel
        .declare_exchange(&binding.exchange, binding.exchange_kind.clone())
        .await
        .map_err(failed(DeclareStep::Exchange))?;
    channel
        .declare_queue(&binding.queue)
        .await
        .map_err(failed(DeclareStep::Queue))?;
    channel
        .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
        .await
        .map_err(failed(DeclareStep::Bind))?;
    channel
        .consume(&binding.queue, consumer_tag)
        .await
        .map_err(failed(DeclareStep::Consume))
}
