use crate::trigger::{registrar::Subscription, HandlerError, Output};
use futures_util::StreamExt;
use lapin::options::BasicAckOptions;

/// Why a dispatch loop stopped pulling messages from its queue.
#[derive(Debug)]
pub enum DispatchExit {
    /// The broker stopped pushing deliveries: the consumer was cancelled or the connection closed.
    StreamClosed,
    /// The consumer reported an error (e.g. the channel was closed by the broker).
    StreamFailed(anyhow::Error),
    /// The handler failed: the delivery it was processing has not been acknowledged.
    HandlerFailed(HandlerError),
}

/// What a dispatch loop did before exiting.
#[derive(Debug)]
pub struct DispatchReport {
    pub queue_name: String,
    pub consumer_tag: String,
    /// How many deliveries were handled successfully and acknowledged.
    pub acked: usize,
    pub exit: DispatchExit,
}

/// Process the deliveries of a single subscription, one at a time and in the order the broker
/// pushes them.
///
/// Each payload is handed over to the handler; the delivery is acked once the handler succeeds.
/// A handler failure leaves the delivery unacknowledged and ends the loop.
#[tracing::instrument(
    name = "dispatch_loop",
    skip_all,
    fields(queue_name = %subscription.queue_name, consumer_tag = %subscription.consumer_tag)
)]
pub(crate) async fn dispatch(subscription: Subscription) -> DispatchReport {
    let Subscription {
        queue_name,
        consumer_tag,
        mut deliveries,
        handler,
    } = subscription;
    let mut acked = 0;

    let exit = loop {
        let delivery = match deliveries.next().await {
            None => break DispatchExit::StreamClosed,
            Some(Err(e)) => {
                tracing::error!(error = ?e, "Consumer error");
                break DispatchExit::StreamFailed(e);
            }
            Some(Ok(delivery)) => delivery,
        };

        let output = Output {
            data: delivery.data,
        };
        tracing::debug!(
            delivery_tag = delivery.delivery_tag,
            data = ?output.data,
            "The output of the queue is"
        );

        if let Err(e) = handler.handle(output).await {
            tracing::error!(
                delivery_tag = delivery.delivery_tag,
                error = ?e.inner_error,
                "Handler failed, no more messages will be consumed from this queue"
            );
            break DispatchExit::HandlerFailed(e);
        }

        match delivery
            .acker
            .ack(BasicAckOptions { multiple: false })
            .await
        {
            Ok(()) => acked += 1,
            Err(e) => tracing::warn!(
                delivery_tag = delivery.delivery_tag,
                error = ?e,
                "Failed to ack message"
            ),
        }
    };

    tracing::info!(acked, "Dispatch loop exited");
    DispatchReport {
        queue_name,
        consumer_tag,
        acked,
        exit,
    }
}
