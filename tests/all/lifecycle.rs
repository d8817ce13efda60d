use crate::helpers::{orders_binding, payments_binding, FailPoint, InMemoryBroker, Operation};
use carrot_ingress::trigger::{
    DispatchExit, HandlerError, MessageHandler, Output, StopError, Trigger, TriggerError,
    TriggerState,
};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;

async fn noop(_output: Output) -> Result<(), HandlerError> {
    Ok(())
}

async fn always_fails(_output: Output) -> Result<(), HandlerError> {
    Err(HandlerError::msg("Unprocessable"))
}

fn handlers() -> Vec<MessageHandler> {
    vec![
        MessageHandler::builder(orders_binding()).handler(noop),
        MessageHandler::builder(payments_binding()).handler(noop),
    ]
}

fn teardown_operations(broker: &InMemoryBroker) -> Vec<Operation> {
    broker
        .operations()
        .into_iter()
        .filter(|o| matches!(o, Operation::Cancel { .. } | Operation::CloseConnection))
        .collect()
}

#[tokio::test]
async fn a_failure_to_open_the_channel_closes_the_connection() {
    // Arrange
    let broker = InMemoryBroker::default();
    broker.fail_on(FailPoint::OpenChannel);

    // Act
    let outcome = Trigger::with_connection(broker.connection(), "client1").await;

    // Assert
    assert!(matches!(outcome, Err(TriggerError::Channel(_))));
    assert_eq!(
        broker.operations(),
        vec![Operation::OpenChannel, Operation::CloseConnection]
    );
}

#[tokio::test]
async fn an_empty_consumer_tag_is_replaced_by_a_random_one() {
    let broker = InMemoryBroker::default();

    let trigger = Trigger::with_connection(broker.connection(), "")
        .await
        .unwrap();

    assert!(trigger.consumer_tag().starts_with("ctag-"));
    assert_eq!(trigger.state(), TriggerState::Uninitialized);
}

#[tokio::test]
async fn start_requires_an_initialized_trigger() {
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();

    let outcome = trigger.start();

    assert!(matches!(
        outcome,
        Err(TriggerError::InvalidState {
            operation: "start",
            state: TriggerState::Uninitialized
        })
    ));
}

#[tokio::test]
async fn stop_cancels_every_consumer_then_closes_the_connection() {
    // Arrange
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    trigger.initialize(handlers()).await.unwrap();
    trigger.start().unwrap();

    // Act
    trigger.stop().await.unwrap();
    let reports = trigger.join().await;

    // Assert
    assert_eq!(trigger.state(), TriggerState::Stopped);
    assert_eq!(
        teardown_operations(&broker),
        vec![
            Operation::Cancel {
                consumer_tag: "client1.orders-q".into()
            },
            Operation::Cancel {
                consumer_tag: "client1.payments-q".into()
            },
            Operation::CloseConnection,
        ]
    );
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|r| matches!(r.exit, DispatchExit::StreamClosed)));
}

#[tokio::test]
async fn an_initialized_trigger_can_be_stopped_without_starting() {
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    trigger.initialize(handlers()).await.unwrap();

    trigger.stop().await.unwrap();

    assert_eq!(trigger.state(), TriggerState::Stopped);
    assert_eq!(teardown_operations(&broker).len(), 3);
    assert!(trigger.join().await.is_empty());
}

#[tokio::test]
async fn the_connection_is_closed_even_if_cancelling_fails() {
    // Arrange
    let broker = InMemoryBroker::default();
    broker.fail_on(FailPoint::Cancel);
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    trigger.initialize(handlers()).await.unwrap();
    trigger.start().unwrap();

    // Act
    let outcome = trigger.stop().await;

    // Assert
    let Err(TriggerError::Stop(StopError::Cancel { consumer_tag, .. })) = &outcome else {
        panic!("Expected a cancel error, got {outcome:?}");
    };
    assert_eq!(consumer_tag, "client1.orders-q");
    assert_eq!(trigger.state(), TriggerState::Stopped);
    // Both consumers are still cancelled before closing.
    assert_eq!(teardown_operations(&broker).len(), 3);
    assert_eq!(
        teardown_operations(&broker).last(),
        Some(&Operation::CloseConnection)
    );
    assert_eq!(trigger.join().await.len(), 2);
}

#[tokio::test]
async fn cancel_and_close_failures_are_both_reported() {
    // Arrange
    let broker = InMemoryBroker::default();
    broker.fail_on(FailPoint::Cancel);
    broker.fail_on(FailPoint::CloseConnection);
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    trigger.initialize(handlers()).await.unwrap();

    // Act
    let outcome = trigger.stop().await;

    // Assert
    assert!(matches!(
        outcome,
        Err(TriggerError::Stop(StopError::CancelAndClose { .. }))
    ));
    assert_eq!(trigger.state(), TriggerState::Stopped);
}

#[tokio::test]
async fn a_close_failure_is_reported() {
    let broker = InMemoryBroker::default();
    broker.fail_on(FailPoint::CloseConnection);
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();

    let outcome = trigger.stop().await;

    assert!(matches!(
        outcome,
        Err(TriggerError::Stop(StopError::Close(_)))
    ));
    assert_eq!(trigger.state(), TriggerState::Stopped);
}

#[tokio::test]
async fn a_stopped_trigger_cannot_be_stopped_again() {
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    trigger.stop().await.unwrap();

    let outcome = trigger.stop().await;

    assert!(matches!(
        outcome,
        Err(TriggerError::InvalidState {
            operation: "stop",
            state: TriggerState::Stopped
        })
    ));
    // The connection is closed only once.
    assert_eq!(teardown_operations(&broker), vec![Operation::CloseConnection]);
}

#[tokio::test]
async fn run_until_shutdown_stops_the_trigger_on_signal() {
    // Arrange
    let broker = InMemoryBroker::default();
    let shutdown = Arc::new(ShutdownHandler::new());
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    trigger.initialize(handlers()).await.unwrap();
    let running = tokio::spawn(trigger.run_until_shutdown(shutdown.clone()));

    // Act
    let delivery_tag = broker.publish("orders-q", b"order-1");
    broker.wait_for_acks(1).await;
    shutdown.shutdown();
    let reports = running.await.unwrap().unwrap();

    // Assert
    assert_eq!(broker.acks()[0].delivery_tag, delivery_tag);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().map(|r| r.acked).sum::<usize>(), 1);
    assert_eq!(teardown_operations(&broker).len(), 3);
}

#[tokio::test]
async fn run_until_shutdown_returns_once_every_dispatch_loop_has_exited() {
    // Arrange
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    trigger
        .initialize([MessageHandler::builder(orders_binding()).handler(always_fails)])
        .await
        .unwrap();
    broker.publish("orders-q", b"order-1");

    // Act
    let reports = trigger
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await
        .unwrap();

    // Assert
    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0].exit, DispatchExit::HandlerFailed(_)));
    assert!(broker.acks().is_empty());
    assert_eq!(teardown_operations(&broker).len(), 2);
}

#[tokio::test]
async fn run_until_shutdown_closes_the_connection_if_the_trigger_cannot_start() {
    // Arrange
    let broker = InMemoryBroker::default();
    let trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();

    // Act
    let outcome = trigger
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await;

    // Assert
    assert!(matches!(
        outcome,
        Err(TriggerError::InvalidState {
            operation: "start",
            state: TriggerState::Uninitialized
        })
    ));
    assert_eq!(teardown_operations(&broker), vec![Operation::CloseConnection]);
}
