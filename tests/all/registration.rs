use crate::helpers::{orders_binding, payments_binding, FailPoint, InMemoryBroker, Operation};
use carrot_ingress::amqp::ExchangeKind;
use carrot_ingress::trigger::{
    Binding, DeclareStep, HandlerError, MessageHandler, Output, Trigger, TriggerError,
    TriggerState,
};

async fn noop(_output: Output) -> Result<(), HandlerError> {
    Ok(())
}

#[tokio::test]
async fn each_handler_declares_exchange_queue_and_binding_before_consuming() {
    // Arrange
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();

    // Act
    trigger
        .initialize([
            MessageHandler::builder(orders_binding()).handler(noop),
            MessageHandler::builder(payments_binding()).handler(noop),
        ])
        .await
        .unwrap();

    // Assert
    assert_eq!(trigger.state(), TriggerState::Initialized);
    assert_eq!(
        broker.operations(),
        vec![
            Operation::OpenChannel,
            Operation::DeclareExchange {
                name: "orders".into(),
                kind: ExchangeKind::Direct,
            },
            Operation::DeclareQueue {
                name: "orders-q".into()
            },
            Operation::BindQueue {
                queue: "orders-q".into(),
                exchange: "orders".into(),
                routing_key: "new".into(),
            },
            Operation::Consume {
                queue: "orders-q".into(),
                consumer_tag: "client1.orders-q".into(),
            },
            Operation::DeclareExchange {
                name: "payments".into(),
                kind: ExchangeKind::Topic,
            },
            Operation::DeclareQueue {
                name: "payments-q".into()
            },
            Operation::BindQueue {
                queue: "payments-q".into(),
                exchange: "payments".into(),
                routing_key: "payment.*".into(),
            },
            Operation::Consume {
                queue: "payments-q".into(),
                consumer_tag: "client1.payments-q".into(),
            },
        ]
    );
    assert_eq!(
        trigger.consumer_tags(),
        ["client1.orders-q".to_owned(), "client1.payments-q".to_owned()]
    );
}

#[tokio::test]
async fn a_single_handler_consumes_with_the_configured_tag() {
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();

    trigger
        .initialize([MessageHandler::builder(orders_binding()).handler(noop)])
        .await
        .unwrap();

    assert_eq!(trigger.consumer_tags(), ["client1".to_owned()]);
}

#[tokio::test]
async fn a_failed_exchange_declaration_stops_initialization() {
    // Arrange
    let broker = InMemoryBroker::default();
    broker.fail_on(FailPoint::DeclareExchange("orders".into()));
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();

    // Act
    let outcome = trigger
        .initialize([
            MessageHandler::builder(orders_binding()).handler(noop),
            MessageHandler::builder(payments_binding()).handler(noop),
        ])
        .await;

    // Assert
    let Err(TriggerError::Declare(e)) = &outcome else {
        panic!("Expected a declare error, got {outcome:?}");
    };
    assert_eq!(e.step, DeclareStep::Exchange);
    assert_eq!(e.queue, "orders-q");
    assert_eq!(trigger.state(), TriggerState::Uninitialized);
    // Neither the queue nor the binding of `orders-q` are attempted, nor anything for `payments-q`.
    assert_eq!(
        broker.operations(),
        vec![
            Operation::OpenChannel,
            Operation::DeclareExchange {
                name: "orders".into(),
                kind: ExchangeKind::Direct,
            },
        ]
    );
}

#[tokio::test]
async fn declare_errors_identify_the_failing_step() {
    for (fail_point, step) in [
        (FailPoint::DeclareQueue("payments-q".into()), DeclareStep::Queue),
        (FailPoint::BindQueue("payments-q".into()), DeclareStep::Bind),
        (FailPoint::Consume("payments-q".into()), DeclareStep::Consume),
    ] {
        // Arrange
        let broker = InMemoryBroker::default();
        broker.fail_on(fail_point);
        let mut trigger = Trigger::with_connection(broker.connection(), "client1")
            .await
            .unwrap();

        // Act
        let outcome = trigger
            .initialize([
                MessageHandler::builder(orders_binding()).handler(noop),
                MessageHandler::builder(payments_binding()).handler(noop),
            ])
            .await;

        // Assert
        let Err(TriggerError::Declare(e)) = &outcome else {
            panic!("Expected a declare error, got {outcome:?}");
        };
        assert_eq!(e.step, step);
        assert_eq!(e.queue, "payments-q");
        // Whatever was declared for `orders-q` stays in place.
        assert!(broker.operations().contains(&Operation::Consume {
            queue: "orders-q".into(),
            consumer_tag: "client1.orders-q".into(),
        }));
    }
}

#[tokio::test]
async fn initializing_twice_is_rejected() {
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    trigger
        .initialize([MessageHandler::builder(orders_binding()).handler(noop)])
        .await
        .unwrap();

    let outcome = trigger
        .initialize([MessageHandler::builder(payments_binding()).handler(noop)])
        .await;

    assert!(matches!(
        outcome,
        Err(TriggerError::InvalidState {
            operation: "initialize",
            state: TriggerState::Initialized
        })
    ));
}

#[tokio::test]
async fn handlers_sharing_a_queue_consume_with_distinct_tags() {
    // Arrange
    let broker = InMemoryBroker::default();
    let mut trigger = Trigger::with_connection(broker.connection(), "client1")
        .await
        .unwrap();
    let cancelled = Binding {
        routing_key: "cancelled".into(),
        ..orders_binding()
    };

    // Act
    trigger
        .initialize([
            MessageHandler::builder(orders_binding()).handler(noop),
            MessageHandler::builder(cancelled).handler(noop),
        ])
        .await
        .unwrap();

    // Assert
    assert_eq!(
        trigger.consumer_tags(),
        ["client1.orders-q".to_owned(), "client1.orders-q.1".to_owned()]
    );
    assert!(broker.operations().contains(&Operation::BindQueue {
        queue: "orders-q".into(),
        exchange: "orders".into(),
        routing_key: "cancelled".into(),
    }));
}
