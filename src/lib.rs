//! `carrot-ingress` is an AMQP ingress trigger, built on top of [`lapin`],
//! to feed messages published on RabbitMQ to your own handlers.
//!
//! For each [`MessageHandler`](crate::trigger::MessageHandler) the trigger declares an exchange,
//! a queue and the binding between them, then consumes from the queue: every message is handed
//! over to the handler and acknowledged once the handler succeeds.
//!
//! [`Trigger`](crate::trigger::Trigger) is the best starting point to learn more about what
//! `carrot-ingress` provides and how to leverage it.
//!
//! ```no_run
//! use carrot_ingress::amqp::configuration::{AmqpSettings, HandlerSettings};
//! use carrot_ingress::trigger::{HandlerError, MessageHandler, Output, Trigger};
//!
//! async fn process_order(output: Output) -> Result<(), HandlerError> {
//!     println!("Received {} bytes", output.data.len());
//!     Ok(())
//! }
//!
//! # async fn example() -> Result<(), anyhow::Error> {
//! let settings = AmqpSettings {
//!     consumer_tag: "orders-ingress".into(),
//!     ..Default::default()
//! };
//! let orders = HandlerSettings {
//!     queue: "orders-q".into(),
//!     exchange: "orders".into(),
//!     binding_key: "new".into(),
//!     exchange_type: "direct".into(),
//! };
//!
//! let mut trigger = Trigger::connect(&settings).await?;
//! trigger
//!     .initialize([MessageHandler::builder(&orders).handler(process_order)])
//!     .await?;
//! trigger.run_until_sigterm().await?;
//! # Ok(())
//! # }
//! ```

pub mod amqp;
pub mod trigger;
