//! [`BrokerConnection`], [`BrokerChannel`] and [`Acknowledge`] on top of [`lapin`].
//!
//! [`lapin`]: https://docs.rs/crate/lapin
use crate::amqp::broker::{Acknowledge, BrokerChannel, BrokerConnection, Delivery, DeliveryStream};
use amq_protocol_types::FieldTable;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    Channel, Connection, ExchangeKind,
};

/// Reply code sent to the broker when we close the connection on purpose.
const REPLY_SUCCESS: u16 = 200;

#[async_trait::async_trait]
impl BrokerConnection for Connection {
    type Channel = Channel;

    async fn open_channel(&self) -> Result<Channel, anyhow::Error> {
        Ok(self.create_channel().await?)
    }

    async fn close_connection(&self) -> Result<(), anyhow::Error> {
        Connection::close(self, REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for Channel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), anyhow::Error> {
        self.exchange_declare(
            name,
            kind,
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), anyhow::Error> {
        self.queue_declare(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        self.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = self
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.basic_cancel(consumer_tag, BasicCancelOptions { nowait: true })
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Acknowledge for Acker {
    async fn ack(&self, options: BasicAckOptions) -> Result<(), anyhow::Error> {
        Acker::ack(self, options).await?;
        Ok(())
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange.to_string(),
            routing_key: value.routing_key.to_string(),
            redelivered: value.redelivered,
            data: value.data,
            acker: Box::new(value.acker),
        }
    }
}
