//! The broker primitives the trigger relies on.
//!
//! The trigger never talks to `lapin` directly: it goes through [`BrokerConnection`],
//! [`BrokerChannel`] and [`Acknowledge`]. The `lapin` implementations live in
//! [`transport`](super::transport).
use amq_protocol_types::DeliveryTag;
use futures_util::stream::BoxStream;
use lapin::{options::BasicAckOptions, ExchangeKind};

/// A stream of deliveries pushed by the broker for a single consumer.
///
/// The stream ends when the consumer is cancelled or the connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// An authenticated transport session with the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// Close the connection. Every channel, and therefore every consumer, goes with it.
    async fn close_connection(&self) -> Result<(), anyhow::Error>;
}

/// A protocol session used to declare topology, consume and cancel consumers.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare a durable, non auto-deleted, non internal exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind)
        -> Result<(), anyhow::Error>;

    /// Declare a durable, non auto-deleted, non exclusive queue.
    async fn declare_queue(&self, name: &str) -> Result<(), anyhow::Error>;

    /// Bind `queue` to `exchange` using `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    /// Start consuming from `queue` with manual acknowledgements.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, anyhow::Error>;

    /// Cancel the consumer registered under `consumer_tag`, without waiting for the broker to
    /// confirm.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;
}

/// Settles a delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    async fn ack(&self, options: BasicAckOptions) -> Result<(), anyhow::Error>;
}

/// A message received from the broker.
pub struct Delivery {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,
    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: String,
    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: String,
    /// Whether this message was redelivered
    pub redelivered: bool,
    /// The payload of the message in binary format.
    pub data: Vec<u8>,
    // Only the dispatch loop settles deliveries: handlers never see the acker.
    pub(crate) acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Build a delivery out of its parts.
    ///
    /// Useful to plug a different broker client behind [`BrokerChannel::consume`].
    pub fn new(
        delivery_tag: DeliveryTag,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        data: Vec<u8>,
        acker: impl Acknowledge,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            data,
            acker: Box::new(acker),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("data_len", &self.data.len())
            .finish()
    }
}
