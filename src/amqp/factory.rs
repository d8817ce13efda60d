use crate::amqp::{configuration::AmqpSettings, tls::TlsMaterial};
use crate::trigger::TriggerError;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection follows the uri scheme.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// If a client certificate and key are configured, the CA bundle and the certificate/key
    /// pair are loaded here, according to the configured [`TlsPolicy`].
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    ///
    /// [`TlsPolicy`]: crate::amqp::configuration::TlsPolicy
    pub fn new_from_config(settings: &AmqpSettings) -> Result<Self, TriggerError> {
        let uri: AMQPUri = settings
            .amqp_uri
            .expose_secret()
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("Failed to parse the RabbitMQ uri.")
            .map_err(TriggerError::Connection)?;

        let tls = TlsMaterial::load(settings)
            .and_then(|material| material.map(TlsMaterial::connector).transpose())
            .map_err(TriggerError::Connection)?
            .map(|connector| {
                Arc::new(Tls {
                    connector,
                    domain_name: settings
                        .domain
                        .clone()
                        .unwrap_or_else(|| uri.authority.host.clone()),
                })
            });

        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Ok(Self {
            uri,
            connection_timeout,
            tls,
        })
    }

    /// `true` if connections will perform a TLS handshake with client authentication material.
    pub fn uses_client_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection with our own TLS connector if `self.tls` is `Some`.
    /// It dials the uri as it is otherwise.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, TriggerError> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .map_err(|_| {
            TriggerError::Connection(anyhow::anyhow!(
                "Timed out while trying to connect to RabbitMQ."
            ))
        })?
        .context("Failed to connect to RabbitMQ.")
        .map_err(TriggerError::Connection)?;
        // Register a callback to log connection errors.
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        Ok(connection)
    }

    /// Establish a new connection to a RabbitMq broker, as the uri dictates.
    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake presenting our client certificate
                    // and checking the server certificate against the expected domain
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}
