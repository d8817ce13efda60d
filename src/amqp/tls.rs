//! Loading of the TLS material used for mutually authenticated connections.
use crate::amqp::configuration::{AmqpSettings, TlsPolicy};
use anyhow::Context;
use lapin::tcp::NativeTlsConnector;
use native_tls::{Certificate, Identity};
use pkcs8::{
    der::{asn1::AnyRef, pem::LineEnding, pem::PemLabel, Decode},
    AlgorithmIdentifierRef, ObjectIdentifier, PrivateKeyInfo, SecretDocument,
};
use rustls_pemfile::Item;
use sec1::EcPrivateKey;
use tracing::warn;

/// `rsaEncryption`, the algorithm of PKCS#1 keys.
const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
/// `id-ecPublicKey`, the algorithm of SEC1 keys. The curve goes in the parameters.
const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// Trust anchors and client identity for a TLS connection to RabbitMq.
///
/// Under [`TlsPolicy::BestEffort`] either of them can be missing.
pub(crate) struct TlsMaterial {
    pub(crate) root_certificates: Vec<Certificate>,
    pub(crate) identity: Option<Identity>,
}

impl TlsMaterial {
    /// Load the CA bundle and the client certificate/key pair referenced by `settings`.
    ///
    /// It returns `None` if no certificate/key pair has been configured: the connection will be
    /// established according to the uri scheme alone.
    pub(crate) fn load(settings: &AmqpSettings) -> Result<Option<Self>, anyhow::Error> {
        let Some((cert_path, key_path)) = settings.client_certificate() else {
            return Ok(None);
        };
        let policy = settings.tls_policy;

        let root_certificates = match settings.ca_bundle() {
            Some(ca_path) => tolerate(policy, "CA bundle", read_ca_bundle(ca_path))?,
            None => None,
        };
        let identity = tolerate(
            policy,
            "client certificate",
            read_identity(cert_path, key_path),
        )?;

        Ok(Some(Self {
            root_certificates: root_certificates.unwrap_or_default(),
            identity,
        }))
    }

    /// Build the connector.
    ///
    /// When a CA bundle has been loaded it is the only trust anchor: the system roots are
    /// disabled.
    pub(crate) fn connector(self) -> Result<NativeTlsConnector, anyhow::Error> {
        let mut builder = NativeTlsConnector::builder();
        if !self.root_certificates.is_empty() {
            builder.disable_built_in_roots(true);
        }
        for certificate in self.root_certificates {
            builder.add_root_certificate(certificate);
        }
        if let Some(identity) = self.identity {
            builder.identity(identity);
        }
        builder
            .build()
            .context("Failed to build the TLS connector for RabbitMQ.")
    }
}

/// Every certificate in the PEM bundle at `path`.
fn read_ca_bundle(path: &str) -> Result<Vec<Certificate>, anyhow::Error> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read the CA bundle at `{path}`."))?;
    let certificates = Certificate::stack_from_pem(&pem)
        .with_context(|| format!("Failed to decode the PEM CA bundle at `{path}`."))?;
    if certificates.is_empty() {
        anyhow::bail!("No certificate found in the CA bundle at `{path}`.");
    }
    Ok(certificates)
}

fn read_identity(cert_path: &str, key_path: &str) -> Result<Identity, anyhow::Error> {
    let cert = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read the client certificate at `{cert_path}`."))?;
    let key = std::fs::read(key_path)
        .with_context(|| format!("Failed to read the client key at `{key_path}`."))?;
    let key = pkcs8_pem(&key)
        .with_context(|| format!("Failed to decode the client key at `{key_path}`."))?;
    Identity::from_pkcs8(&cert, &key).context("Failed to load the client certificate/key pair.")
}

/// Re-encode the first private key found in `key_pem` as a PKCS#8 PEM document.
///
/// PKCS#8, PKCS#1 (`RSA PRIVATE KEY`) and SEC1 (`EC PRIVATE KEY`) keys are accepted.
fn pkcs8_pem(key_pem: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let items = rustls_pemfile::read_all(&mut &key_pem[..])
        .map_err(|e| anyhow::anyhow!("Invalid PEM: {e}"))?;
    for item in items {
        match item {
            Item::PKCS8Key(_) => return Ok(key_pem.to_vec()),
            Item::RSAKey(der) => {
                let algorithm = AlgorithmIdentifierRef {
                    oid: RSA_ENCRYPTION,
                    parameters: Some(AnyRef::NULL),
                };
                return pkcs8_document(algorithm, &der);
            }
            Item::ECKey(der) => {
                let curve = EcPrivateKey::from_der(&der)
                    .map_err(|e| anyhow::anyhow!("Invalid SEC1 key: {e}"))?
                    .parameters
                    .and_then(|p| p.named_curve())
                    .context("The SEC1 key does not name its curve.")?;
                let algorithm = AlgorithmIdentifierRef {
                    oid: ID_EC_PUBLIC_KEY,
                    parameters: Some(AnyRef::from(&curve)),
                };
                return pkcs8_document(algorithm, &der);
            }
            _ => {}
        }
    }
    anyhow::bail!("No private key found.")
}

fn pkcs8_document(
    algorithm: AlgorithmIdentifierRef<'_>,
    private_key: &[u8],
) -> Result<Vec<u8>, anyhow::Error> {
    let document = SecretDocument::try_from(PrivateKeyInfo::new(algorithm, private_key))
        .map_err(|e| anyhow::anyhow!("Failed to encode the key as PKCS#8: {e}"))?;
    let pem = document
        .to_pem(PrivateKeyInfo::PEM_LABEL, LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("Failed to encode the key as PKCS#8: {e}"))?;
    Ok(pem.as_bytes().to_vec())
}

fn tolerate<T>(
    policy: TlsPolicy,
    what: &'static str,
    loaded: Result<T, anyhow::Error>,
) -> Result<Option<T>, anyhow::Error> {
    match loaded {
        Ok(value) => Ok(Some(value)),
        Err(e) if policy == TlsPolicy::BestEffort => {
            warn!(error = ?e, "Proceeding without the {} for RabbitMQ TLS.", what);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
