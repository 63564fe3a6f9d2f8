//! Establishing the encrypted session on top of a raw stream.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Turns a freshly connected (or accepted) raw stream into the session the event loop runs on.
///
/// Handshakes are run by the reactor, bounded by the configured I/O timeout.
#[async_trait]
pub trait SessionHandshake<S: Send + 'static>: Send + Sync + 'static {
    type Session: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn handshake(&self, raw: S) -> Result<Self::Session, TransportError>;
}

/// Where a client finds the trust anchors for verifying the server, and which name it expects
///  the server's certificate to carry.
#[derive(Clone, Debug)]
pub struct TlsClientSettings {
    pub ca_cert_path: PathBuf,
    pub server_name: String,
}

#[derive(Clone, Debug)]
pub struct TlsServerSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Reads all PEM encoded certificates from a file
pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("opening certificate file {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificate file {:?}", path))?;

    if certs.is_empty() {
        bail!("no certificates in {:?}", path);
    }
    Ok(certs)
}

/// Reads the first PEM encoded private key from a file
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("opening private key file {:?}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parsing private key file {:?}", path))?
        .ok_or_else(|| anyhow!("no private key in {:?}", path))
}

/// Client side TLS: verifies the server certificate against the configured trust anchors and
///  the expected server name.
pub struct TlsClientHandshake {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClientHandshake {
    pub fn new(trust_anchors: Vec<CertificateDer<'static>>, server_name: &str) -> anyhow::Result<TlsClientHandshake> {
        let mut roots = RootCertStore::empty();
        for cert in trust_anchors {
            roots.add(cert)?;
        }

        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsClientHandshake {
            connector: TlsConnector::from(Arc::new(config)),
            server_name: ServerName::try_from(server_name.to_string())
                .with_context(|| format!("invalid server name {}", server_name))?,
        })
    }

    pub fn from_settings(settings: &TlsClientSettings) -> anyhow::Result<TlsClientHandshake> {
        Self::new(load_certs(&settings.ca_cert_path)?, &settings.server_name)
    }
}

#[async_trait]
impl <S> SessionHandshake<S> for TlsClientHandshake
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    type Session = tokio_rustls::client::TlsStream<S>;

    async fn handshake(&self, raw: S) -> Result<Self::Session, TransportError> {
        debug!("starting TLS handshake with {:?}", self.server_name);
        self.connector.connect(self.server_name.clone(), raw).await
            .map_err(|e| TransportError::Handshake(e.to_string()))
    }
}

/// Server side TLS with a single certificate chain. Clients are not asked for certificates:
///  they authenticate inside the session.
pub struct TlsServerHandshake {
    acceptor: TlsAcceptor,
}

impl TlsServerHandshake {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<TlsServerHandshake> {
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;

        Ok(TlsServerHandshake {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub fn from_settings(settings: &TlsServerSettings) -> anyhow::Result<TlsServerHandshake> {
        Self::new(load_certs(&settings.cert_path)?, load_private_key(&settings.key_path)?)
    }
}

#[async_trait]
impl <S> SessionHandshake<S> for TlsServerHandshake
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    type Session = tokio_rustls::server::TlsStream<S>;

    async fn handshake(&self, raw: S) -> Result<Self::Session, TransportError> {
        debug!("starting TLS handshake");
        self.acceptor.accept(raw).await
            .map_err(|e| TransportError::Handshake(e.to_string()))
    }
}

/// Runs the event loop on the raw stream. Only for tests and trusted local setups: everything
///  goes over the wire in plain text.
pub struct NoEncryption;

#[async_trait]
impl <S> SessionHandshake<S> for NoEncryption
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    type Session = S;

    async fn handshake(&self, raw: S) -> Result<S, TransportError> {
        warn!("connection is not encrypted");
        Ok(raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::CertifiedKey;
    use rustls::pki_types::PrivatePkcs8KeyDer;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub(crate) fn self_signed(name: &str) -> CertifiedKey {
        rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap()
    }

    pub(crate) fn tls_pair(cert_name: &str, expected_name: &str) -> (TlsClientHandshake, TlsServerHandshake) {
        let certified = self_signed(cert_name);
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let client = TlsClientHandshake::new(vec![certified.cert.der().clone()], expected_name).unwrap();
        let server = TlsServerHandshake::new(vec![certified.cert.der().clone()], key).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (client, server) = tls_pair("localhost", "localhost");
        let (client_raw, server_raw) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            let mut session = server.handshake(server_raw).await.unwrap();
            let mut buf = [0u8; 5];
            session.read_exact(&mut buf).await.unwrap();
            session.write_all(&buf).await.unwrap();
            session.flush().await.unwrap();
        });

        let mut session = client.handshake(client_raw).await.unwrap();
        session.write_all(b"hello").await.unwrap();
        session.flush().await.unwrap();

        let mut buf = [0u8; 5];
        session.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_wrong_server_name() {
        let (client, server) = tls_pair("localhost", "other.example.com");
        let (client_raw, server_raw) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            server.handshake(server_raw).await.is_err()
        });

        assert!(matches!(client.handshake(client_raw).await, Err(TransportError::Handshake(_))));
        assert!(server_task.await.unwrap());
    }

    #[test]
    fn test_load_from_files() {
        let certified = self_signed("localhost");

        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(certified.cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(certified.key_pair.serialize_pem().as_bytes()).unwrap();

        let certs = load_certs(cert_file.path()).unwrap();
        assert_eq!(certs, vec![certified.cert.der().clone()]);
        assert!(load_private_key(key_file.path()).is_ok());

        let settings = TlsServerSettings {
            cert_path: cert_file.path().to_path_buf(),
            key_path: key_file.path().to_path_buf(),
        };
        assert!(TlsServerHandshake::from_settings(&settings).is_ok());
    }

    #[test]
    fn test_load_missing_or_empty() {
        assert!(load_certs(Path::new("/does/not/exist.pem")).is_err());

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(load_certs(empty.path()).is_err());
        assert!(load_private_key(empty.path()).is_err());
    }
}
