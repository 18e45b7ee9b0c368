use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;
use crate::error::{TransportError, TransportErrorKind};

#[derive(Debug, Clone)]
pub enum TransportSecurity {
    /// unencrypted TCP, e.g. for local emulators
    Plaintext,
    Tls(Arc<ClientConfig>),
}

impl TransportSecurity {
    /// TLS with the given trust anchors, using the ring crypto provider
    pub fn tls_with_roots(roots: RootCertStore) -> anyhow::Result<TransportSecurity> {
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TransportSecurity::Tls(Arc::new(config)))
    }
}

pub async fn negotiate_tls<S>(stream: S, host: &str, config: Arc<ClientConfig>) -> Result<TlsStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::new(TransportErrorKind::SslNegotiationFailed, format!("invalid server name {:?}: {}", host, e)))?;

    let stream = TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::new(TransportErrorKind::SslNegotiationFailed, e.to_string()))?;

    debug!("TLS negotiated with {}", host);
    Ok(stream)
}
