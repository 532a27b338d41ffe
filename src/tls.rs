//! Certificate selection for rustls servers.

use std::sync::Arc;

use eyre::eyre;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};

use crate::{cert::Certificate, orchestrator::active_certified_key};

/// Converts a certificate and its key into the form rustls signs handshakes with.
///
/// Fails when the key does not belong to the end-entity certificate.
pub fn certified_key(certificate: &Certificate) -> eyre::Result<CertifiedKey> {
    let chain = certificate
        .certificate_chain()?
        .into_iter()
        .map(CertificateDer::from)
        .collect::<Vec<_>>();

    let key = certificate.private_key_der()?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.to_vec()));

    let provider = rustls::crypto::ring::default_provider();
    CertifiedKey::from_der(chain, key, &provider)
        .map_err(|err| eyre!("certificate is not usable for TLS: {err}"))
}

/// Answers every handshake with the active certificate.
///
/// The signing key is prepared once when a certificate is published, so resolving is a single
/// atomic load.
///
/// ```no_run
/// use std::sync::Arc;
///
/// let config = rustls::ServerConfig::builder()
///     .with_no_client_auth()
///     .with_cert_resolver(Arc::new(certkeeper::ActiveCertResolver::new()));
/// # drop(config);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ActiveCertResolver {
    _priv: (),
}

impl ActiveCertResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The signing form of the active certificate, if there is one.
    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        active_certified_key()
    }
}

impl ResolvesServerCert for ActiveCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}
