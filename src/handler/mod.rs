//! Consumers notified about certificates and host name bindings.

use std::sync::Arc;

use crate::cert::Certificate;

mod pem;

pub use self::pem::PemExportHandler;

/// Receives certificates as they are issued or restored from storage.
///
/// Failures are logged by the orchestrator and never affect other handlers.
#[async_trait::async_trait]
pub trait CertificateHandler: Send + Sync {
    /// A new certificate was issued and persisted.
    async fn created(
        &self,
        certificate: &Certificate,
        archive: &[u8],
        passphrase: &str,
    ) -> eyre::Result<()>;

    /// A still valid certificate was loaded from storage.
    async fn restored(
        &self,
        certificate: &Certificate,
        archive: &[u8],
        passphrase: &str,
    ) -> eyre::Result<()>;
}

/// Makes sure the managed domain is bound to this host before the authority validates it.
#[async_trait::async_trait]
pub trait HostNameHandler: Send + Sync {
    /// Must be idempotent; it is called on every evaluation.
    async fn ensure_host_name_binding(&self) -> eyre::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notification {
    Created,
    Restored,
}

pub(crate) async fn notify_certificate_handlers(
    handlers: &[Arc<dyn CertificateHandler>],
    notification: Notification,
    certificate: &Certificate,
    archive: &[u8],
    passphrase: &str,
) {
    for (idx, handler) in handlers.iter().enumerate() {
        let res = match notification {
            Notification::Created => handler.created(certificate, archive, passphrase).await,
            Notification::Restored => handler.restored(certificate, archive, passphrase).await,
        };

        if let Err(err) = res {
            log::error!("certificate handler #{idx} failed on {notification:?}: {err:?}");
        }
    }
}

pub(crate) async fn ensure_host_name_bindings(handlers: &[Arc<dyn HostNameHandler>]) {
    for (idx, handler) in handlers.iter().enumerate() {
        if let Err(err) = handler.ensure_host_name_binding().await {
            log::error!("host name handler #{idx} failed: {err:?}");
        }
    }
}
