//! The one process-wide slot: which orchestrator is live, and its active certificate.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::{cert::Certificate, error::SetupError};

struct Registry {
    next_id: AtomicU64,

    /// ID of the live orchestrator, 0 when there is none.
    owner: Mutex<u64>,

    certificate: ArcSwapOption<Certificate>,

    /// Signing form of `certificate`, built on publish.
    #[cfg(feature = "rustls")]
    certified_key: ArcSwapOption<rustls::sign::CertifiedKey>,
}

static REGISTRY: Registry = Registry {
    next_id: AtomicU64::new(1),
    owner: parking_lot::const_mutex(0),
    certificate: ArcSwapOption::const_empty(),
    #[cfg(feature = "rustls")]
    certified_key: ArcSwapOption::const_empty(),
};

/// Claims the slot for a new orchestrator and returns its ID.
pub(super) fn claim() -> Result<u64, SetupError> {
    let mut owner = REGISTRY.owner.lock();

    if *owner != 0 {
        return Err(SetupError::InvalidState(
            "an orchestrator is already live in this process".to_owned(),
        ));
    }

    let id = REGISTRY.next_id.fetch_add(1, Ordering::Relaxed);
    *owner = id;
    Ok(id)
}

/// Frees the slot if `id` still holds it.
pub(super) fn release(id: u64) {
    let mut owner = REGISTRY.owner.lock();

    if *owner == id {
        *owner = 0;
        clear_active();
    }
}

fn clear_active() {
    REGISTRY.certificate.store(None);

    #[cfg(feature = "rustls")]
    REGISTRY.certified_key.store(None);
}

/// Makes `certificate` the active certificate if `id` holds the slot.
pub(super) fn publish(id: u64, certificate: Arc<Certificate>) -> bool {
    let owner = REGISTRY.owner.lock();

    if *owner != id {
        return false;
    }

    #[cfg(feature = "rustls")]
    {
        let certified_key = match crate::tls::certified_key(&certificate) {
            Ok(certified_key) => Some(Arc::new(certified_key)),
            Err(err) => {
                log::warn!("active certificate cannot be served by rustls: {err}");
                None
            }
        };
        REGISTRY.certified_key.store(certified_key);
    }

    REGISTRY.certificate.store(Some(certificate));
    true
}

/// The certificate most recently validated or issued by the live orchestrator.
///
/// Lock-free; suitable for calling from a TLS handshake certificate selector.
pub fn active_certificate() -> Option<Arc<Certificate>> {
    REGISTRY.certificate.load_full()
}

/// Signing form of [`active_certificate`] for rustls.
#[cfg(feature = "rustls")]
pub fn active_certified_key() -> Option<Arc<rustls::sign::CertifiedKey>> {
    REGISTRY.certified_key.load_full()
}

#[cfg(test)]
pub(crate) fn reset() {
    let mut owner = REGISTRY.owner.lock();
    *owner = 0;
    clear_active();
}
