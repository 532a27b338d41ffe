//! Answers the authority's HTTP-01 validation requests.

use std::time::Duration;

use crate::orchestrator::Orchestrator;

#[cfg(feature = "actix")]
mod actix;

#[cfg(feature = "actix")]
pub use self::actix::service;

/// Path under which validators fetch challenge responses.
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

const DEFAULT_SIGNAL_DELAY: Duration = Duration::from_secs(1);

/// Extracts the challenge token from a request path.
///
/// Returns `None` for paths outside [`CHALLENGE_PATH_PREFIX`] and for empty or nested tokens.
pub fn token_from_path(path: &str) -> Option<&str> {
    let token = path.strip_prefix(CHALLENGE_PATH_PREFIX)?;

    if token.is_empty() || token.contains('/') {
        return None;
    }

    Some(token)
}

/// Serves stored key authorizations and tells the orchestrator once a challenge was fetched.
#[derive(Debug, Clone)]
pub struct ChallengeResponder {
    orchestrator: Orchestrator,
    signal_delay: Duration,
}

impl ChallengeResponder {
    pub fn new(orchestrator: Orchestrator) -> Self {
        ChallengeResponder {
            orchestrator,
            signal_delay: DEFAULT_SIGNAL_DELAY,
        }
    }

    /// Sets how long after answering a validator the completion signal is raised.
    pub fn signal_delay(mut self, delay: Duration) -> Self {
        self.signal_delay = delay;
        self
    }

    /// Looks up the key authorization for `token`.
    ///
    /// On a hit, the orchestrator's completion path is scheduled for `token`. Returns `None` for
    /// tokens with no stored challenge.
    pub async fn respond(&self, token: &str) -> eyre::Result<Option<String>> {
        let Some(record) = self.orchestrator.store().challenge(token).await? else {
            log::warn!("validation request for unknown challenge {token}");
            return Ok(None);
        };

        log::debug!("serving challenge {token}");
        self.orchestrator
            .schedule_challenge_observed(record.token, self.signal_delay);

        Ok(Some(record.key_authorization))
    }
}
