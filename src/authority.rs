//! Certificate authority capability consumed by the orchestrator.
//!
//! [`AcmeFactory`](crate::AcmeFactory) implements it against an RFC 8555 server; tests script their
//! own.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::options::CertificateInfo;

/// Status of an order as reported by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    /// Whether the order can be finalized.
    ///
    /// A `Valid` order was already finalized with some other key, so it is not ready.
    pub fn is_ready(self) -> bool {
        self == OrderStatus::Ready
    }
}

/// An HTTP-01 challenge of an order's first authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpChallenge {
    pub token: String,

    /// Body to serve at `/.well-known/acme-challenge/<token>`.
    pub key_authorization: String,

    /// URL of the challenge resource at the authority.
    pub location: String,

    /// The authority already considers this challenge (and so the authorization) valid.
    pub already_valid: bool,
}

/// Creates authority contexts bound to an account key.
#[async_trait::async_trait]
pub trait AuthorityFactory: Send + Sync {
    /// Connects to the authority at `directory_url`.
    ///
    /// With no `account_key_pem` a fresh account key is generated; [`AuthorityContext::new_account`]
    /// must then be called before ordering.
    async fn context(
        &self,
        directory_url: &str,
        account_key_pem: Option<&str>,
    ) -> eyre::Result<Arc<dyn AuthorityContext>>;
}

/// Account-level operations against the authority.
#[async_trait::async_trait]
pub trait AuthorityContext: Send + Sync {
    /// PKCS#8 PEM encoding of the account key this context signs with.
    fn account_key_pem(&self) -> eyre::Result<Zeroizing<String>>;

    /// Registers the account key with the authority.
    async fn new_account(&self, email: &str, terms_of_service_agreed: bool) -> eyre::Result<()>;

    /// Places an order for a certificate covering `common_name`.
    async fn new_order(&self, common_name: &str) -> eyre::Result<Arc<dyn AuthorityOrder>>;
}

/// One order placed with the authority.
#[async_trait::async_trait]
pub trait AuthorityOrder: Send + Sync {
    /// Returns the HTTP-01 challenge of the first authorization.
    async fn http_challenge(&self) -> eyre::Result<HttpChallenge>;

    /// Tells the authority to start validating `challenge`. Does not wait for the outcome.
    async fn validate(&self, challenge: &HttpChallenge) -> eyre::Result<()>;

    /// Fetches the current order status.
    async fn status(&self) -> eyre::Result<OrderStatus>;

    /// Submits a CSR for `info` signed by `key` and returns the issued chain as PEM.
    async fn finalize(
        &self,
        info: &CertificateInfo,
        key: &p256::ecdsa::SigningKey,
    ) -> eyre::Result<String>;
}
