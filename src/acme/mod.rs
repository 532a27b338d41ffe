//! RFC 8555 implementation of the authority capability.
//!
//! Covers exactly the subset the orchestrator needs: account registration (or lookup of an existing
//! account by key), single-domain orders, HTTP-01 challenges, finalization and certificate download.

use std::{sync::Arc, time::Duration};

use base64::prelude::*;
use der::Encode as _;
use eyre::{bail, eyre, WrapErr as _};
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _, LineEnding};
use zeroize::Zeroizing;

use crate::{
    authority::{AuthorityContext, AuthorityFactory, AuthorityOrder, HttpChallenge, OrderStatus},
    cert::{create_csr, create_p256_key},
    options::CertificateInfo,
};

mod api;
mod jws;
mod transport;

pub use self::api::Problem;
use self::transport::{expect_header, fetch_directory, Transport};

const DEFAULT_FINALIZE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls of a `processing` order before giving up on the certificate.
const FINALIZE_MAX_POLLS: usize = 120;

/// Creates [`AuthorityContext`]s that talk to an ACME server over HTTPS.
#[derive(Debug, Clone)]
pub struct AcmeFactory {
    client: reqwest::Client,
    finalize_poll_interval: Duration,
}

impl AcmeFactory {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Uses the given HTTP client, e.g. one with custom timeouts or root certificates.
    pub fn with_client(client: reqwest::Client) -> Self {
        AcmeFactory {
            client,
            finalize_poll_interval: DEFAULT_FINALIZE_POLL_INTERVAL,
        }
    }

    /// Sets the delay between order polls while a certificate is being issued.
    pub fn finalize_poll_interval(mut self, interval: Duration) -> Self {
        self.finalize_poll_interval = interval;
        self
    }
}

impl Default for AcmeFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuthorityFactory for AcmeFactory {
    async fn context(
        &self,
        directory_url: &str,
        account_key_pem: Option<&str>,
    ) -> eyre::Result<Arc<dyn AuthorityContext>> {
        let signing_key = match account_key_pem {
            Some(pem) => p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
                .map_err(|err| eyre!("failed to read account key: {err}"))?,
            None => create_p256_key(),
        };

        let directory = fetch_directory(&self.client, directory_url).await?;

        if let Some(tos) = directory.meta.as_ref().and_then(|meta| meta.terms_of_service.as_deref())
        {
            log::debug!("terms of service: {tos}");
        }

        let transport = Transport::new(self.client.clone(), signing_key, &directory);

        Ok(Arc::new(AcmeContext {
            transport: Arc::new(transport),
            new_order_url: directory.new_order,
            finalize_poll_interval: self.finalize_poll_interval,
        }))
    }
}

struct AcmeContext {
    transport: Arc<Transport>,
    new_order_url: String,
    finalize_poll_interval: Duration,
}

#[async_trait::async_trait]
impl AuthorityContext for AcmeContext {
    fn account_key_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.transport
            .signing_key()
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| eyre!("failed to encode account key: {err}"))
    }

    async fn new_account(&self, email: &str, terms_of_service_agreed: bool) -> eyre::Result<()> {
        let acc = api::NewAccount {
            contact: Some(vec![format!("mailto:{email}")]),
            terms_of_service_agreed: Some(terms_of_service_agreed),
            only_return_existing: None,
        };

        self.transport
            .register(&acc)
            .await
            .wrap_err("account registration failed")?;

        log::info!("registered ACME account for {email}");
        Ok(())
    }

    async fn new_order(&self, common_name: &str) -> eyre::Result<Arc<dyn AuthorityOrder>> {
        let order = api::NewOrder {
            identifiers: vec![api::Identifier::dns(common_name)],
        };

        let res = self.transport.call(&self.new_order_url, &order).await?;
        let url = expect_header(res.headers(), "location")?;
        let api_order = res.json::<api::Order>().await.wrap_err("malformed order")?;

        log::debug!("created order {url} for {common_name}");

        Ok(Arc::new(AcmeOrder {
            transport: Arc::clone(&self.transport),
            url,
            authorizations: api_order.authorizations,
            poll_interval: self.finalize_poll_interval,
        }))
    }
}

struct AcmeOrder {
    transport: Arc<Transport>,
    url: String,
    authorizations: Vec<String>,
    poll_interval: Duration,
}

impl AcmeOrder {
    /// Refreshes the order (POST-as-GET against the order URL).
    async fn refresh(&self) -> eyre::Result<api::Order> {
        let res = self.transport.post_as_get(&self.url).await?;
        res.json().await.wrap_err("malformed order")
    }
}

#[async_trait::async_trait]
impl AuthorityOrder for AcmeOrder {
    async fn http_challenge(&self) -> eyre::Result<HttpChallenge> {
        let auth_url = self
            .authorizations
            .first()
            .ok_or_else(|| eyre!("order has no authorizations"))?;

        let res = self.transport.post_as_get(auth_url).await?;
        let auth = res
            .json::<api::Authorization>()
            .await
            .wrap_err("malformed authorization")?;

        let challenge = auth
            .http_challenge()
            .ok_or_else(|| eyre!("no http-01 challenge offered for {}", auth.identifier.value))?;

        let key_authorization =
            jws::key_authorization(&challenge.token, self.transport.signing_key())?;

        Ok(HttpChallenge {
            token: challenge.token.clone(),
            key_authorization,
            location: challenge.url.clone(),
            already_valid: auth.status == api::AuthorizationStatus::Valid
                || challenge.status == api::ChallengeStatus::Valid,
        })
    }

    async fn validate(&self, challenge: &HttpChallenge) -> eyre::Result<()> {
        self.transport
            .call(&challenge.location, &api::EmptyObject)
            .await
            .wrap_err("failed to trigger challenge validation")?;
        Ok(())
    }

    async fn status(&self) -> eyre::Result<OrderStatus> {
        let order = self.refresh().await?;

        if let Some(problem) = &order.error {
            log::debug!("order {} reports: {problem}", self.url);
        }

        Ok(order.status.into())
    }

    async fn finalize(
        &self,
        info: &CertificateInfo,
        key: &p256::ecdsa::SigningKey,
    ) -> eyre::Result<String> {
        let order = self.refresh().await?;
        if order.status != api::ApiOrderStatus::Ready {
            bail!("order cannot be finalized in status {:?}", order.status);
        }

        // this is not the same as PEM
        let csr = create_csr(key, info)?;
        let csr = BASE64_URL_SAFE_NO_PAD.encode(csr.to_der()?);

        // if the CSR is invalid, we will get a 4xx code back
        self.transport
            .call(&order.finalize, &api::Finalize { csr })
            .await
            .wrap_err("finalize request failed")?;

        let mut polls = 0;
        let order = loop {
            let order = self.refresh().await?;

            match order.status {
                api::ApiOrderStatus::Valid => break order,
                api::ApiOrderStatus::Invalid => match &order.error {
                    Some(problem) => bail!("order became invalid: {problem}"),
                    None => bail!("order became invalid"),
                },
                _ if polls >= FINALIZE_MAX_POLLS => {
                    bail!("gave up waiting for order {} to be issued", self.url)
                }
                _ => {
                    polls += 1;
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        };

        let url = order
            .certificate
            .ok_or_else(|| eyre!("valid order has no certificate URL"))?;

        let res = self.transport.post_as_get(&url).await?;
        res.text().await.wrap_err("failed to download certificate")
    }
}
