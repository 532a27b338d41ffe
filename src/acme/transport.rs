use std::collections::VecDeque;

use eyre::{bail, eyre, WrapErr as _};
use p256::ecdsa::SigningKey;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, LOCATION};
use serde::Serialize;
use tokio::sync::OnceCell;

use super::{
    api,
    jws::{self, Jwk, JwsProtectedHeader},
};

/// Attempts per call while the server keeps rejecting nonces.
const MAX_ATTEMPTS: usize = 10;

/// Upper bound of pooled nonces.
const NONCE_POOL_SIZE: usize = 10;

/// JWS payload and nonce handling for requests to the API.
///
/// The account URL (key ID) is learned either from the newAccount call or, for a reused key, by
/// asking the server with `onlyReturnExisting` on the first call that needs it.
#[derive(Debug)]
pub(crate) struct Transport {
    client: reqwest::Client,
    signing_key: SigningKey,
    nonce_pool: NoncePool,
    new_account_url: String,
    key_id: OnceCell<String>,
}

impl Transport {
    pub(crate) fn new(
        client: reqwest::Client,
        signing_key: SigningKey,
        directory: &api::Directory,
    ) -> Self {
        Transport {
            nonce_pool: NoncePool::new(client.clone(), &directory.new_nonce),
            client,
            signing_key,
            new_account_url: directory.new_account.clone(),
            key_id: OnceCell::new(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Posts to newAccount signed with the full JWK and remembers the returned account URL.
    pub(crate) async fn register<T>(&self, payload: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        let res = self
            .do_call(&self.new_account_url, Some(payload), None)
            .await?;

        let kid = expect_header(res.headers(), LOCATION.as_str())?;
        log::debug!("key ID is: {kid}");

        // an earlier lookup may have raced us; both describe the same account
        let _ = self.key_id.set(kid);

        Ok(res)
    }

    /// Makes a call signed with the account URL.
    pub(crate) async fn call<T>(&self, url: &str, payload: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        let kid = self.key_id().await?;
        self.do_call(url, Some(payload), Some(kid)).await
    }

    /// Makes a POST-as-GET call.
    pub(crate) async fn post_as_get(&self, url: &str) -> eyre::Result<reqwest::Response> {
        let kid = self.key_id().await?;
        self.do_call::<()>(url, None, Some(kid)).await
    }

    async fn key_id(&self) -> eyre::Result<&str> {
        self.key_id
            .get_or_try_init(|| async {
                log::debug!("looking up account of existing key");

                let lookup = api::NewAccount {
                    only_return_existing: Some(true),
                    ..Default::default()
                };

                let res = self
                    .do_call(&self.new_account_url, Some(&lookup), None)
                    .await
                    .wrap_err("account lookup failed")?;

                expect_header(res.headers(), LOCATION.as_str())
            })
            .await
            .map(String::as_str)
    }

    async fn do_call<T>(
        &self,
        url: &str,
        payload: Option<&T>,
        kid: Option<&str>,
    ) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        // The ACME API may at any point invalidate all nonces. If we detect such an
        // error, we retry with a fresh one.
        for attempt in 1..=MAX_ATTEMPTS {
            let nonce = self.nonce_pool.get_nonce().await?;

            let protected = match kid {
                Some(kid) => JwsProtectedHeader::new_kid(kid, url, nonce),
                None => JwsProtectedHeader::new_jwk(Jwk::try_from(&self.signing_key)?, url, nonce),
            };
            let body = jws::sign(&protected, &self.signing_key, payload)?;

            log::debug!("call endpoint: {url}");

            let res = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/jose+json")
                .header(ACCEPT, "application/json, application/pem-certificate-chain")
                .body(body)
                .send()
                .await
                .wrap_err_with(|| format!("request to {url} failed"))?;

            // Regardless of the request being a success or not, there might be a nonce in the
            // response.
            self.nonce_pool.extract_nonce(res.headers());

            match handle_error(res).await {
                Ok(res) => return Ok(res),

                Err(problem) if problem.is_bad_nonce() || problem.is_jws_verification_error() => {
                    log::debug!("retrying ({attempt}/{MAX_ATTEMPTS}) on: {problem}");
                }

                Err(problem) => return Err(problem.into()),
            }
        }

        bail!("server kept rejecting requests to {url}")
    }
}

/// Shared pool of nonces.
#[derive(Debug)]
struct NoncePool {
    client: reqwest::Client,
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    fn new(client: reqwest::Client, nonce_url: &str) -> Self {
        NoncePool {
            client,
            nonce_url: nonce_url.to_owned(),
            pool: Mutex::new(VecDeque::new()),
        }
    }

    fn extract_nonce(&self, headers: &HeaderMap) {
        let Some(nonce) = headers.get("replay-nonce").and_then(|v| v.to_str().ok()) else {
            return;
        };

        log::trace!("extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce.to_owned());

        if pool.len() > NONCE_POOL_SIZE {
            pool.pop_front();
        }
    }

    async fn get_nonce(&self) -> eyre::Result<String> {
        let pooled = self.pool.lock().pop_front();
        if let Some(nonce) = pooled {
            log::trace!("use previous nonce");
            return Ok(nonce);
        }

        log::debug!("request new nonce");
        let res = self
            .client
            .head(&self.nonce_url)
            .send()
            .await
            .wrap_err("newNonce request failed")?;

        expect_header(res.headers(), "replay-nonce")
    }
}

/// Fetches and decodes the directory object.
pub(crate) async fn fetch_directory(
    client: &reqwest::Client,
    url: &str,
) -> eyre::Result<api::Directory> {
    let res = client
        .get(url)
        .send()
        .await
        .wrap_err_with(|| format!("failed to fetch directory {url}"))?;

    let res = handle_error(res).await?;
    res.json().await.wrap_err("malformed directory")
}

/// Passes successful responses through and turns everything else into a [`api::Problem`].
async fn handle_error(res: reqwest::Response) -> Result<reqwest::Response, api::Problem> {
    let status = res.status();

    // ok responses pass through
    if status.is_success() {
        return Ok(res);
    }

    let is_problem = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    // servers sometimes close the connection abruptly after the body
    let body = res.text().await.unwrap_or_default();

    if is_problem {
        Err(
            serde_json::from_str(&body).unwrap_or_else(|err| api::Problem {
                _type: "problemJsonFail".to_owned(),
                detail: Some(format!(
                    "failed to deserialize application/problem+json ({err}) body: {body}"
                )),
            }),
        )
    } else {
        Err(api::Problem {
            _type: "httpReqError".to_owned(),
            detail: Some(format!("{status} body: {body}")),
        })
    }
}

pub(crate) fn expect_header(headers: &HeaderMap, name: &str) -> eyre::Result<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| eyre!("missing header: {name}"))
}
