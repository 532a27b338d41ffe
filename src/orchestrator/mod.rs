//! Certificate lifecycle: evaluation, issuance, completion and the refresh loop.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use eyre::{bail, eyre, WrapErr as _};
use parking_lot::Mutex;
use pkcs8::{EncodePrivateKey as _, LineEnding};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::{
    archive,
    authority::{AuthorityContext, AuthorityFactory, AuthorityOrder, OrderStatus},
    cert::{create_p256_key, Certificate},
    error::SetupError,
    handler::{
        ensure_host_name_bindings, notify_certificate_handlers, CertificateHandler,
        HostNameHandler, Notification,
    },
    options::CertificateOptions,
    persist::{CertStore, ChallengeRecord, Persist},
};

mod ledger;
mod registry;

pub use self::{ledger::TokenOutcome, registry::active_certificate};
#[cfg(feature = "rustls")]
pub use self::registry::active_certified_key;
#[cfg(test)]
pub(crate) use self::registry::reset as reset_registry;

/// Lifecycle of the background refresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug)]
struct Lifecycle {
    state: Mutex<LifecycleState>,

    /// Stop flag of the current run. Replaced on every start so a stop request never outlives the
    /// run it was meant for.
    stop: Mutex<CancellationToken>,
}

impl Lifecycle {
    fn new() -> Self {
        Lifecycle {
            state: Mutex::new(LifecycleState::Stopped),
            stop: Mutex::new(CancellationToken::new()),
        }
    }

    fn set(&self, state: LifecycleState) {
        *self.state.lock() = state;
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.lock().clone()
    }
}

/// Keeps the certificate of one domain issued, persisted and handed to handlers.
///
/// Only one orchestrator may be live per process. Clones share the same instance; the process-wide
/// slot is released when the last clone is dropped.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    options: CertificateOptions,
    store: CertStore,
    certificate_handlers: Vec<Arc<dyn CertificateHandler>>,
    hostname_handlers: Vec<Arc<dyn HostNameHandler>>,
    authority: Arc<dyn AuthorityFactory>,
    ledger: ledger::TokenLedger,

    /// Orders waiting for their challenge to be observed, by challenge token.
    orders: Mutex<HashMap<String, Arc<dyn AuthorityOrder>>>,

    lifecycle: Arc<Lifecycle>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        registry::release(self.id);
    }
}

/// Collects the collaborators of an [`Orchestrator`].
///
/// Every collaborator is required; handler collections may be empty but must be set.
#[derive(Default)]
pub struct OrchestratorBuilder {
    options: Option<CertificateOptions>,
    persistence: Option<Arc<dyn Persist>>,
    certificate_handlers: Option<Vec<Arc<dyn CertificateHandler>>>,
    hostname_handlers: Option<Vec<Arc<dyn HostNameHandler>>>,
    authority: Option<Arc<dyn AuthorityFactory>>,
}

impl OrchestratorBuilder {
    pub fn options(mut self, options: CertificateOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persist>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn certificate_handlers(mut self, handlers: Vec<Arc<dyn CertificateHandler>>) -> Self {
        self.certificate_handlers = Some(handlers);
        self
    }

    pub fn hostname_handlers(mut self, handlers: Vec<Arc<dyn HostNameHandler>>) -> Self {
        self.hostname_handlers = Some(handlers);
        self
    }

    pub fn authority(mut self, authority: Arc<dyn AuthorityFactory>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Validates the collaborators and claims the process-wide slot.
    pub fn build(self) -> Result<Orchestrator, SetupError> {
        let options = self.options.ok_or(SetupError::MissingArgument("options"))?;
        let persistence = self
            .persistence
            .ok_or(SetupError::MissingArgument("persistence"))?;
        let certificate_handlers = self
            .certificate_handlers
            .ok_or(SetupError::MissingArgument("certificate_handlers"))?;
        let hostname_handlers = self
            .hostname_handlers
            .ok_or(SetupError::MissingArgument("hostname_handlers"))?;
        let authority = self
            .authority
            .ok_or(SetupError::MissingArgument("authority"))?;

        options.validate()?;

        let id = registry::claim()?;

        if !options.terms_of_service_agreed {
            registry::release(id);
            return Err(SetupError::InvalidState(
                "the authority's terms of service must be agreed to".to_owned(),
            ));
        }

        log::debug!(
            "orchestrator #{id} managing {} via {}",
            options.common_name(),
            options.directory_url
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                id,
                options,
                store: CertStore::new(persistence),
                certificate_handlers,
                hostname_handlers,
                authority,
                ledger: ledger::TokenLedger::default(),
                orders: Mutex::new(HashMap::new()),
                lifecycle: Arc::new(Lifecycle::new()),
            }),
        })
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Constructs an orchestrator from all its collaborators.
    ///
    /// Fails with [`SetupError::InvalidState`] when another orchestrator is live or the terms of
    /// service are not agreed.
    pub fn new(
        options: CertificateOptions,
        persistence: Arc<dyn Persist>,
        certificate_handlers: Vec<Arc<dyn CertificateHandler>>,
        hostname_handlers: Vec<Arc<dyn HostNameHandler>>,
        authority: Arc<dyn AuthorityFactory>,
    ) -> Result<Self, SetupError> {
        Self::builder()
            .options(options)
            .persistence(persistence)
            .certificate_handlers(certificate_handlers)
            .hostname_handlers(hostname_handlers)
            .authority(authority)
            .build()
    }

    pub fn options(&self) -> &CertificateOptions {
        &self.inner.options
    }

    /// Typed access to the persisted artifacts, e.g. for serving challenges.
    pub fn store(&self) -> &CertStore {
        &self.inner.store
    }

    /// The active certificate, if this orchestrator has validated or issued one.
    pub fn certificate(&self) -> Option<Arc<Certificate>> {
        active_certificate()
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.lifecycle.state.lock()
    }

    /// Outcome of the completion path for `token`, if a completion signal arrived for it.
    pub fn token_outcome(&self, token: &str) -> Option<TokenOutcome> {
        self.inner.ledger.outcome(token)
    }

    /// Brings the certificate state in line with what is persisted.
    ///
    /// Reuses or registers the account, then either restores a still valid certificate or starts a
    /// new order.
    pub async fn evaluate(&self) -> eyre::Result<()> {
        self.inner.evaluate().await
    }

    /// Starts a new order with `context` and triggers validation of its HTTP-01 challenge.
    ///
    /// Returns once the authority has been asked to validate; issuance completes through
    /// [`on_challenge_observed`](Self::on_challenge_observed).
    pub async fn issue(&self, context: &dyn AuthorityContext) -> eyre::Result<()> {
        self.inner.issue(context).await
    }

    /// Completion signal: the challenge for `token` was served to a validator.
    ///
    /// Runs at most once per token. Failures are logged and recorded in the token ledger.
    pub async fn on_challenge_observed(&self, token: &str) {
        self.inner.on_challenge_observed(token).await
    }

    /// Calls [`on_challenge_observed`](Self::on_challenge_observed) on a background task after
    /// `delay`. Does nothing if the orchestrator is gone by then.
    pub fn schedule_challenge_observed(&self, token: impl Into<String>, delay: Duration) {
        schedule_challenge_observed(Arc::downgrade(&self.inner), token.into(), delay);
    }

    /// Evaluates once, then keeps re-evaluating every `check_delay` on a background task.
    ///
    /// A failed first evaluation is returned and leaves the orchestrator stopped. Later failures
    /// are logged. The loop ends on [`stop`](Self::stop) or when `cancel` is triggered.
    pub async fn start(&self, cancel: CancellationToken) -> eyre::Result<()> {
        let lifecycle = &self.inner.lifecycle;

        let stop = {
            let mut state = lifecycle.state.lock();
            if *state != LifecycleState::Stopped {
                let reason = format!("cannot start while {:?}", *state);
                return Err(SetupError::InvalidState(reason).into());
            }
            *state = LifecycleState::Starting;

            let stop = CancellationToken::new();
            *lifecycle.stop.lock() = stop.clone();
            stop
        };

        log::info!(
            "starting certificate orchestrator for {}",
            self.inner.options.common_name()
        );

        if let Err(err) = self.inner.evaluate().await {
            lifecycle.set(LifecycleState::Stopped);
            return Err(err.wrap_err("initial certificate evaluation failed"));
        }

        if stop.is_cancelled() || cancel.is_cancelled() {
            lifecycle.set(LifecycleState::Stopped);
            return Ok(());
        }

        lifecycle.set(LifecycleState::Running);

        tokio::spawn(refresh_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(lifecycle),
            self.inner.options.check_delay,
            cancel,
            stop,
        ));

        Ok(())
    }

    /// Asks the refresh loop to end. Work already in progress runs to completion.
    pub fn stop(&self) {
        let lifecycle = &self.inner.lifecycle;

        let mut state = lifecycle.state.lock();
        if matches!(*state, LifecycleState::Starting | LifecycleState::Running) {
            *state = LifecycleState::Stopping;
        }

        lifecycle.stop_token().cancel();
    }

    /// Number of orders still waiting for their challenge to be observed.
    #[cfg(test)]
    pub(crate) fn pending_orders(&self) -> usize {
        self.inner.orders.lock().len()
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("id", &self.inner.id)
            .field("common_name", &self.inner.options.common_name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn evaluate(self: &Arc<Self>) -> eyre::Result<()> {
        let context = self.authority_context().await?;
        let common_name = self.options.common_name();

        let Some(archive) = self.store.archive(common_name).await? else {
            log::info!("no certificate stored for {common_name}, ordering one");
            return self.issue(context.as_ref()).await;
        };

        let Some((certificate, passphrase)) = self.open_archive(&archive).await? else {
            return self.issue(context.as_ref()).await;
        };

        if certificate.needs_renewal(OffsetDateTime::now_utc(), self.options.refresh_early) {
            log::info!(
                "certificate for {common_name} is valid from {} until {}, renewing",
                certificate.not_before(),
                certificate.not_after()
            );
            return self.issue(context.as_ref()).await;
        }

        log::info!(
            "restored certificate for {common_name}, valid until {}",
            certificate.not_after()
        );

        let certificate = Arc::new(certificate);
        registry::publish(self.id, Arc::clone(&certificate));

        ensure_host_name_bindings(&self.hostname_handlers).await;
        notify_certificate_handlers(
            &self.certificate_handlers,
            Notification::Restored,
            &certificate,
            &archive,
            &passphrase,
        )
        .await;

        Ok(())
    }

    /// Decodes the stored archive. `None` means it should be replaced.
    async fn open_archive(
        &self,
        archive: &[u8],
    ) -> eyre::Result<Option<(Certificate, Zeroizing<String>)>> {
        let common_name = self.options.common_name();

        let Some(passphrase) = self.store.passphrase(common_name).await? else {
            log::warn!("certificate archive for {common_name} has no passphrase, replacing it");
            return Ok(None);
        };

        match archive::open(archive, &passphrase) {
            Ok(certificate) => Ok(Some((certificate, passphrase))),
            Err(err) => {
                log::warn!(
                    "certificate archive for {common_name} is unreadable, replacing it: {err}"
                );
                Ok(None)
            }
        }
    }

    /// Reuses the account stored for the contact email, or registers a new one.
    async fn authority_context(&self) -> eyre::Result<Arc<dyn AuthorityContext>> {
        let email = &self.options.email;
        let directory_url = &self.options.directory_url;

        if let Some(pem) = self.store.account_key(email).await? {
            log::debug!("reusing account key of {email}");
            return self.authority.context(directory_url, Some(&pem)).await;
        }

        let context = self.authority.context(directory_url, None).await?;
        context
            .new_account(email, self.options.terms_of_service_agreed)
            .await?;

        let pem = context.account_key_pem()?;
        self.store.store_account_key(email, &pem).await?;
        log::info!("stored new account key of {email}");

        Ok(context)
    }

    async fn issue(self: &Arc<Self>, context: &dyn AuthorityContext) -> eyre::Result<()> {
        let common_name = self.options.common_name();

        ensure_host_name_bindings(&self.hostname_handlers).await;

        let order = context
            .new_order(common_name)
            .await
            .wrap_err_with(|| format!("failed to order certificate for {common_name}"))?;
        let challenge = order.http_challenge().await?;

        {
            // a new order supersedes any still waiting on their challenge
            let mut orders = self.orders.lock();
            orders.clear();
            orders.insert(challenge.token.clone(), Arc::clone(&order));
        }

        self.store
            .store_challenge(&ChallengeRecord {
                token: challenge.token.clone(),
                key_authorization: challenge.key_authorization.clone(),
                location: challenge.location.clone(),
            })
            .await?;

        if challenge.already_valid {
            // no validator will call back
            log::info!("authorization for {common_name} is already valid");
            schedule_challenge_observed(Arc::downgrade(self), challenge.token, Duration::ZERO);
            return Ok(());
        }

        order.validate(&challenge).await?;
        log::info!(
            "ordered certificate for {common_name}, waiting for challenge {}",
            challenge.token
        );

        Ok(())
    }

    async fn on_challenge_observed(&self, token: &str) {
        if !self.ledger.begin(token) {
            log::debug!("challenge {token} already handled");
            return;
        }

        let outcome = self.complete(token).await;
        self.orders.lock().remove(token);

        match outcome {
            Ok((certificate, archive, passphrase)) => {
                self.ledger.finish(token, TokenOutcome::Succeeded);

                notify_certificate_handlers(
                    &self.certificate_handlers,
                    Notification::Created,
                    &certificate,
                    &archive,
                    &passphrase,
                )
                .await;
            }

            Err(err) => {
                log::error!("failed to complete order for challenge {token}: {err:?}");
                self.ledger.finish(token, TokenOutcome::Failed);
            }
        }
    }

    /// Waits for the order, then issues, persists and publishes the certificate.
    async fn complete(
        &self,
        token: &str,
    ) -> eyre::Result<(Arc<Certificate>, Vec<u8>, Zeroizing<String>)> {
        let order = self.orders.lock().get(token).cloned();
        let order = order.ok_or_else(|| eyre!("no order is waiting on challenge {token}"))?;

        self.wait_until_ready(order.as_ref()).await?;

        let common_name = self.options.common_name();
        let key = create_p256_key();

        let chain = order.finalize(&self.options.certificate, &key).await?;
        let key_pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| eyre!("failed to encode certificate key: {err}"))?;
        let certificate = Certificate::parse(key_pem, chain)?;

        let passphrase = archive::generate_passphrase();
        let archive = archive::seal(&certificate, &passphrase)?;

        self.store.store_archive(common_name, &archive).await?;
        self.store.store_passphrase(common_name, &passphrase).await?;

        let certificate = Arc::new(certificate);
        registry::publish(self.id, Arc::clone(&certificate));

        log::info!(
            "issued certificate for {common_name}, valid until {}",
            certificate.not_after()
        );

        Ok((certificate, archive, passphrase))
    }

    /// Polls until the order is ready, became invalid, or the optional timeout passed.
    async fn wait_until_ready(&self, order: &dyn AuthorityOrder) -> eyre::Result<()> {
        let started = tokio::time::Instant::now();

        loop {
            match order.status().await? {
                status if status.is_ready() => return Ok(()),
                OrderStatus::Invalid => bail!("order became invalid"),
                OrderStatus::Valid => bail!("order was already finalized"),
                status => log::trace!("order is {status:?}"),
            }

            if let Some(timeout) = self.options.order_ready_timeout {
                if started.elapsed() >= timeout {
                    bail!("order not ready after {timeout:?}");
                }
            }

            tokio::time::sleep(self.options.order_poll_interval).await;
        }
    }
}

fn schedule_challenge_observed(inner: Weak<Inner>, token: String, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        match inner.upgrade() {
            Some(inner) => inner.on_challenge_observed(&token).await,
            None => log::debug!("orchestrator dropped before challenge {token} was handled"),
        }
    });
}

async fn refresh_loop(
    inner: Weak<Inner>,
    lifecycle: Arc<Lifecycle>,
    check_delay: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::info!("certificate refresh loop cancelled");
                break;
            }
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(check_delay) => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };

        if let Err(err) = inner.evaluate().await {
            log::error!("certificate refresh failed: {err:?}");
        }
    }

    lifecycle.set(LifecycleState::Stopped);
    log::debug!("certificate refresh loop stopped");
}
