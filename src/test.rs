use std::{
    collections::{HashMap, VecDeque},
    net::TcpListener,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use actix_server::ServerHandle;
use actix_web::{web, App, HttpResponse, HttpServer};
use base64::prelude::*;
use der::{asn1::UtcTime, EncodePem as _};
use eyre::eyre;
use parking_lot::{Mutex, MutexGuard};
use pkcs8::{EncodePrivateKey as _, LineEnding};
use x509_cert::{
    builder::{Builder as _, CertificateBuilder, Profile},
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::{Time, Validity},
};
use zeroize::Zeroizing;

use crate::{
    authority::{AuthorityContext, AuthorityFactory, AuthorityOrder, HttpChallenge, OrderStatus},
    cert::{create_p256_key, Certificate},
    handler::{CertificateHandler, HostNameHandler},
    options::CertificateInfo,
    orchestrator::reset_registry,
    persist::{MemoryPersist, Persist, PersistKey, PersistKind},
};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

static REGISTRY_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Serializes tests that construct orchestrators and clears the process-wide slot around them.
pub(crate) struct RegistryGuard {
    _lock: MutexGuard<'static, ()>,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        reset_registry();
    }
}

pub(crate) fn registry_guard() -> RegistryGuard {
    init_logger();
    let lock = REGISTRY_LOCK.lock();
    reset_registry();
    RegistryGuard { _lock: lock }
}

fn utc_offset(offset_secs: f64) -> Time {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap();
    let offset = Duration::from_secs_f64(offset_secs.abs());
    let at = if offset_secs < 0.0 {
        now - offset
    } else {
        now + offset
    };
    Time::UtcTime(UtcTime::from_unix_duration(at).unwrap())
}

/// Issues a self-signed certificate for `common_name` over `key`.
///
/// Validity bounds are offsets in seconds from now.
pub(crate) fn issue_certificate(
    key: &p256::ecdsa::SigningKey,
    common_name: &str,
    not_before: f64,
    not_after: f64,
) -> String {
    let validity = Validity {
        not_before: utc_offset(not_before),
        not_after: utc_offset(not_after),
    };
    let subject = format!("CN={common_name}").parse::<Name>().unwrap();
    let spki = SubjectPublicKeyInfoOwned::from_key(*key.verifying_key()).unwrap();

    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::new(&[1]).unwrap(),
        validity,
        subject,
        spki,
        key,
    )
    .unwrap();

    builder
        .build::<p256::ecdsa::DerSignature>()
        .unwrap()
        .to_pem(LineEnding::LF)
        .unwrap()
}

/// Fresh key and self-signed certificate (PEM) for `common_name`.
pub(crate) fn self_signed(
    common_name: &str,
    not_before: f64,
    not_after: f64,
) -> (Zeroizing<String>, String) {
    let key = create_p256_key();
    let chain = issue_certificate(&key, common_name, not_before, not_after);
    (key.to_pkcs8_pem(LineEnding::LF).unwrap(), chain)
}

/// Certificate valid from a minute ago for `lifetime` seconds.
pub(crate) fn self_signed_certificate(common_name: &str, lifetime: f64) -> Certificate {
    let (key, chain) = self_signed(common_name, -60.0, lifetime);
    Certificate::parse(key, chain).unwrap()
}

/// Shared, ordered log of what fakes observed.
pub(crate) type Events = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct FakeAuthorityState {
    events: Events,
    contexts: AtomicUsize,
    fail_contexts: AtomicBool,
    account_keys: Mutex<Vec<Option<String>>>,
    registrations: Mutex<Vec<String>>,
    orders: Mutex<Vec<String>>,
    validations: Mutex<Vec<String>>,
    finalizations: AtomicUsize,
    next_token: AtomicUsize,
    statuses: Mutex<VecDeque<OrderStatus>>,
    steady_status: Mutex<Option<OrderStatus>>,
    already_valid: AtomicBool,
}

/// Scripted authority. Orders hand out challenge tokens `T1`, `T2`, ... and finalize by
/// self-signing a certificate over the submitted key.
#[derive(Clone, Default)]
pub(crate) struct FakeAuthority {
    state: Arc<FakeAuthorityState>,
}

impl FakeAuthority {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_events(events: Events) -> Self {
        FakeAuthority {
            state: Arc::new(FakeAuthorityState {
                events,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.state.events.lock().clone()
    }

    pub(crate) fn contexts(&self) -> usize {
        self.state.contexts.load(Ordering::SeqCst)
    }

    /// Account keys passed to each context; `None` for a fresh key.
    pub(crate) fn account_keys(&self) -> Vec<Option<String>> {
        self.state.account_keys.lock().clone()
    }

    pub(crate) fn registrations(&self) -> Vec<String> {
        self.state.registrations.lock().clone()
    }

    pub(crate) fn orders(&self) -> Vec<String> {
        self.state.orders.lock().clone()
    }

    pub(crate) fn validations(&self) -> Vec<String> {
        self.state.validations.lock().clone()
    }

    pub(crate) fn finalizations(&self) -> usize {
        self.state.finalizations.load(Ordering::SeqCst)
    }

    /// Statuses returned by successive status polls before the steady status.
    pub(crate) fn script_statuses(&self, statuses: impl IntoIterator<Item = OrderStatus>) {
        self.state.statuses.lock().extend(statuses);
    }

    /// Status returned once the script is exhausted. `Ready` by default.
    pub(crate) fn set_steady_status(&self, status: OrderStatus) {
        *self.state.steady_status.lock() = Some(status);
    }

    pub(crate) fn set_already_valid(&self, already_valid: bool) {
        self.state.already_valid.store(already_valid, Ordering::SeqCst);
    }

    pub(crate) fn fail_contexts(&self, fail: bool) {
        self.state.fail_contexts.store(fail, Ordering::SeqCst);
    }
}

impl FakeAuthorityState {
    fn log(&self, event: String) {
        self.events.lock().push(event);
    }
}

#[async_trait::async_trait]
impl AuthorityFactory for FakeAuthority {
    async fn context(
        &self,
        _directory_url: &str,
        account_key_pem: Option<&str>,
    ) -> eyre::Result<Arc<dyn AuthorityContext>> {
        self.state.contexts.fetch_add(1, Ordering::SeqCst);

        if self.state.fail_contexts.load(Ordering::SeqCst) {
            return Err(eyre!("authority unavailable"));
        }

        self.state
            .account_keys
            .lock()
            .push(account_key_pem.map(ToOwned::to_owned));

        let key = match account_key_pem {
            Some(pem) => {
                use pkcs8::DecodePrivateKey as _;
                p256::ecdsa::SigningKey::from_pkcs8_pem(pem).map_err(|err| eyre!("{err}"))?
            }
            None => create_p256_key(),
        };

        Ok(Arc::new(FakeContext {
            state: Arc::clone(&self.state),
            key,
        }))
    }
}

struct FakeContext {
    state: Arc<FakeAuthorityState>,
    key: p256::ecdsa::SigningKey,
}

#[async_trait::async_trait]
impl AuthorityContext for FakeContext {
    fn account_key_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| eyre!("{err}"))
    }

    async fn new_account(&self, email: &str, _terms_of_service_agreed: bool) -> eyre::Result<()> {
        self.state.log(format!("register:{email}"));
        self.state.registrations.lock().push(email.to_owned());
        Ok(())
    }

    async fn new_order(&self, common_name: &str) -> eyre::Result<Arc<dyn AuthorityOrder>> {
        self.state.log(format!("order:{common_name}"));
        self.state.orders.lock().push(common_name.to_owned());

        let token = format!("T{}", self.state.next_token.fetch_add(1, Ordering::SeqCst) + 1);

        Ok(Arc::new(FakeOrder {
            state: Arc::clone(&self.state),
            token,
        }))
    }
}

struct FakeOrder {
    state: Arc<FakeAuthorityState>,
    token: String,
}

#[async_trait::async_trait]
impl AuthorityOrder for FakeOrder {
    async fn http_challenge(&self) -> eyre::Result<HttpChallenge> {
        Ok(HttpChallenge {
            token: self.token.clone(),
            key_authorization: format!("{}.thumbprint", self.token),
            location: format!("https://ca.test/chall/{}", self.token),
            already_valid: self.state.already_valid.load(Ordering::SeqCst),
        })
    }

    async fn validate(&self, challenge: &HttpChallenge) -> eyre::Result<()> {
        self.state.log(format!("validate:{}", challenge.token));
        self.state.validations.lock().push(challenge.token.clone());
        Ok(())
    }

    async fn status(&self) -> eyre::Result<OrderStatus> {
        let scripted = self.state.statuses.lock().pop_front();
        let steady = *self.state.steady_status.lock();
        Ok(scripted.or(steady).unwrap_or(OrderStatus::Ready))
    }

    async fn finalize(
        &self,
        info: &CertificateInfo,
        key: &p256::ecdsa::SigningKey,
    ) -> eyre::Result<String> {
        self.state.log(format!("finalize:{}", self.token));
        self.state.finalizations.fetch_add(1, Ordering::SeqCst);

        // give concurrent duplicates a chance to interleave
        tokio::task::yield_now().await;

        Ok(issue_certificate(
            key,
            &info.common_name,
            -60.0,
            90.0 * 24.0 * 3600.0,
        ))
    }
}

/// In-memory persistence counting writes per namespace.
#[derive(Default)]
pub(crate) struct CountingPersist {
    inner: MemoryPersist,
    puts: Mutex<HashMap<PersistKind, usize>>,
}

impl CountingPersist {
    pub(crate) fn puts(&self, kind: PersistKind) -> usize {
        self.puts.lock().get(&kind).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Persist for CountingPersist {
    async fn put(&self, key: &PersistKey, value: &[u8]) -> eyre::Result<()> {
        *self.puts.lock().entry(key.kind).or_default() += 1;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &PersistKey) -> eyre::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }
}

#[derive(Clone)]
pub(crate) struct HandlerCall {
    pub(crate) certificate: Certificate,
    pub(crate) archive: Vec<u8>,
    pub(crate) passphrase: String,
}

/// Certificate and host name handler recording every call.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    name: String,
    events: Option<Events>,
    created: Mutex<Vec<HandlerCall>>,
    restored: Mutex<Vec<HandlerCall>>,
    bindings: AtomicUsize,
}

impl RecordingHandler {
    /// Also logs `created:<name>`, `restored:<name>` and `bind:<name>` into `events`.
    pub(crate) fn logging(name: &str, events: Events) -> Self {
        RecordingHandler {
            name: name.to_owned(),
            events: Some(events),
            ..Default::default()
        }
    }

    fn log(&self, what: &str) {
        if let Some(events) = &self.events {
            events.lock().push(format!("{what}:{}", self.name));
        }
    }

    /// Passphrases of `created` calls.
    pub(crate) fn created(&self) -> Vec<String> {
        self.created_calls()
            .into_iter()
            .map(|call| call.passphrase)
            .collect()
    }

    pub(crate) fn created_calls(&self) -> Vec<HandlerCall> {
        self.created.lock().clone()
    }

    /// Passphrases of `restored` calls.
    pub(crate) fn restored(&self) -> Vec<String> {
        self.restored_calls()
            .into_iter()
            .map(|call| call.passphrase)
            .collect()
    }

    pub(crate) fn restored_calls(&self) -> Vec<HandlerCall> {
        self.restored.lock().clone()
    }

    pub(crate) fn bindings(&self) -> usize {
        self.bindings.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CertificateHandler for RecordingHandler {
    async fn created(
        &self,
        certificate: &Certificate,
        archive: &[u8],
        passphrase: &str,
    ) -> eyre::Result<()> {
        self.log("created");
        self.created.lock().push(HandlerCall {
            certificate: certificate.clone(),
            archive: archive.to_vec(),
            passphrase: passphrase.to_owned(),
        });
        Ok(())
    }

    async fn restored(
        &self,
        certificate: &Certificate,
        archive: &[u8],
        passphrase: &str,
    ) -> eyre::Result<()> {
        self.log("restored");
        self.restored.lock().push(HandlerCall {
            certificate: certificate.clone(),
            archive: archive.to_vec(),
            passphrase: passphrase.to_owned(),
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl HostNameHandler for RecordingHandler {
    async fn ensure_host_name_binding(&self) -> eyre::Result<()> {
        self.log("bind");
        self.bindings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler whose every call fails.
pub(crate) struct FailingHandler;

#[async_trait::async_trait]
impl CertificateHandler for FailingHandler {
    async fn created(&self, _: &Certificate, _: &[u8], _: &str) -> eyre::Result<()> {
        Err(eyre!("deployment target unreachable"))
    }

    async fn restored(&self, _: &Certificate, _: &[u8], _: &str) -> eyre::Result<()> {
        Err(eyre!("deployment target unreachable"))
    }
}

#[async_trait::async_trait]
impl HostNameHandler for FailingHandler {
    async fn ensure_host_name_binding(&self) -> eyre::Result<()> {
        Err(eyre!("dns provider unreachable"))
    }
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[derive(Default)]
struct AcmeState {
    url: String,
    certificate: String,
    nonce: usize,
    new_accounts: usize,
    account_lookups: usize,
    jwk_signed_calls: usize,
    authorization_valid: bool,
    challenge_triggered: bool,
    finalized: bool,
}

impl AcmeState {
    fn next_nonce(&mut self) -> String {
        self.nonce += 1;
        format!("nonce-{}", self.nonce)
    }

    fn order_status(&self) -> &'static str {
        if self.finalized {
            "valid"
        } else if self.challenge_triggered || self.authorization_valid {
            "ready"
        } else {
            "pending"
        }
    }

    fn order(&self) -> serde_json::Value {
        let url = &self.url;
        let mut order = serde_json::json!({
            "status": self.order_status(),
            "identifiers": [{ "type": "dns", "value": "sub.example.com" }],
            "authorizations": [format!("{url}/acme/authz/1")],
            "finalize": format!("{url}/acme/finalize/1"),
        });
        if self.finalized {
            order["certificate"] = format!("{url}/acme/cert/1").into();
        }
        order
    }
}

type SharedAcmeState = Arc<Mutex<AcmeState>>;

/// Decodes the protected header and payload of a flattened JWS body.
fn jws_parts(body: &[u8]) -> (serde_json::Value, serde_json::Value) {
    let jws: serde_json::Value = serde_json::from_slice(body).unwrap();
    let decode = |part: &str| -> serde_json::Value {
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(jws[part].as_str().unwrap())
            .unwrap();
        if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        }
    };
    (decode("protected"), decode("payload"))
}

fn signed(state: &SharedAcmeState, body: &[u8]) -> (serde_json::Value, String) {
    let (protected, payload) = jws_parts(body);
    let mut state = state.lock();
    if protected.get("jwk").is_some() {
        state.jwk_signed_calls += 1;
    }
    (payload, state.next_nonce())
}

async fn directory(state: web::Data<SharedAcmeState>) -> HttpResponse {
    let url = state.lock().url.clone();
    HttpResponse::Ok().json(serde_json::json!({
        "newNonce": format!("{url}/acme/new-nonce"),
        "newAccount": format!("{url}/acme/new-acct"),
        "newOrder": format!("{url}/acme/new-order"),
        "revokeCert": format!("{url}/acme/revoke-cert"),
        "keyChange": format!("{url}/acme/key-change"),
        "meta": { "termsOfService": format!("{url}/terms") },
    }))
}

async fn new_nonce(state: web::Data<SharedAcmeState>) -> HttpResponse {
    let nonce = state.lock().next_nonce();
    HttpResponse::NoContent()
        .insert_header(("Replay-Nonce", nonce))
        .finish()
}

async fn new_account(state: web::Data<SharedAcmeState>, body: web::Bytes) -> HttpResponse {
    let (payload, nonce) = signed(&state, &body);
    let mut state = state.lock();

    if payload["onlyReturnExisting"] == true {
        state.account_lookups += 1;
    } else {
        state.new_accounts += 1;
    }

    HttpResponse::Created()
        .insert_header(("Replay-Nonce", nonce))
        .insert_header(("Location", format!("{}/acme/acct/1", state.url)))
        .json(serde_json::json!({ "status": "valid" }))
}

async fn new_order(state: web::Data<SharedAcmeState>, body: web::Bytes) -> HttpResponse {
    let (_, nonce) = signed(&state, &body);
    let state = state.lock();

    HttpResponse::Created()
        .insert_header(("Replay-Nonce", nonce))
        .insert_header(("Location", format!("{}/acme/order/1", state.url)))
        .json(state.order())
}

async fn get_order(state: web::Data<SharedAcmeState>, body: web::Bytes) -> HttpResponse {
    let (_, nonce) = signed(&state, &body);
    let state = state.lock();

    HttpResponse::Ok()
        .insert_header(("Replay-Nonce", nonce))
        .json(state.order())
}

async fn authorization(state: web::Data<SharedAcmeState>, body: web::Bytes) -> HttpResponse {
    let (_, nonce) = signed(&state, &body);
    let state = state.lock();
    let status = if state.authorization_valid { "valid" } else { "pending" };

    HttpResponse::Ok()
        .insert_header(("Replay-Nonce", nonce))
        .json(serde_json::json!({
            "identifier": { "type": "dns", "value": "sub.example.com" },
            "status": status,
            "challenges": [
                {
                    "type": "dns-01",
                    "status": status,
                    "url": format!("{}/acme/chall/2", state.url),
                    "token": "D1",
                },
                {
                    "type": "http-01",
                    "status": status,
                    "url": format!("{}/acme/chall/1", state.url),
                    "token": "T1",
                },
            ],
        }))
}

async fn challenge(state: web::Data<SharedAcmeState>, body: web::Bytes) -> HttpResponse {
    let (_, nonce) = signed(&state, &body);
    let mut state = state.lock();
    state.challenge_triggered = true;

    HttpResponse::Ok()
        .insert_header(("Replay-Nonce", nonce))
        .json(serde_json::json!({
            "type": "http-01",
            "status": "processing",
            "url": format!("{}/acme/chall/1", state.url),
            "token": "T1",
        }))
}

async fn finalize(state: web::Data<SharedAcmeState>, body: web::Bytes) -> HttpResponse {
    let (payload, nonce) = signed(&state, &body);
    let mut state = state.lock();

    if state.order_status() != "ready" || payload["csr"].as_str().is_none() {
        return HttpResponse::Forbidden()
            .insert_header(("Replay-Nonce", nonce))
            .content_type("application/problem+json")
            .json(serde_json::json!({
                "type": "urn:ietf:params:acme:error:orderNotReady",
                "detail": "order is not ready",
            }));
    }

    state.finalized = true;

    HttpResponse::Ok()
        .insert_header(("Replay-Nonce", nonce))
        .json(state.order())
}

async fn download(state: web::Data<SharedAcmeState>, body: web::Bytes) -> HttpResponse {
    let (_, nonce) = signed(&state, &body);
    let state = state.lock();

    HttpResponse::Ok()
        .insert_header(("Replay-Nonce", nonce))
        .content_type("application/pem-certificate-chain")
        .body(state.certificate.clone())
}

/// In-process ACME server for a single order covering `sub.example.com`.
///
/// The order turns `ready` once its challenge is triggered (or right away when the authorization
/// is already valid) and `valid` once finalized.
pub(crate) struct FakeAcmeServer {
    pub(crate) dir_url: String,
    state: SharedAcmeState,
    handle: ServerHandle,
}

impl FakeAcmeServer {
    pub(crate) fn new_accounts(&self) -> usize {
        self.state.lock().new_accounts
    }

    pub(crate) fn account_lookups(&self) -> usize {
        self.state.lock().account_lookups
    }

    /// Calls signed with a full JWK rather than an account URL.
    pub(crate) fn jwk_signed_calls(&self) -> usize {
        self.state.lock().jwk_signed_calls
    }

    pub(crate) fn challenge_triggered(&self) -> bool {
        self.state.lock().challenge_triggered
    }

    pub(crate) fn finalized(&self) -> bool {
        self.state.lock().finalized
    }

    pub(crate) fn set_authorization_valid(&self, valid: bool) {
        self.state.lock().authorization_valid = valid;
    }
}

impl Drop for FakeAcmeServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

pub(crate) fn with_acme_server() -> FakeAcmeServer {
    init_logger();

    let lst = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = lst.local_addr().unwrap().port();

    let url = format!("http://127.0.0.1:{port}");
    let dir_url = format!("{url}/directory");

    let (_key, certificate) = self_signed("sub.example.com", -60.0, 90.0 * 24.0 * 3600.0);
    let state: SharedAcmeState = Arc::new(Mutex::new(AcmeState {
        url,
        certificate,
        ..Default::default()
    }));

    let app_state = Arc::clone(&state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(Arc::clone(&app_state)))
            .route("/directory", web::get().to(directory))
            .route("/acme/new-nonce", web::head().to(new_nonce))
            .route("/acme/new-acct", web::post().to(new_account))
            .route("/acme/new-order", web::post().to(new_order))
            .route("/acme/order/1", web::post().to(get_order))
            .route("/acme/authz/1", web::post().to(authorization))
            .route("/acme/chall/1", web::post().to(challenge))
            .route("/acme/finalize/1", web::post().to(finalize))
            .route("/acme/cert/1", web::post().to(download))
    })
    .workers(1)
    .disable_signals()
    .listen(lst)
    .unwrap()
    .run();

    let handle = server.handle();

    tokio::spawn(server);

    FakeAcmeServer {
        dir_url,
        state,
        handle,
    }
}

#[tokio::test]
async fn test_fake_acme_directory() {
    let server = with_acme_server();
    let res = reqwest::get(&server.dir_url).await.unwrap();
    assert!(res.status().is_success());

    let dir: serde_json::Value = res.json().await.unwrap();
    assert!(dir["newNonce"].as_str().unwrap().ends_with("/acme/new-nonce"));
}
