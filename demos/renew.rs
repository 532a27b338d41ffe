//! Keeps a certificate for the domain in `certkeeper.json` issued, exporting it as PEM files.
//!
//! ```json
//! {
//!   "directory_url": "https://acme-staging-v02.api.letsencrypt.org/directory",
//!   "email": "admin@example.org",
//!   "certificate": { "common_name": "example.org" },
//!   "terms_of_service_agreed": true
//! }
//! ```
//!
//! Port 80 of the domain must reach this process for `http-01` validation.

use std::{env, sync::Arc};

use actix_web::{App, HttpServer};
use certkeeper::{
    responder, AcmeFactory, CertificateOptions, ChallengeResponder, DiskPersist, Orchestrator,
    PemExportHandler,
};
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let config = env::args()
        .nth(1)
        .unwrap_or_else(|| "certkeeper.json".to_owned());
    let options = CertificateOptions::from_json_file(&config)?;
    let name = options.common_name().to_owned();

    let orchestrator = Orchestrator::builder()
        .options(options)
        .persistence(Arc::new(DiskPersist::new("certkeeper-state")))
        .certificate_handlers(vec![Arc::new(PemExportHandler::new("certs", &name))])
        .hostname_handlers(vec![])
        .authority(Arc::new(AcmeFactory::new()))
        .build()?;

    // Validators fetch challenges over plain HTTP.
    let responder = ChallengeResponder::new(orchestrator.clone());
    let srv = HttpServer::new(move || App::new().configure(responder::service(responder.clone())))
        .bind(("0.0.0.0", 80))?
        .shutdown_timeout(0)
        .disable_signals()
        .run();

    let srv_handle = srv.handle();
    let srv_task = actix_web::rt::spawn(srv);

    let cancel = CancellationToken::new();
    orchestrator.start(cancel.clone()).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");

    cancel.cancel();
    orchestrator.stop();

    srv_handle.stop(true).await;
    srv_task.await??;

    Ok(())
}
