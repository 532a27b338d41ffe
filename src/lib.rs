//! Keeps the TLS certificate of one domain issued and renewed from an ACME provider such as
//! [Let's Encrypt](https://letsencrypt.org/).
//!
//! An [`Orchestrator`] checks the persisted certificate on a schedule. When it is missing or close
//! to expiry, a new one is ordered using the `http-01` challenge of
//! [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555). Issued certificates are sealed into
//! a passphrase-protected archive, persisted, and handed to [`CertificateHandler`]s.
//!
//! # Usage
//!
//! 1. Describe the certificate with [`CertificateOptions`]. Terms of service must be agreed.
//! 2. Pick a [`Persist`] backend ([`DiskPersist`] survives restarts).
//! 3. Build the orchestrator with your handlers and an authority ([`AcmeFactory`]).
//! 4. Serve `/.well-known/acme-challenge/<token>` through a [`ChallengeResponder`]. With the
//!    `actix` feature, [`responder::service`] does this for actix-web.
//! 5. Call [`Orchestrator::start`].
//!
//! A complete program lives in `demos/renew.rs`.
//!
//! TLS servers pick up the current certificate with [`active_certificate`]. With the `rustls`
//! feature, [`ActiveCertResolver`] plugs it straight into a `rustls::ServerConfig`.
//!
//! # Rate Limits
//!
//! Let's Encrypt applies [rate limits] to issuance. Use the staging directory
//! ([`LETSENCRYPT_STAGING_URL`]) while developing.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod acme;
mod archive;
mod authority;
mod cert;
mod error;
mod handler;
mod options;
mod orchestrator;
mod persist;
#[cfg(feature = "rustls")]
mod tls;

pub mod responder;

#[cfg(test)]
mod test;

pub use crate::{
    acme::{AcmeFactory, Problem},
    archive::{generate_passphrase, open as open_archive, seal as seal_archive},
    authority::{AuthorityContext, AuthorityFactory, AuthorityOrder, HttpChallenge, OrderStatus},
    cert::{create_p256_key, Certificate},
    error::SetupError,
    handler::{CertificateHandler, HostNameHandler, PemExportHandler},
    options::{CertificateInfo, CertificateOptions, LETSENCRYPT_STAGING_URL, LETSENCRYPT_URL},
    orchestrator::{
        active_certificate, LifecycleState, Orchestrator, OrchestratorBuilder, TokenOutcome,
    },
    persist::{
        CertStore, ChallengeRecord, DiskPersist, MemoryPersist, Persist, PersistKey, PersistKind,
    },
    responder::ChallengeResponder,
};
#[cfg(feature = "rustls")]
pub use crate::{
    orchestrator::active_certified_key,
    tls::{certified_key, ActiveCertResolver},
};
