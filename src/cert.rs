use std::{
    fmt,
    io::{BufReader, Cursor},
};

use der::{
    asn1::{Ia5String, Ia5StringRef, PrintableStringRef, Utf8StringRef},
    oid::db::rfc4519,
    Decode as _,
};
use eyre::{eyre, WrapErr as _};
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use time::OffsetDateTime;
use x509_cert::{
    builder::{Builder as _, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};
use zeroize::Zeroizing;

use crate::options::CertificateInfo;

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Creates a CSR for the subject in `info` and signs it with `signer`.
///
/// The common name is repeated in a Subject Alternative Name extension, which is what authorities
/// actually validate against.
pub(crate) fn create_csr(
    signer: &p256::ecdsa::SigningKey,
    info: &CertificateInfo,
) -> eyre::Result<x509_cert::request::CertReq> {
    let subject = info
        .subject()
        .parse::<Name>()
        .wrap_err("invalid certificate subject")?;

    let mut csr = CsrBuilder::new(subject, signer).wrap_err("csr builder")?;

    let san = Ia5String::new(&info.common_name).wrap_err("common name is not IA5")?;
    csr.add_extension(&SubjectAltName(vec![GeneralName::DnsName(san)]))
        .wrap_err("csr san extension")?;

    csr.build::<p256::ecdsa::DerSignature>()
        .wrap_err("build csr")
}

/// An issued certificate chain together with its private key.
///
/// The validity window and subject common name of the end-entity certificate are extracted once
/// when parsing, so reading them from a TLS hook is free.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    private_key_pem: Zeroizing<String>,
    certificate: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    common_name: Option<String>,
}

impl Certificate {
    /// Parses a PEM certificate chain (end-entity first) and a PKCS#8 PEM private key.
    pub fn parse(private_key_pem: Zeroizing<String>, certificate: String) -> eyre::Result<Self> {
        // validate private key
        ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_pem(&private_key_pem)
            .map_err(|err| eyre!("invalid private key: {err}"))?;

        let chain = pem_chain(&certificate)?;
        let cert_ee = chain
            .first() // EE cert is first
            .ok_or_else(|| eyre!("no certificates in chain"))?;

        let cert = x509_cert::Certificate::from_der(cert_ee).wrap_err("invalid certificate")?;
        let validity = &cert.tbs_certificate.validity;

        let not_before = to_offset_date_time(validity.not_before)?;
        let not_after = to_offset_date_time(validity.not_after)?;
        let common_name = common_name(&cert.tbs_certificate.subject);

        Ok(Certificate {
            private_key_pem,
            certificate,
            not_before,
            not_after,
            common_name,
        })
    }

    /// The private key in PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    /// The private key in DER encoding.
    pub fn private_key_der(&self) -> eyre::Result<Zeroizing<Vec<u8>>> {
        let private_key =
            ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_pem(&self.private_key_pem)
                .map_err(|err| eyre!("invalid private key: {err}"))?;
        let der = private_key
            .to_pkcs8_der()
            .map_err(|err| eyre!("private key encoding: {err}"))?;
        Ok(Zeroizing::new(der.as_bytes().to_vec()))
    }

    /// The certificate chain in PEM format.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// The certificate chain in DER format, end-entity first.
    pub fn certificate_chain(&self) -> eyre::Result<Vec<Vec<u8>>> {
        pem_chain(&self.certificate)
    }

    /// Subject common name of the end-entity certificate, if it has one.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Count of whole valid days left. Negative for an expired certificate.
    pub fn valid_days_left(&self) -> i64 {
        (self.not_after - OffsetDateTime::now_utc()).whole_days()
    }

    /// Whether the certificate should be replaced at `now`.
    ///
    /// True when it is not yet valid, or when `now` is within `refresh_early` of expiry. A window
    /// reaching past the representable date range covers the whole validity.
    pub fn needs_renewal(&self, now: OffsetDateTime, refresh_early: std::time::Duration) -> bool {
        let renew_from = time::Duration::try_from(refresh_early)
            .ok()
            .and_then(|window| self.not_after.checked_sub(window));

        match renew_from {
            Some(renew_from) => now < self.not_before || now > renew_from,
            None => true,
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn pem_chain(certificate: &str) -> eyre::Result<Vec<Vec<u8>>> {
    let mut rdr = BufReader::new(Cursor::new(certificate));

    rustls_pemfile::certs(&mut rdr)
        .map(|res| res.map(|cert| cert.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

fn to_offset_date_time(time: x509_cert::time::Time) -> eyre::Result<OffsetDateTime> {
    let secs = time.to_unix_duration().as_secs();
    let secs = i64::try_from(secs).wrap_err("certificate time out of range")?;
    OffsetDateTime::from_unix_timestamp(secs).wrap_err("certificate time out of range")
}

fn common_name(subject: &Name) -> Option<String> {
    subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .filter(|attr| attr.oid == rfc4519::CN)
        .find_map(|attr| directory_string(&attr.value))
}

fn directory_string(value: &der::Any) -> Option<String> {
    if let Ok(utf8) = Utf8StringRef::try_from(value) {
        return Some(utf8.as_str().to_owned());
    }

    if let Ok(printable) = PrintableStringRef::try_from(value) {
        return Some(printable.as_str().to_owned());
    }

    Ia5StringRef::try_from(value)
        .ok()
        .map(|ia5| ia5.as_str().to_owned())
}
