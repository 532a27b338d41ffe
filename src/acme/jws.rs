//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use eyre::eyre;
use p256::ecdsa::{signature::Signer as _, Signature, SigningKey};
use serde::Serialize;
use sha2::{Digest as _, Sha256};

/// JWS Protected Header as defined in [RFC 8555 §6.2].
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// there MUST be a "jwk" field. This field MUST contain the public key corresponding to the
/// private key used to sign the JWS.
/// >
/// > For all other requests, the request is signed using an existing account, and there MUST be a
/// "kid" field. This field MUST contain the account URL received by POSTing to the newAccount
/// resource.
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
#[derive(Debug, Serialize)]
pub(crate) struct JwsProtectedHeader<'a> {
    alg: &'static str,
    nonce: String,
    url: &'a str,

    /// Mutually exclusive with `kid` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    /// Mutually exclusive with `jwk` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

impl<'a> JwsProtectedHeader<'a> {
    pub(crate) fn new_jwk(jwk: Jwk, url: &'a str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256",
            nonce,
            url,
            jwk: Some(jwk),
            kid: None,
        }
    }

    pub(crate) fn new_kid(kid: &'a str, url: &'a str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256",
            nonce,
            url,
            jwk: None,
            kid: Some(kid),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub(crate) struct Jwk {
    alg: &'static str,
    crv: &'static str,
    kty: &'static str,
    #[serde(rename = "use")]
    _use: &'static str,
    x: String,
    y: String,
}

impl TryFrom<&SigningKey> for Jwk {
    type Error = eyre::Error;

    fn try_from(key: &SigningKey) -> eyre::Result<Self> {
        let point = key.verifying_key().to_encoded_point(false);

        let x = point.x().ok_or_else(|| eyre!("public key has no x coordinate"))?;
        let y = point.y().ok_or_else(|| eyre!("public key has no y coordinate"))?;

        Ok(Jwk {
            alg: "ES256",
            crv: "P-256",
            kty: "EC",
            _use: "sig",
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }
}

/// Required members of the JWK in lexical order, as hashed for a thumbprint.
///
/// See [RFC 7638 §3](https://datatracker.ietf.org/doc/html/rfc7638#section-3).
#[derive(Debug, Serialize)]
struct JwkThumb<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

impl<'a> From<&'a Jwk> for JwkThumb<'a> {
    fn from(jwk: &'a Jwk) -> Self {
        JwkThumb {
            crv: jwk.crv,
            kty: jwk.kty,
            x: &jwk.x,
            y: &jwk.y,
        }
    }
}

/// Computes the HTTP-01 key authorization for `token`: `<token>.<base64url(jwk thumbprint)>`.
///
/// See [RFC 8555 §8.1](https://datatracker.ietf.org/doc/html/rfc8555#section-8.1).
pub(crate) fn key_authorization(token: &str, key: &SigningKey) -> eyre::Result<String> {
    let jwk = Jwk::try_from(key)?;
    let thumb = serde_json::to_string(&JwkThumb::from(&jwk))?;
    let digest = Sha256::digest(thumb.as_bytes());
    Ok(format!("{token}.{}", BASE64_URL_SAFE_NO_PAD.encode(digest)))
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize)]
struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Constructs a flattened JWS over `payload` according to [RFC 7515 §5.1].
///
/// A `None` payload produces the empty payload of a POST-as-GET request.
///
/// [RFC 7515 §5.1]: https://datatracker.ietf.org/doc/html/rfc7515#section-5.1
pub(crate) fn sign<T: Serialize + ?Sized>(
    protected: &JwsProtectedHeader<'_>,
    key: &SigningKey,
    payload: Option<&T>,
) -> eyre::Result<String> {
    let protected = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(protected)?);

    let payload = match payload {
        Some(payload) => BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(payload)?),
        None => String::new(),
    };

    let to_sign = format!("{protected}.{payload}");
    let signature: Signature = key.sign(to_sign.as_bytes());
    let signature = BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes());

    let jws = FlattenedJsonJws {
        protected,
        payload,
        signature,
    };

    Ok(serde_json::to_string(&jws)?)
}
