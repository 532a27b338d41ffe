//! JSON payloads of the RFC 8555 resources this crate touches.

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

use crate::authority::OrderStatus;

/// Serializes to `{}`.
pub(crate) struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// Directory object for ACME client self-configuration.
///
/// See [RFC 8555 §7.1.1].
///
/// [RFC 8555 §7.1.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.1
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,

    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DirectoryMeta {
    pub terms_of_service: Option<String>,
}

/// Request body of a newAccount call.
///
/// See [RFC 8555 §7.3].
///
/// [RFC 8555 §7.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewAccount {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub(crate) fn dns(value: &str) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct NewOrder {
    pub identifiers: Vec<Identifier>,
}

/// Order status as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ApiOrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl From<ApiOrderStatus> for OrderStatus {
    fn from(status: ApiOrderStatus) -> Self {
        match status {
            ApiOrderStatus::Pending => OrderStatus::Pending,
            ApiOrderStatus::Ready => OrderStatus::Ready,
            ApiOrderStatus::Processing => OrderStatus::Processing,
            ApiOrderStatus::Valid => OrderStatus::Valid,
            ApiOrderStatus::Invalid => OrderStatus::Invalid,
        }
    }
}

/// An ACME order object.
///
/// See [RFC 8555 §7.1.3].
///
/// # Example JSON
///
/// ```json
/// {
///   "status": "pending",
///   "identifiers": [{ "type": "dns", "value": "sub.example.com" }],
///   "authorizations": ["https://example.com/acme/authz/PAniVnsZcis"],
///   "finalize": "https://example.com/acme/order/TOlocE8rfgo/finalize"
/// }
/// ```
///
/// [RFC 8555 §7.1.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.3
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Order {
    pub status: ApiOrderStatus,

    #[serde(default)]
    pub authorizations: Vec<String>,

    pub finalize: String,

    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub error: Option<Problem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// An ACME authorization object.
///
/// See [RFC 8555 §7.1.4].
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// Returns the `http-01` challenge, if one is offered.
    pub(crate) fn http_challenge(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c._type == "http-01")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// See [RFC 8555 §7.1.5].
///
/// [RFC 8555 §7.1.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.5
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct Challenge {
    #[serde(rename = "type")]
    pub _type: String,
    pub url: String,
    pub status: ChallengeStatus,
    pub token: String,
}

/// Finalize request carrying the CSR in base64url-encoded DER (not PEM).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Finalize {
    pub csr: String,
}

/// An `application/problem+json` error document.
///
/// See [RFC 8555 §6.7].
///
/// [RFC 8555 §6.7]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.7
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Problem {
    /// Returns true if problem type is "badNonce".
    pub fn is_bad_nonce(&self) -> bool {
        self._type == "urn:ietf:params:acme:error:badNonce" || self._type == "badNonce"
    }

    /// Returns true if problem details indicate that JWS verification failed.
    pub fn is_jws_verification_error(&self) -> bool {
        (self._type == "urn:ietf:params:acme:error:malformed"
            || self._type == "urn:acme:error:malformed")
            && self
                .detail
                .as_deref()
                .is_some_and(|detail| detail == "JWS verification error")
    }

    /// Returns true if the server does not know the account key.
    pub fn is_account_does_not_exist(&self) -> bool {
        self._type == "urn:ietf:params:acme:error:accountDoesNotExist"
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            _ => write!(f, "{}", self._type),
        }
    }
}

impl std::error::Error for Problem {}
