use std::{fs, path::Path, time::Duration};

use eyre::WrapErr as _;
use serde::{Deserialize, Serialize};

use crate::error::SetupError;

/// The main Let's Encrypt directory.
///
/// Not appropriate for testing / development.
pub const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// The staging Let's Encrypt directory.
///
/// Use for testing and development. Doesn't issue "valid" certificates.
pub const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const DEFAULT_REFRESH_EARLY: Duration = Duration::from_secs(14 * 24 * 3600);
const DEFAULT_CHECK_DELAY: Duration = Duration::from_secs(6 * 3600);
const DEFAULT_ORDER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Longer refresh windows would renew every certificate on every check.
const MAX_REFRESH_EARLY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Subject fields of the managed certificate.
///
/// The common name is the one domain the orchestrator manages; the remaining fields only end up
/// in the CSR subject and may be ignored by the authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateInfo {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub locality: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

impl CertificateInfo {
    pub fn new(common_name: impl Into<String>) -> Self {
        CertificateInfo {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    /// Subject as an RFC 4514 string, e.g. `CN=example.org,O=Example`.
    pub(crate) fn subject(&self) -> String {
        let fields = [
            ("CN", Some(&self.common_name)),
            ("OU", self.organizational_unit.as_ref()),
            ("O", self.organization.as_ref()),
            ("L", self.locality.as_ref()),
            ("ST", self.state.as_ref()),
            ("C", self.country.as_ref()),
        ];

        fields
            .into_iter()
            .filter_map(|(attr, value)| {
                let value = value?.trim();
                (!value.is_empty()).then(|| format!("{attr}={}", escape_rdn_value(value)))
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn escape_rdn_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (idx, ch) in value.chars().enumerate() {
        let leading = idx == 0 && (ch == '#' || ch == ' ');
        if leading || matches!(ch, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Options for one managed certificate. Immutable for the lifetime of an orchestrator.
///
/// # Example JSON
///
/// ```json
/// {
///   "directory_url": "https://acme-staging-v02.api.letsencrypt.org/directory",
///   "email": "admin@example.org",
///   "certificate": { "common_name": "www.example.org", "country": "GB" },
///   "terms_of_service_agreed": true,
///   "refresh_early_secs": 1209600,
///   "check_delay_secs": 21600
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateOptions {
    /// Root (directory) endpoint of the authority.
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Contact email for the authority account. Also keys the persisted account key.
    pub email: String,

    /// Subject of the managed certificate.
    pub certificate: CertificateInfo,

    /// Must be set to accept the authority's terms of service.
    #[serde(default)]
    pub terms_of_service_agreed: bool,

    /// How long before expiry a certificate is renewed.
    #[serde(
        rename = "refresh_early_secs",
        with = "duration_secs",
        default = "default_refresh_early"
    )]
    pub refresh_early: Duration,

    /// Delay between background evaluations.
    #[serde(
        rename = "check_delay_secs",
        with = "duration_secs",
        default = "default_check_delay"
    )]
    pub check_delay: Duration,

    /// Delay between order status polls while waiting for an order to become ready.
    #[serde(
        rename = "order_poll_interval_ms",
        with = "duration_millis",
        default = "default_order_poll_interval"
    )]
    pub order_poll_interval: Duration,

    /// Upper bound on waiting for an order to become ready. Unbounded when `None`.
    #[serde(
        rename = "order_ready_timeout_secs",
        with = "opt_duration_secs",
        default
    )]
    pub order_ready_timeout: Option<Duration>,
}

fn default_directory_url() -> String {
    LETSENCRYPT_URL.to_owned()
}

fn default_refresh_early() -> Duration {
    DEFAULT_REFRESH_EARLY
}

fn default_check_delay() -> Duration {
    DEFAULT_CHECK_DELAY
}

fn default_order_poll_interval() -> Duration {
    DEFAULT_ORDER_POLL_INTERVAL
}

impl CertificateOptions {
    /// Options with defaults for everything but the contact and the managed domain.
    ///
    /// Terms of service still have to be agreed explicitly.
    pub fn new(email: impl Into<String>, common_name: impl Into<String>) -> Self {
        CertificateOptions {
            directory_url: default_directory_url(),
            email: email.into(),
            certificate: CertificateInfo::new(common_name),
            terms_of_service_agreed: false,
            refresh_early: DEFAULT_REFRESH_EARLY,
            check_delay: DEFAULT_CHECK_DELAY,
            order_poll_interval: DEFAULT_ORDER_POLL_INTERVAL,
            order_ready_timeout: None,
        }
    }

    pub fn from_json_str(json: &str) -> eyre::Result<Self> {
        serde_json::from_str(json).wrap_err("failed to parse certificate options")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// The managed domain.
    pub fn common_name(&self) -> &str {
        &self.certificate.common_name
    }

    /// Checks the options are usable. Terms of service are checked by the orchestrator.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.email.trim().is_empty() {
            return Err(SetupError::invalid_argument("email", "must not be empty"));
        }

        if self.email.chars().any(char::is_whitespace) {
            return Err(SetupError::invalid_argument(
                "email",
                "must not contain whitespace",
            ));
        }

        let common_name = self.common_name();
        if common_name.trim().is_empty() {
            return Err(SetupError::invalid_argument(
                "certificate.common_name",
                "must not be empty",
            ));
        }

        if common_name != common_name.trim() {
            return Err(SetupError::invalid_argument(
                "certificate.common_name",
                "must not have surrounding whitespace",
            ));
        }

        match reqwest::Url::parse(&self.directory_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(SetupError::invalid_argument(
                    "directory_url",
                    format!("unsupported scheme `{}`", url.scheme()),
                ))
            }
            Err(err) => {
                return Err(SetupError::invalid_argument(
                    "directory_url",
                    err.to_string(),
                ))
            }
        }

        if self.refresh_early > MAX_REFRESH_EARLY {
            return Err(SetupError::invalid_argument(
                "refresh_early",
                format!("must not exceed {} days", MAX_REFRESH_EARLY.as_secs() / 86_400),
            ));
        }

        if self.check_delay.is_zero() {
            return Err(SetupError::invalid_argument(
                "check_delay",
                "must be greater than zero",
            ));
        }

        if self.order_poll_interval.is_zero() {
            return Err(SetupError::invalid_argument(
                "order_poll_interval",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(dur: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(dur.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(dur: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(dur.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        dur: &Option<Duration>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match dur {
            Some(dur) => ser.serialize_some(&dur.as_secs()),
            None => ser.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(de).map(|secs| secs.map(Duration::from_secs))
    }
}
